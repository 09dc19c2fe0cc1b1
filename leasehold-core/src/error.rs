pub type Error = anyhow::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Returned when a wait is interrupted by a cancellation token rather than
/// reaching an outcome.
#[derive(Debug, thiserror::Error)]
#[error("cancelled")]
pub struct CancelError;

pub fn is_cancelled(e: &Error) -> bool {
    e.chain()
        .any(|cause| cause.downcast_ref::<CancelError>().is_some())
}
