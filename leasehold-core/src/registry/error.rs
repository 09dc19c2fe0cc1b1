pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the lease registry
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// No lease is currently held under the requested name
    #[error("no lease held for name")]
    LeaseNotFound,

    /// The lease is held by a different owner
    #[error("lease is held by another owner")]
    OwnershipConflict { owner: String },
}
