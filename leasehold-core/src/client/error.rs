use reqwest::StatusCode;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the lease controller
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No response arrived within the client-side timeout
    #[error("timed out waiting for the lease server")]
    TimedOut,

    /// The lease terminated by TTL expiry before its holder released it
    #[error("lease expired before being released")]
    Expired,

    /// Release was already requested on this handle
    #[error("lease release was already requested")]
    AlreadyReleased,

    /// The lease is held by another owner
    #[error("lease is held by another owner")]
    OwnershipConflict,

    /// The server holds no lease under this name
    #[error("lease not found")]
    NotFound,

    #[error("lease server responded with unsupported status {0}")]
    UnexpectedStatus(StatusCode),

    #[error("invalid lease server url: {0}")]
    InvalidUrl(String),

    #[error("lease server request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("decoding lease server response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl Error {
    /// The server never answered in time
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::TimedOut)
    }

    /// The caller no longer holds the lease it thought it held
    pub fn is_lease_lost(&self) -> bool {
        matches!(
            self,
            Error::Expired | Error::OwnershipConflict | Error::NotFound
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::TimedOut
        } else {
            Error::Transport(err)
        }
    }
}
