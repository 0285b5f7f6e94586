use thiserror::Error;

/// Failures that prevent a collection run from producing a result.
///
/// Only `InvalidRequest`, `NotAuthenticated` and `SessionExpired` escape the
/// engine; everything after a session opens is folded into the returned
/// `CollectionResult` instead.
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not authenticated: no cookies imported")]
    NotAuthenticated,

    #[error("Session expired: cookies must be re-imported")]
    SessionExpired,

    #[error("Navigation error: {0}")]
    Navigation(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Collection cancelled")]
    Cancelled,
}

impl CollectError {
    /// True for errors the caller must fix before retrying (bad input, cookies).
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            CollectError::InvalidRequest(_)
                | CollectError::NotAuthenticated
                | CollectError::SessionExpired
        )
    }
}

#[derive(Error, Debug)]
pub enum CookieImportError {
    #[error("Invalid cookie format: {0}")]
    InvalidCookieFormat(String),

    #[error("No cookies for domain {expected}")]
    WrongDomain { expected: String },

    #[error("Failed to persist cookies: {0}")]
    Persist(#[from] std::io::Error),
}
