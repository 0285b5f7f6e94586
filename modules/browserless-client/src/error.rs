use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrowserError>;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Endpoint error (status {status}): {message}")]
    Endpoint { status: u16, message: String },

    #[error("Launch failed: {0}")]
    Launch(String),

    #[error("CDP error: {0}")]
    Cdp(String),

    #[error("Invalid cookie {name}: {reason}")]
    InvalidCookie { name: String, reason: String },

    #[error("Navigation to {url} timed out after {secs}s")]
    NavigationTimeout { url: String, secs: u64 },

    #[error("Navigation to {url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },
}

impl BrowserError {
    /// The site answered the document request with 429 Too Many Requests.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, BrowserError::HttpStatus { status: 429, .. })
    }
}

impl From<reqwest::Error> for BrowserError {
    fn from(err: reqwest::Error) -> Self {
        BrowserError::Network(err.to_string())
    }
}

impl From<chromiumoxide::error::CdpError> for BrowserError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        BrowserError::Cdp(err.to_string())
    }
}
