pub mod config;
pub mod error;
pub mod types;

pub use config::CollectorConfig;
pub use error::{CollectError, CookieImportError};
pub use types::*;
