pub mod aggregate;
pub mod browser;
pub mod engine;
pub mod extractor;
pub mod query;
pub mod session_store;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;
pub mod wait;

pub use aggregate::Aggregator;
pub use browser::ChromeLauncher;
pub use engine::{CollectionEngine, EngineSettings};
pub use extractor::{normalize_count, Extraction, PostExtractor};
pub use query::QueryBuilder;
pub use session_store::{CookieStore, HomePageProbe, StoreStatus};
pub use traits::{BrowserLauncher, FeedSession, LoginProbe, NoProgress, ProgressSink, RenderedSnapshot};
pub use wait::{poll_until, WaitOutcome, WaitPolicy};
