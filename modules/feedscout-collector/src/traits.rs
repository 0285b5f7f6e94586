// Trait seams for the collection engine.
//
// BrowserLauncher / FeedSession hide the browser automation layer, LoginProbe
// hides the authenticated home-page check, ProgressSink carries live progress
// to whoever is watching. Production impls live in `browser.rs` and
// `session_store.rs`; scripted mocks live in `testing.rs`.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use feedscout_common::{CookieSet, LoginStatus, ProgressEvent};

/// Rendered page state handed from a session to the extractor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RenderedSnapshot {
    pub url: String,
    pub html: String,
}

impl RenderedSnapshot {
    pub fn new(url: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            html: html.into(),
        }
    }

    /// Fast hash used to notice that new content rendered. Not cryptographic.
    pub fn fingerprint(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.url.hash(&mut hasher);
        self.html.hash(&mut hasher);
        hasher.finish()
    }
}

// ---------------------------------------------------------------------------
// Browser
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Open a fresh isolated browsing context with `cookies` installed before
    /// any navigation.
    async fn open(&self, cookies: &CookieSet) -> Result<Box<dyn FeedSession>>;
}

/// One browsing context, owned by exactly one run. `close` must be called on
/// every exit path.
#[async_trait]
pub trait FeedSession: Send + Sync {
    async fn navigate(&mut self, url: &str) -> Result<()>;

    /// Scroll one viewport, then hold for the settle delay.
    async fn scroll_once(&mut self) -> Result<()>;

    async fn current_content(&self) -> Result<RenderedSnapshot>;

    async fn close(self: Box<Self>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Login
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LoginProbe: Send + Sync {
    /// Report whether `cookies` still authenticate against the site.
    async fn probe(&self, cookies: &CookieSet) -> Result<LoginStatus>;
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

/// Discards progress events.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _event: ProgressEvent) {}
}

impl ProgressSink for UnboundedSender<ProgressEvent> {
    fn on_progress(&self, event: ProgressEvent) {
        // Receiver gone means nobody is watching.
        let _ = self.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_tracks_content() {
        let a = RenderedSnapshot::new("https://x.com/search", "<p>1</p>");
        let b = RenderedSnapshot::new("https://x.com/search", "<p>2</p>");
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[tokio::test]
    async fn channel_sink_forwards_events() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let event = ProgressEvent {
            scroll_index: 1,
            unique_count: 4,
            new_in_batch: 4,
        };
        tx.on_progress(event);
        assert_eq!(rx.recv().await, Some(event));
    }
}
