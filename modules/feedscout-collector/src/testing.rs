// Test mocks for the collector.
//
// - ScriptedLauncher / ScriptedSession (BrowserLauncher / FeedSession): replay
//   a fixed sequence of rendered pages, one per scroll, and record lifecycle
//   calls so tests can assert the session was always closed.
// - StaticProbe (LoginProbe): returns a fixed status and counts calls.
//
// Plus HTML builders for feed items, block pages, and home pages.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use browserless_client::BrowserError;

use feedscout_common::{CookieSet, LoginStatus};

use crate::traits::{BrowserLauncher, FeedSession, LoginProbe, RenderedSnapshot};

// ---------------------------------------------------------------------------
// HTML fixtures
// ---------------------------------------------------------------------------

/// One feed item with the given id and like count.
pub fn post_html(id: u64, likes: u64) -> String {
    format!(
        r#"<article data-testid="tweet">
  <div data-testid="User-Name"><a href="/user{id}"><span>User {id}</span></a></div>
  <a href="/user{id}/status/{id}"><time datetime="2026-01-01T00:00:00.000Z">Jan 1</time></a>
  <div data-testid="tweetText">post number {id} #feed</div>
  <div role="group">
    <button data-testid="reply"><span>1</span></button>
    <button data-testid="retweet"><span>2</span></button>
    <button data-testid="like"><span>{likes}</span></button>
  </div>
</article>"#
    )
}

/// A search results page containing the given posts (likes = id).
pub fn feed_html(ids: impl IntoIterator<Item = u64>) -> String {
    let items: String = ids.into_iter().map(|id| post_html(id, id)).collect();
    format!(r#"<html><body><main><section aria-label="Timeline">{items}</section></main></body></html>"#)
}

pub fn block_page_html() -> String {
    r#"<html><body><div><span>Something went wrong. Try reloading.</span></div></body></html>"#
        .to_string()
}

/// A feed with an error banner rendered below its posts.
pub fn feed_with_banner_html(ids: impl IntoIterator<Item = u64>) -> String {
    let items: String = ids.into_iter().map(|id| post_html(id, id)).collect();
    format!(
        r#"<html><body><main><section aria-label="Timeline">{items}</section><div><span>Something went wrong. Try reloading.</span></div></main></body></html>"#
    )
}

pub fn home_html(logged_in: bool) -> String {
    if logged_in {
        r#"<html><body><nav><button data-testid="SideNav_AccountSwitcher_Button"></button></nav></body></html>"#
            .to_string()
    } else {
        r#"<html><body><a href="/login">Log in</a></body></html>"#.to_string()
    }
}

/// Cookie-editor export with an auth cookie for `domain`, expiring at
/// `expires` (epoch seconds).
pub fn cookie_json(domain: &str, expires: f64) -> String {
    format!(
        r#"[
  {{"domain": "{domain}", "name": "auth_token", "value": "secret", "path": "/", "secure": true, "httpOnly": true, "expirationDate": {expires}, "sameSite": "no_restriction"}},
  {{"domain": "{domain}", "name": "ct0", "value": "csrf", "path": "/", "secure": true, "httpOnly": false, "expirationDate": {expires}, "sameSite": "lax"}}
]"#
    )
}

// ---------------------------------------------------------------------------
// ScriptedLauncher
// ---------------------------------------------------------------------------

/// What happened to the sessions a ScriptedLauncher handed out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionLog {
    pub opened: u32,
    pub closed: u32,
    pub scrolls: u32,
    pub navigations: Vec<String>,
    /// Cookie count passed to the last `open`.
    pub cookies_applied: usize,
}

struct Script {
    initial: String,
    frames: Vec<String>,
    landing_url: Option<String>,
    fail_open: bool,
    fail_navigation: bool,
    document_status: Option<u16>,
    fail_scroll_at: Option<u32>,
    cancel_after: Option<(u32, Arc<AtomicBool>)>,
}

/// Replays `frames`: after n scrolls the page shows `frames[n - 1]`, and the
/// last frame repeats once the script runs out. Before any scroll the page
/// shows the initial frame (an empty feed unless overridden).
/// Builder pattern: `.with_initial()`, `.landing_at()`, `.failing_open()`,
/// `.failing_navigation()`, `.answering_status()`, `.failing_scroll_at()`,
/// `.cancel_after()`.
pub struct ScriptedLauncher {
    script: Arc<Script>,
    log: Arc<Mutex<SessionLog>>,
}

impl ScriptedLauncher {
    pub fn new(frames: Vec<String>) -> Self {
        Self {
            script: Arc::new(Script {
                initial: feed_html([]),
                frames,
                landing_url: None,
                fail_open: false,
                fail_navigation: false,
                document_status: None,
                fail_scroll_at: None,
                cancel_after: None,
            }),
            log: Arc::new(Mutex::new(SessionLog::default())),
        }
    }

    fn edit(mut self, f: impl FnOnce(&mut Script)) -> Self {
        // Builders run before any session shares the script.
        if let Some(script) = Arc::get_mut(&mut self.script) {
            f(script);
        }
        self
    }

    pub fn with_initial(self, html: String) -> Self {
        self.edit(|s| s.initial = html)
    }

    /// Report this URL after navigation, e.g. a login redirect.
    pub fn landing_at(self, url: &str) -> Self {
        let url = url.to_string();
        self.edit(|s| s.landing_url = Some(url))
    }

    pub fn failing_open(self) -> Self {
        self.edit(|s| s.fail_open = true)
    }

    pub fn failing_navigation(self) -> Self {
        self.edit(|s| s.fail_navigation = true)
    }

    /// Navigation fails the way a 4xx/5xx search document does.
    pub fn answering_status(self, status: u16) -> Self {
        self.edit(|s| s.document_status = Some(status))
    }

    /// The n-th scroll (1-based) returns an error.
    pub fn failing_scroll_at(self, n: u32) -> Self {
        self.edit(|s| s.fail_scroll_at = Some(n))
    }

    /// Set `flag` once n scrolls have happened.
    pub fn cancel_after(self, n: u32, flag: Arc<AtomicBool>) -> Self {
        self.edit(|s| s.cancel_after = Some((n, flag)))
    }

    pub fn log(&self) -> SessionLog {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrowserLauncher for ScriptedLauncher {
    async fn open(&self, cookies: &CookieSet) -> Result<Box<dyn FeedSession>> {
        if self.script.fail_open {
            bail!("scripted launch failure");
        }
        {
            let mut log = self.log.lock().unwrap();
            log.opened += 1;
            log.cookies_applied = cookies.len();
        }
        Ok(Box::new(ScriptedSession {
            script: self.script.clone(),
            log: self.log.clone(),
            url: "about:blank".to_string(),
            scrolls: 0,
        }))
    }
}

pub struct ScriptedSession {
    script: Arc<Script>,
    log: Arc<Mutex<SessionLog>>,
    url: String,
    scrolls: u32,
}

#[async_trait]
impl FeedSession for ScriptedSession {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        self.log.lock().unwrap().navigations.push(url.to_string());
        if self.script.fail_navigation {
            bail!("scripted navigation timeout for {url}");
        }
        if let Some(status) = self.script.document_status {
            return Err(BrowserError::HttpStatus {
                url: url.to_string(),
                status,
            }
            .into());
        }
        self.url = self
            .script
            .landing_url
            .clone()
            .unwrap_or_else(|| url.to_string());
        Ok(())
    }

    async fn scroll_once(&mut self) -> Result<()> {
        self.scrolls += 1;
        self.log.lock().unwrap().scrolls += 1;
        if self.script.fail_scroll_at == Some(self.scrolls) {
            bail!("scripted scroll failure at {}", self.scrolls);
        }
        if let Some((n, flag)) = &self.script.cancel_after {
            if self.scrolls >= *n {
                flag.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn current_content(&self) -> Result<RenderedSnapshot> {
        let html = match (self.scrolls as usize).checked_sub(1) {
            None => &self.script.initial,
            Some(i) => self
                .script
                .frames
                .get(i)
                .or_else(|| self.script.frames.last())
                .unwrap_or(&self.script.initial),
        };
        Ok(RenderedSnapshot::new(self.url.clone(), html.clone()))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.log.lock().unwrap().closed += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StaticProbe
// ---------------------------------------------------------------------------

/// Returns a fixed login status (or error) and counts how often it ran.
pub struct StaticProbe {
    status: Option<LoginStatus>,
    calls: AtomicU32,
}

impl StaticProbe {
    pub fn new(status: LoginStatus) -> Self {
        Self {
            status: Some(status),
            calls: AtomicU32::new(0),
        }
    }

    /// A probe whose every call fails.
    pub fn failing() -> Self {
        Self {
            status: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LoginProbe for StaticProbe {
    async fn probe(&self, _cookies: &CookieSet) -> Result<LoginStatus> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.status {
            Some(status) => Ok(status),
            None => bail!("scripted probe failure"),
        }
    }
}
