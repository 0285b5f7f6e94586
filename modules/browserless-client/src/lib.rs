pub mod error;

pub use error::{BrowserError, Result};

use std::path::PathBuf;
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, CookieSameSite, SetCookiesParams, TimeSinceEpoch,
};
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Scrolls the page by exactly one viewport height.
const SCROLL_VIEWPORT_JS: &str = "window.scrollBy(0, window.innerHeight)";

/// How a session reaches a browser.
#[derive(Debug, Clone)]
pub struct BrowserOptions {
    /// Remote CDP endpoint (`http://host:9222` or a Browserless `ws://` URL).
    /// When unset a local Chromium is launched with a throwaway profile.
    pub endpoint: Option<String>,
    /// Explicit Chromium binary for local launches.
    pub chrome_bin: Option<PathBuf>,
    pub navigation_timeout: Duration,
    pub user_agent: String,
    pub window_size: (u32, u32),
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            endpoint: None,
            chrome_bin: None,
            navigation_timeout: Duration::from_secs(60),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            window_size: (1366, 768),
        }
    }
}

/// A cookie in the shape CDP `Network.setCookies` expects.
#[derive(Debug, Clone)]
pub struct CookieSpec {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    /// Seconds since the Unix epoch. `None` means a session cookie.
    pub expires: Option<f64>,
    /// "Strict", "Lax" or "None" (case-insensitive).
    pub same_site: Option<String>,
}

impl CookieSpec {
    fn to_param(&self) -> Result<CookieParam> {
        let mut builder = CookieParam::builder()
            .name(self.name.clone())
            .value(self.value.clone())
            .domain(self.domain.clone())
            .path(self.path.clone())
            .secure(self.secure)
            .http_only(self.http_only);

        if let Some(expires) = self.expires {
            builder = builder.expires(TimeSinceEpoch::new(expires));
        }
        if let Some(same_site) = self.same_site.as_deref().and_then(parse_same_site) {
            builder = builder.same_site(same_site);
        }

        builder.build().map_err(|reason| BrowserError::InvalidCookie {
            name: self.name.clone(),
            reason,
        })
    }
}

fn cookie_params(cookies: &[CookieSpec]) -> Result<Vec<CookieParam>> {
    cookies.iter().map(CookieSpec::to_param).collect()
}

fn parse_same_site(raw: &str) -> Option<CookieSameSite> {
    match raw.to_ascii_lowercase().as_str() {
        "strict" => Some(CookieSameSite::Strict),
        "lax" => Some(CookieSameSite::Lax),
        "none" | "no_restriction" => Some(CookieSameSite::None),
        _ => None,
    }
}

#[derive(Deserialize)]
struct VersionInfo {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

/// Resolve an `http://` DevTools endpoint to its browser websocket URL via
/// `/json/version`. `ws://` and `wss://` URLs pass through unchanged.
pub async fn resolve_ws_url(endpoint: &str) -> Result<String> {
    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        return Ok(endpoint.to_string());
    }

    let url = format!("{}/json/version", endpoint.trim_end_matches('/'));
    let resp = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?
        .get(&url)
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        let message = resp.text().await.unwrap_or_default();
        return Err(BrowserError::Endpoint {
            status: status.as_u16(),
            message,
        });
    }

    let info: VersionInfo = resp.json().await?;
    Ok(info.web_socket_debugger_url)
}

/// One isolated browsing context with a single page.
///
/// Each session owns its own browser context, so cookies and storage never
/// leak between runs. Call [`BrowserSession::close`] when done; dropping the
/// session only stops the CDP handler task.
pub struct BrowserSession {
    browser: Browser,
    page: Page,
    context_id: BrowserContextId,
    handler: JoinHandle<()>,
    navigation_timeout: Duration,
    profile: Option<tempfile::TempDir>,
}

impl BrowserSession {
    /// Start (or connect to) a browser, create a fresh context, and install
    /// `cookies` before any navigation happens.
    ///
    /// A failure after the context exists disposes it before returning.
    pub async fn open(options: &BrowserOptions, cookies: &[CookieSpec]) -> Result<Self> {
        let params = cookie_params(cookies)?;

        let (mut browser, mut handler, profile) = match options.endpoint.as_deref() {
            Some(endpoint) => {
                let ws_url = resolve_ws_url(endpoint).await?;
                info!(endpoint, "Connecting to remote browser");
                let (browser, handler) = Browser::connect(ws_url).await?;
                (browser, handler, None)
            }
            None => {
                let profile = tempfile::tempdir()
                    .map_err(|e| BrowserError::Launch(format!("temp profile dir: {e}")))?;
                let mut builder = BrowserConfig::builder()
                    .user_data_dir(profile.path())
                    .window_size(options.window_size.0, options.window_size.1)
                    .no_sandbox()
                    .arg("--disable-gpu")
                    .arg("--disable-dev-shm-usage")
                    .arg("--disable-blink-features=AutomationControlled");
                if let Some(ref bin) = options.chrome_bin {
                    builder = builder.chrome_executable(bin);
                }
                let config = builder.build().map_err(BrowserError::Launch)?;

                info!("Launching local headless Chromium");
                let (browser, handler) = Browser::launch(config).await?;
                (browser, handler, Some(profile))
            }
        };

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "CDP handler event error");
                }
            }
        });

        let context_id = match browser.execute(CreateBrowserContextParams::default()).await {
            Ok(resp) => resp.result.browser_context_id,
            Err(e) => {
                if profile.is_some() {
                    let _ = browser.close().await;
                }
                handler.abort();
                return Err(e.into());
            }
        };

        let prepared = async {
            let target = CreateTargetParams::builder()
                .url("about:blank")
                .browser_context_id(context_id.clone())
                .build()
                .map_err(BrowserError::Cdp)?;
            let page = browser.new_page(target).await?;
            page.set_user_agent(options.user_agent.as_str()).await?;
            if !params.is_empty() {
                page.execute(SetCookiesParams::new(params)).await?;
            }
            Ok::<_, BrowserError>(page)
        }
        .await;

        let page = match prepared {
            Ok(page) => page,
            Err(e) => {
                warn!(error = %e, "Session setup failed, disposing browser context");
                if let Err(dispose) = browser
                    .execute(DisposeBrowserContextParams::new(context_id))
                    .await
                {
                    warn!(error = %dispose, "Failed to dispose browser context");
                }
                if profile.is_some() {
                    let _ = browser.close().await;
                }
                handler.abort();
                return Err(e);
            }
        };
        debug!(cookies = cookies.len(), "Cookies installed in fresh context");

        Ok(Self {
            browser,
            page,
            context_id,
            handler,
            navigation_timeout: options.navigation_timeout,
            profile,
        })
    }

    /// Navigate and wait for the load event, bounded by the navigation timeout.
    /// A main document answered with a 4xx/5xx status is an error.
    pub async fn goto(&self, url: &str) -> Result<()> {
        let navigation = async {
            self.page.goto(url).await?;
            let request = self.page.wait_for_navigation_response().await?;
            Ok::<_, CdpError>(request.and_then(|r| r.response.as_ref().map(|resp| resp.status)))
        };
        match tokio::time::timeout(self.navigation_timeout, navigation).await {
            Ok(Ok(status)) => check_document_status(url, status),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(BrowserError::NavigationTimeout {
                url: url.to_string(),
                secs: self.navigation_timeout.as_secs(),
            }),
        }
    }

    pub async fn scroll_viewport(&self) -> Result<()> {
        self.page.evaluate(SCROLL_VIEWPORT_JS).await?;
        Ok(())
    }

    /// Fully rendered outer HTML of the current document.
    pub async fn content(&self) -> Result<String> {
        Ok(self.page.content().await?)
    }

    pub async fn current_url(&self) -> Result<Option<String>> {
        Ok(self.page.url().await?)
    }

    /// Release the page, the browser context and the browser connection.
    /// Every step runs even if an earlier one fails; the first error wins.
    pub async fn close(mut self) -> Result<()> {
        let mut first_err: Option<BrowserError> = None;

        if let Err(e) = self.page.clone().close().await {
            warn!(error = %e, "Failed to close page");
            first_err.get_or_insert(e.into());
        }
        if let Err(e) = self
            .browser
            .execute(DisposeBrowserContextParams::new(self.context_id.clone()))
            .await
        {
            warn!(error = %e, "Failed to dispose browser context");
            first_err.get_or_insert(e.into());
        }
        if self.profile.is_some() {
            // Local launch: shut the whole process down.
            if let Err(e) = self.browser.close().await {
                warn!(error = %e, "Failed to close browser");
                first_err.get_or_insert(e.into());
            }
            let _ = self.browser.wait().await;
        }
        self.handler.abort();

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// `None` means no HTTP response was recorded (e.g. `about:blank`).
fn check_document_status(url: &str, status: Option<i64>) -> Result<()> {
    match status {
        None => Ok(()),
        Some(code) if (200..400).contains(&code) => Ok(()),
        Some(code) => Err(BrowserError::HttpStatus {
            url: url.to_string(),
            status: u16::try_from(code).unwrap_or(u16::MAX),
        }),
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie(same_site: Option<&str>, expires: Option<f64>) -> CookieSpec {
        CookieSpec {
            name: "auth_token".into(),
            value: "abc".into(),
            domain: ".x.com".into(),
            path: "/".into(),
            secure: true,
            http_only: true,
            expires,
            same_site: same_site.map(String::from),
        }
    }

    #[test]
    fn same_site_parsing_is_case_insensitive() {
        assert!(matches!(parse_same_site("LAX"), Some(CookieSameSite::Lax)));
        assert!(matches!(parse_same_site("strict"), Some(CookieSameSite::Strict)));
        assert!(matches!(
            parse_same_site("no_restriction"),
            Some(CookieSameSite::None)
        ));
        assert!(parse_same_site("unspecified").is_none());
    }

    #[test]
    fn cookie_param_carries_fields() {
        let param = cookie(Some("Lax"), Some(1_900_000_000.0)).to_param().unwrap();
        assert_eq!(param.name, "auth_token");
        assert_eq!(param.domain.as_deref(), Some(".x.com"));
        assert_eq!(param.secure, Some(true));
        assert_eq!(param.http_only, Some(true));
        assert!(param.expires.is_some());
    }

    #[test]
    fn session_cookie_has_no_expiry() {
        let param = cookie(None, None).to_param().unwrap();
        assert!(param.expires.is_none());
        assert!(param.same_site.is_none());
    }

    #[test]
    fn document_status_classification() {
        let url = "https://x.com/search?q=rust";
        assert!(check_document_status(url, None).is_ok());
        assert!(check_document_status(url, Some(200)).is_ok());
        assert!(check_document_status(url, Some(304)).is_ok());

        let err = check_document_status(url, Some(429)).unwrap_err();
        assert!(matches!(err, BrowserError::HttpStatus { status: 429, .. }));
        assert!(err.is_rate_limited());

        let err = check_document_status(url, Some(503)).unwrap_err();
        assert!(matches!(err, BrowserError::HttpStatus { status: 503, .. }));
        assert!(!err.is_rate_limited());
        assert!(err.to_string().contains("HTTP 503"));
    }

    #[test]
    fn cookie_params_convert_whole_set() {
        let params = cookie_params(&[cookie(Some("Lax"), None), cookie(None, None)]).unwrap();
        assert_eq!(params.len(), 2);
        assert!(cookie_params(&[]).unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_against_dead_endpoint_fails_before_any_context() {
        let options = BrowserOptions {
            endpoint: Some("http://127.0.0.1:9".into()),
            ..BrowserOptions::default()
        };
        let err = match BrowserSession::open(&options, &[cookie(None, None)]).await {
            Ok(_) => panic!("no browser listens on the discard port"),
            Err(e) => e,
        };
        assert!(matches!(err, BrowserError::Network(_)));
    }

    #[tokio::test]
    async fn ws_endpoint_passes_through() {
        let url = resolve_ws_url("ws://localhost:3000?token=t").await.unwrap();
        assert_eq!(url, "ws://localhost:3000?token=t");
    }
}
