// Browser bridge: adapts browserless_client::BrowserSession to FeedSession.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use browserless_client::{BrowserOptions, BrowserSession, CookieSpec};
use tracing::debug;

use feedscout_common::{CollectorConfig, CookieSet};

use crate::traits::{BrowserLauncher, FeedSession, RenderedSnapshot};

/// Launches one Chromium context per run, locally or over a remote CDP endpoint.
pub struct ChromeLauncher {
    options: BrowserOptions,
    settle: Duration,
}

impl ChromeLauncher {
    pub fn new(options: BrowserOptions, settle: Duration) -> Self {
        Self { options, settle }
    }

    pub fn from_config(config: &CollectorConfig) -> Self {
        let options = BrowserOptions {
            endpoint: config.chrome_url.clone(),
            chrome_bin: config.chrome_bin.clone(),
            navigation_timeout: config.navigation_timeout,
            ..BrowserOptions::default()
        };
        Self::new(options, config.scroll_settle)
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn open(&self, cookies: &CookieSet) -> Result<Box<dyn FeedSession>> {
        let specs = cookie_specs(cookies);
        let inner = BrowserSession::open(&self.options, &specs)
            .await
            .context("Failed to open browser session")?;
        Ok(Box::new(ChromeSession {
            inner,
            settle: self.settle,
        }))
    }
}

struct ChromeSession {
    inner: BrowserSession,
    settle: Duration,
}

#[async_trait]
impl FeedSession for ChromeSession {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        debug!(url, "Navigating");
        self.inner.goto(url).await?;
        Ok(())
    }

    async fn scroll_once(&mut self) -> Result<()> {
        self.inner.scroll_viewport().await?;
        // Pace scrolling so lazy items render and we don't look like a bot.
        tokio::time::sleep(self.settle).await;
        Ok(())
    }

    async fn current_content(&self) -> Result<RenderedSnapshot> {
        let html = self.inner.content().await?;
        let url = self.inner.current_url().await?.unwrap_or_default();
        Ok(RenderedSnapshot { url, html })
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.inner.close().await?;
        Ok(())
    }
}

pub(crate) fn cookie_specs(set: &CookieSet) -> Vec<CookieSpec> {
    set.iter()
        .map(|c| CookieSpec {
            name: c.name.clone(),
            value: c.value.clone(),
            domain: c.domain.clone(),
            path: c.path.clone(),
            secure: c.secure,
            http_only: c.http_only,
            expires: c.expires.filter(|e| *e > 0.0),
            same_site: c.same_site.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedscout_common::Cookie;

    #[test]
    fn session_cookies_drop_negative_expiry() {
        let mut set = CookieSet::new("x.com");
        set.insert(Cookie {
            domain: ".x.com".into(),
            name: "ct0".into(),
            value: "token".into(),
            path: "/".into(),
            secure: true,
            http_only: false,
            expires: Some(-1.0),
            same_site: Some("lax".into()),
        });

        let specs = cookie_specs(&set);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "ct0");
        assert_eq!(specs[0].domain, ".x.com");
        assert!(specs[0].expires.is_none());
        assert_eq!(specs[0].same_site.as_deref(), Some("lax"));
    }

    #[test]
    fn launcher_takes_endpoint_from_config() {
        let config = CollectorConfig {
            chrome_url: Some("ws://browserless:3000".into()),
            ..CollectorConfig::default()
        };
        let launcher = ChromeLauncher::from_config(&config);
        assert_eq!(launcher.options.endpoint.as_deref(), Some("ws://browserless:3000"));
        assert_eq!(launcher.settle, config.scroll_settle);
    }
}
