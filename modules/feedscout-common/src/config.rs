use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::types::{ScoreWeights, StopLimits};

/// Collector configuration loaded from environment variables (and `.env`).
/// Everything has a default; only malformed values are errors.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    // Session store
    pub cookie_store_path: PathBuf,

    // Target site
    pub site_domain: String,
    pub site_base_url: String,

    // Browser (remote CDP endpoint, or a local binary)
    pub chrome_url: Option<String>,
    pub chrome_bin: Option<PathBuf>,
    pub navigation_timeout: Duration,
    pub scroll_settle: Duration,

    // Content polling after each scroll
    pub content_wait: Duration,
    pub content_poll: Duration,

    // Stop conditions
    pub no_new_content_threshold: u32,
    pub rate_limit_threshold: u32,
    pub empty_snapshot_retries: u32,
    pub time_budget: Option<Duration>,

    // Aggregation
    pub top_k: usize,
    pub score_weights: ScoreWeights,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        let limits = StopLimits::default();
        Self {
            cookie_store_path: PathBuf::from("./browser_data/cookies.json"),
            site_domain: "x.com".to_string(),
            site_base_url: "https://x.com".to_string(),
            chrome_url: None,
            chrome_bin: None,
            navigation_timeout: Duration::from_secs(60),
            scroll_settle: Duration::from_millis(1500),
            content_wait: Duration::from_secs(5),
            content_poll: Duration::from_millis(250),
            no_new_content_threshold: limits.no_new_content_threshold,
            rate_limit_threshold: limits.rate_limit_threshold,
            empty_snapshot_retries: limits.empty_snapshot_retries,
            time_budget: limits.time_budget,
            top_k: 5,
            score_weights: ScoreWeights::default(),
        }
    }
}

impl CollectorConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let config = Self {
            cookie_store_path: std::env::var("COOKIE_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.cookie_store_path),
            site_domain: std::env::var("SITE_DOMAIN").unwrap_or(defaults.site_domain),
            site_base_url: std::env::var("SITE_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.site_base_url),
            chrome_url: non_empty_env("CHROME_URL"),
            chrome_bin: non_empty_env("CHROME_BIN").map(PathBuf::from),
            navigation_timeout: Duration::from_secs(env_parse("NAVIGATION_TIMEOUT_SECS", 60)?),
            scroll_settle: Duration::from_millis(env_parse("SCROLL_SETTLE_MS", 1500)?),
            content_wait: Duration::from_millis(env_parse("CONTENT_WAIT_MS", 5000)?),
            content_poll: Duration::from_millis(env_parse("CONTENT_POLL_MS", 250)?),
            no_new_content_threshold: env_parse(
                "NO_NEW_CONTENT_THRESHOLD",
                defaults.no_new_content_threshold,
            )?,
            rate_limit_threshold: env_parse("RATE_LIMIT_THRESHOLD", defaults.rate_limit_threshold)?,
            empty_snapshot_retries: env_parse(
                "EMPTY_SNAPSHOT_RETRIES",
                defaults.empty_snapshot_retries,
            )?,
            time_budget: match non_empty_env("TIME_BUDGET_SECS") {
                Some(raw) => Some(Duration::from_secs(
                    raw.parse()
                        .with_context(|| format!("TIME_BUDGET_SECS must be a number, got {raw:?}"))?,
                )),
                None => None,
            },
            top_k: env_parse("TOP_K", defaults.top_k)?,
            score_weights: defaults.score_weights,
        };

        if config.no_new_content_threshold == 0 || config.rate_limit_threshold == 0 {
            anyhow::bail!("NO_NEW_CONTENT_THRESHOLD and RATE_LIMIT_THRESHOLD must be at least 1");
        }

        config.log_redacted();
        Ok(config)
    }

    pub fn stop_limits(&self) -> StopLimits {
        StopLimits {
            no_new_content_threshold: self.no_new_content_threshold,
            rate_limit_threshold: self.rate_limit_threshold,
            time_budget: self.time_budget,
            empty_snapshot_retries: self.empty_snapshot_retries,
        }
    }

    /// Domains whose cookies authenticate against the target site.
    pub fn cookie_domains(&self) -> Vec<String> {
        let mut domains = vec![self.site_domain.clone()];
        if self.site_domain == "x.com" {
            domains.push("twitter.com".to_string());
        }
        domains
    }

    pub fn search_url(&self) -> String {
        format!("{}/search", self.site_base_url)
    }

    pub fn home_url(&self) -> String {
        format!("{}/home", self.site_base_url)
    }

    fn log_redacted(&self) {
        fn preview_opt(val: &Option<String>) -> String {
            match val {
                // Endpoints may embed tokens (`?token=`); show host part only.
                Some(v) if !v.is_empty() => {
                    let cut = v.find('?').unwrap_or(v.len());
                    format!("{}...({} chars)", &v[..cut], v.len())
                }
                _ => "<not set>".to_string(),
            }
        }

        tracing::info!("Config loaded:");
        tracing::info!("  COOKIE_STORE_PATH: {}", self.cookie_store_path.display());
        tracing::info!("  SITE_BASE_URL: {}", self.site_base_url);
        tracing::info!("  CHROME_URL: {}", preview_opt(&self.chrome_url));
        tracing::info!(
            no_new_content = self.no_new_content_threshold,
            rate_limit = self.rate_limit_threshold,
            time_budget_secs = self.time_budget.map(|d| d.as_secs()),
            "  Stop limits"
        );
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty_env(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{key} must be a valid number, got {raw:?}: {e}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_stop_limit_defaults() {
        let config = CollectorConfig::default();
        assert_eq!(config.stop_limits(), StopLimits::default());
        assert_eq!(config.search_url(), "https://x.com/search");
        assert_eq!(config.home_url(), "https://x.com/home");
    }

    #[test]
    fn x_accepts_legacy_twitter_cookies() {
        let config = CollectorConfig::default();
        assert_eq!(config.cookie_domains(), vec!["x.com", "twitter.com"]);
    }

    #[test]
    fn env_parse_falls_back_to_default() {
        let value: u32 = env_parse("FEEDSCOUT_TEST_UNSET_VAR", 7).unwrap();
        assert_eq!(value, 7);
    }
}
