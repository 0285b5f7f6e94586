//! Search URL construction.
//!
//! A request's query text is either free-form search syntax, which gets the
//! request's filters appended as site operators, or a full site URL, which is
//! normalized to the primary domain and used as-is.

use chrono::{DateTime, Utc};
use url::Url;

use feedscout_common::{CollectError, SearchRequest, SortOrder};

/// Hosts recognized as the target site, including legacy and mobile aliases.
const SITE_HOSTS: &[&str] = &[
    "x.com",
    "www.x.com",
    "mobile.x.com",
    "twitter.com",
    "www.twitter.com",
    "mobile.twitter.com",
];

const OPERATOR_TIME_FORMAT: &str = "%Y-%m-%d_%H:%M:%S_UTC";

#[derive(Debug, Clone)]
pub struct QueryBuilder {
    base_url: String,
    domain: String,
}

impl QueryBuilder {
    pub fn new(site_base_url: impl Into<String>, site_domain: impl Into<String>) -> Self {
        Self {
            base_url: site_base_url.into().trim_end_matches('/').to_string(),
            domain: site_domain.into(),
        }
    }

    pub fn build(&self, request: &SearchRequest) -> Result<String, CollectError> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(CollectError::InvalidRequest("query is empty".into()));
        }

        if is_site_url(query) {
            return self.normalize_url(query);
        }

        let search = format!("{}/search", self.base_url);
        let mut url = Url::parse(&search)
            .map_err(|e| CollectError::InvalidRequest(format!("bad site base url {search}: {e}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("q", &enhance_query(query, request));
            pairs.append_pair("src", "typed_query");
            if request.sort == SortOrder::Recency {
                pairs.append_pair("f", "live");
            }
        }
        Ok(url.into())
    }

    /// Rewrite any recognized site host to the primary domain over https.
    pub fn normalize_url(&self, raw: &str) -> Result<String, CollectError> {
        let mut url = parse_loose(raw)
            .ok_or_else(|| CollectError::InvalidRequest(format!("not a valid url: {raw}")))?;
        url.set_scheme("https")
            .map_err(|_| CollectError::InvalidRequest(format!("unsupported scheme: {raw}")))?;
        url.set_host(Some(&self.domain))
            .map_err(|e| CollectError::InvalidRequest(format!("bad site domain: {e}")))?;
        Ok(url.into())
    }
}

/// True when `text` points at the target site rather than being search syntax.
pub fn is_site_url(text: &str) -> bool {
    let text = text.trim();
    if text.contains(char::is_whitespace) {
        return false;
    }
    parse_loose(text)
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .is_some_and(|host| SITE_HOSTS.contains(&host.as_str()))
}

/// The `q` parameter of a search URL, decoded.
pub fn extract_query_from_url(raw: &str) -> Option<String> {
    parse_loose(raw)?
        .query_pairs()
        .find(|(k, _)| k == "q")
        .map(|(_, v)| v.into_owned())
}

fn parse_loose(raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if raw.starts_with("http://") || raw.starts_with("https://") {
        Url::parse(raw).ok()
    } else {
        Url::parse(&format!("https://{raw}")).ok()
    }
}

/// Append language, time window and post-kind operators to the query.
/// Operators the user already wrote are left alone.
pub fn enhance_query(query: &str, request: &SearchRequest) -> String {
    let lower = query.to_ascii_lowercase();
    let mut parts = vec![query.to_string()];

    if let Some(lang) = request.language_filter() {
        if !lower.contains("lang:") {
            parts.push(format!("lang:{lang}"));
        }
    }

    if let Some(window) = request.window {
        if let Some(start) = window.start {
            if !lower.contains("since:") {
                parts.push(format!("since:{}", operator_time(start)));
            }
        }
        if let Some(end) = window.end {
            if !lower.contains("until:") {
                parts.push(format!("until:{}", operator_time(end)));
            }
        }
    }

    if !request.include_replies {
        parts.push("-filter:replies".to_string());
    }
    if !request.include_reposts {
        parts.push("-filter:retweets".to_string());
    }
    // No operator for quotes; they are dropped at merge time.

    parts.join(" ")
}

fn operator_time(at: DateTime<Utc>) -> String {
    at.format(OPERATOR_TIME_FORMAT).to_string()
}
