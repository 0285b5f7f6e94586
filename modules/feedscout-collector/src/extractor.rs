// Feed extraction from rendered HTML.
//
// Parses the current snapshot into Posts. Items without a status link are
// skipped and counted as noise; the batch itself never fails. Visible page
// text outside feed items is checked for block or challenge markers, since an
// error banner can render below posts that are still in the DOM.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use feedscout_common::{Author, EngagementMetrics, LoginStatus, Post};

use crate::traits::RenderedSnapshot;

// --- Selectors ---

fn sel(css: &str) -> Selector {
    Selector::parse(css).expect("valid selector")
}

static ARTICLE: LazyLock<Selector> = LazyLock::new(|| sel(r#"article[data-testid="tweet"]"#));
static ARTICLE_FALLBACK: LazyLock<Selector> = LazyLock::new(|| sel("article"));
static STATUS_LINK: LazyLock<Selector> = LazyLock::new(|| sel(r#"a[href*="/status/"]"#));
static TIME: LazyLock<Selector> = LazyLock::new(|| sel("time[datetime]"));
static USER_NAME: LazyLock<Selector> = LazyLock::new(|| sel(r#"[data-testid="User-Name"] span"#));
static TEXT: LazyLock<Selector> = LazyLock::new(|| sel(r#"[data-testid="tweetText"]"#));
static LIKES: LazyLock<Selector> =
    LazyLock::new(|| sel(r#"[data-testid="like"], [data-testid="unlike"]"#));
static REPOSTS: LazyLock<Selector> =
    LazyLock::new(|| sel(r#"[data-testid="retweet"], [data-testid="unretweet"]"#));
static REPLIES: LazyLock<Selector> = LazyLock::new(|| sel(r#"[data-testid="reply"]"#));
static ANALYTICS: LazyLock<Selector> = LazyLock::new(|| sel(r#"a[href*="/analytics"]"#));
static ARIA: LazyLock<Selector> = LazyLock::new(|| sel("[aria-label]"));
static SOCIAL_CONTEXT: LazyLock<Selector> =
    LazyLock::new(|| sel(r#"[data-testid="socialContext"]"#));
static QUOTE: LazyLock<Selector> = LazyLock::new(|| sel(r#"[data-testid="quoteTweet"]"#));
static SHORT_LINK: LazyLock<Selector> = LazyLock::new(|| sel(r#"a[href*="t.co/"]"#));
static MEDIA_IMG: LazyLock<Selector> =
    LazyLock::new(|| sel(r#"img[src*="pbs.twimg.com/media"]"#));
static VIDEO: LazyLock<Selector> = LazyLock::new(|| sel("video[poster]"));
static BODY: LazyLock<Selector> = LazyLock::new(|| sel("body"));

static LOGIN_LINK: LazyLock<Selector> =
    LazyLock::new(|| sel(r#"a[href="/login"], a[href="/i/flow/login"], [data-testid="loginButton"]"#));
static ACCOUNT_SWITCHER: LazyLock<Selector> =
    LazyLock::new(|| sel(r#"[data-testid="SideNav_AccountSwitcher_Button"]"#));

// --- Patterns ---

static STATUS_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/([A-Za-z0-9_]{1,15})/status/(\d+)").unwrap());
static VIEWS_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d[\d,.\s]*(?:[kmb]|mil|mi|bi)?)\s*views?").unwrap());
static HASHTAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#\w+").unwrap());
static MENTION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"@\w+").unwrap());

/// Page text that means the site is throttling or challenging the session.
const BLOCK_MARKERS: &[&str] = &[
    "Rate limit exceeded",
    "Something went wrong",
    "Verify your identity",
    "Verify your phone",
    "Suspicious activity",
    "Are you a robot",
    "CAPTCHA",
];

/// A block or challenge marker was rendered outside the feed items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSignal {
    pub marker: &'static str,
}

#[derive(Debug, Clone, Default)]
pub struct Extraction {
    /// Unique posts in document order.
    pub posts: Vec<Post>,
    /// Feed items found, parseable or not.
    pub items_seen: usize,
    /// Items skipped because they carried no identifier.
    pub noise: u32,
    pub block: Option<BlockSignal>,
}

impl Extraction {
    /// Nothing rendered and no block marker: likely a transient empty frame.
    pub fn is_blank(&self) -> bool {
        self.items_seen == 0 && self.block.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct PostExtractor {
    base_url: String,
}

impl PostExtractor {
    pub fn new(site_base_url: impl Into<String>) -> Self {
        Self {
            base_url: site_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn extract(&self, snapshot: &RenderedSnapshot) -> Extraction {
        let document = Html::parse_document(&snapshot.html);
        let collected_at = Utc::now();

        let mut articles: Vec<ElementRef<'_>> = document.select(&ARTICLE).collect();
        if articles.is_empty() {
            articles = document.select(&ARTICLE_FALLBACK).collect();
        }

        let mut out = Extraction {
            items_seen: articles.len(),
            ..Extraction::default()
        };
        let mut seen = HashSet::new();

        for article in articles {
            match self.parse_article(article, collected_at) {
                Some(post) => {
                    if seen.insert(post.id.clone()) {
                        out.posts.push(post);
                    }
                }
                None => out.noise += 1,
            }
        }

        out.block = detect_block(&document);

        debug!(
            items = out.items_seen,
            posts = out.posts.len(),
            noise = out.noise,
            blocked = out.block.is_some(),
            "Snapshot extracted"
        );
        out
    }

    fn parse_article(&self, article: ElementRef<'_>, collected_at: DateTime<Utc>) -> Option<Post> {
        let (handle, id) = status_identity(article)?;
        let text = article.select(&TEXT).next().map(inner_text).unwrap_or_default();

        let display_name = article
            .select(&USER_NAME)
            .map(inner_text)
            .map(|s| s.trim().to_string())
            .find(|s| !s.is_empty())
            .unwrap_or_else(|| format!("@{handle}"));

        let created_at = article
            .select(&TIME)
            .next()
            .and_then(|t| t.value().attr("datetime"))
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let metrics = EngagementMetrics {
            likes: first_count(article, &LIKES),
            reposts: first_count(article, &REPOSTS),
            replies: first_count(article, &REPLIES),
            views: views(article),
        };

        let social = article
            .select(&SOCIAL_CONTEXT)
            .next()
            .map(inner_text)
            .unwrap_or_default()
            .to_lowercase();

        Some(Post {
            url: format!("{}/{}/status/{}", self.base_url, handle, id),
            id,
            author: Author {
                username: handle,
                display_name,
            },
            hashtags: unique(HASHTAG.find_iter(&text).map(|m| m.as_str().to_string())),
            mentions: unique(MENTION.find_iter(&text).map(|m| m.as_str().to_string())),
            links: unique(article.select(&SHORT_LINK).filter_map(|a| {
                let el = a.value();
                el.attr("title")
                    .filter(|t| t.starts_with("http"))
                    .or_else(|| el.attr("href"))
                    .map(str::to_string)
            })),
            media_urls: unique(
                article
                    .select(&MEDIA_IMG)
                    .filter_map(|img| img.value().attr("src"))
                    .chain(article.select(&VIDEO).filter_map(|v| v.value().attr("poster")))
                    .map(str::to_string),
            ),
            is_reply: inner_text(article).contains("Replying to"),
            is_repost: social.contains("repost") || social.contains("retweeted"),
            is_quote: article.select(&QUOTE).next().is_some(),
            text: text.trim().to_string(),
            created_at,
            metrics,
            collected_at,
        })
    }
}

/// Handle and numeric id of the article's own status link. The link wrapping
/// the timestamp wins over others (e.g. a quoted post's link).
fn status_identity(article: ElementRef<'_>) -> Option<(String, String)> {
    let mut fallback = None;
    for link in article.select(&STATUS_LINK) {
        let Some(caps) = link.value().attr("href").and_then(|h| STATUS_PATH.captures(h)) else {
            continue;
        };
        let identity = (caps[1].to_string(), caps[2].to_string());
        if link.select(&TIME).next().is_some() {
            return Some(identity);
        }
        fallback.get_or_insert(identity);
    }
    fallback
}

fn first_count(article: ElementRef<'_>, selector: &Selector) -> u64 {
    article
        .select(selector)
        .next()
        .and_then(|el| normalize_count(&inner_text(el)))
        .unwrap_or(0)
}

/// Views from the analytics link, falling back to an aria-label like
/// "1,234 views".
fn views(article: ElementRef<'_>) -> u64 {
    let from_link = article
        .select(&ANALYTICS)
        .filter_map(|a| normalize_count(&inner_text(a)))
        .find(|v| *v > 0);
    if let Some(v) = from_link {
        return v;
    }

    article
        .select(&ARIA)
        .filter_map(|el| el.value().attr("aria-label"))
        .filter_map(|label| VIEWS_LABEL.captures(label))
        .filter_map(|caps| normalize_count(&caps[1]))
        .find(|v| *v > 0)
        .unwrap_or(0)
}

fn inner_text(el: ElementRef<'_>) -> String {
    el.text().collect()
}

fn unique(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items.filter(|i| seen.insert(i.clone())).collect()
}

fn detect_block(document: &Html) -> Option<BlockSignal> {
    let root = document.select(&BODY).next().unwrap_or_else(|| document.root_element());
    let mut text = String::new();
    visible_text(root, &mut text);
    let text = text.to_lowercase();

    BLOCK_MARKERS
        .iter()
        .copied()
        .find(|m| text.contains(&m.to_lowercase()))
        .map(|marker| BlockSignal { marker })
}

fn visible_text(el: ElementRef<'_>, out: &mut String) {
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
            out.push(' ');
        } else if let Some(child_el) = ElementRef::wrap(child) {
            // Post bodies are user text; a post mentioning "CAPTCHA" is not a block.
            if !matches!(
                child_el.value().name(),
                "script" | "style" | "noscript" | "article"
            ) {
                visible_text(child_el, out);
            }
        }
    }
}

/// Classify a rendered home page: a login wall means the session expired,
/// the account switcher means we're in.
pub fn classify_login(snapshot: &RenderedSnapshot) -> LoginStatus {
    if snapshot.url.contains("/login") || snapshot.url.contains("/i/flow/login") {
        return LoginStatus::SessionExpired;
    }
    let document = Html::parse_document(&snapshot.html);
    if document.select(&ACCOUNT_SWITCHER).next().is_some() {
        return LoginStatus::LoggedIn;
    }
    if document.select(&LOGIN_LINK).next().is_some() {
        return LoginStatus::SessionExpired;
    }
    LoginStatus::Unknown
}

// ---------------------------------------------------------------------------
// Count normalization
// ---------------------------------------------------------------------------

const SUFFIXES: &[(&str, u64)] = &[
    ("mil", 1_000),
    ("mi", 1_000_000),
    ("bi", 1_000_000_000),
    ("k", 1_000),
    ("m", 1_000_000),
    ("b", 1_000_000_000),
];

/// Parse an abbreviated engagement count. Fractions are truncated, never
/// rounded: "1.29K" is 1290 and "1.2345K" is 1234. Without a suffix, '.' and
/// ',' are digit grouping ("1,234" is 1234).
pub fn normalize_count(raw: &str) -> Option<u64> {
    let s: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    if s.is_empty() {
        return None;
    }

    let suffixed = SUFFIXES
        .iter()
        .find_map(|(suffix, mult)| s.strip_suffix(suffix).map(|n| (n, *mult)));

    match suffixed {
        Some((number, multiplier)) => scaled(number, multiplier),
        None => {
            let digits: String = s.chars().filter(|c| *c != '.' && *c != ',').collect();
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            digits.parse().ok()
        }
    }
}

fn scaled(number: &str, multiplier: u64) -> Option<u64> {
    let (int_part, frac_part) = match number.rfind(['.', ',']) {
        Some(i) => (&number[..i], &number[i + 1..]),
        None => (number, ""),
    };
    let int_digits: String = int_part.chars().filter(|c| *c != '.' && *c != ',').collect();
    if int_digits.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_digits.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }

    let int_value: u128 = if int_digits.is_empty() {
        0
    } else {
        int_digits.parse().ok()?
    };
    // The multiplier is at most 1e9, so digits past the ninth never matter.
    let frac = &frac_part[..frac_part.len().min(9)];
    let frac_value: u128 = if frac.is_empty() { 0 } else { frac.parse().ok()? };
    let scale = 10u128.pow(frac.len() as u32);

    let total = int_value
        .checked_mul(multiplier as u128)?
        .checked_add(frac_value * multiplier as u128 / scale)?;
    u64::try_from(total).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article(id: &str, handle: &str, extra: &str) -> String {
        format!(
            r#"<article data-testid="tweet">
                <div data-testid="User-Name"><a href="/{handle}"><span>Display {handle}</span></a></div>
                <a href="/{handle}/status/{id}"><time datetime="2026-03-01T12:00:00.000Z">Mar 1</time></a>
                <div data-testid="tweetText">Hello #Rust with @friend and #rust</div>
                {extra}
            </article>"#
        )
    }

    fn snapshot(body: &str) -> RenderedSnapshot {
        RenderedSnapshot::new(
            "https://x.com/search?q=rust",
            format!("<html><body>{body}</body></html>"),
        )
    }

    #[test]
    fn normalizes_counts_with_truncation() {
        assert_eq!(normalize_count("1.2K"), Some(1200));
        assert_eq!(normalize_count("3"), Some(3));
        assert_eq!(normalize_count("10M"), Some(10_000_000));
        assert_eq!(normalize_count("1.29K"), Some(1290));
        assert_eq!(normalize_count("1.299K"), Some(1299));
        assert_eq!(normalize_count("1.2345K"), Some(1234));
        assert_eq!(normalize_count(" 1,234 "), Some(1234));
        assert_eq!(normalize_count("1,2 mil"), Some(1200));
        assert_eq!(normalize_count("2,5 mi"), Some(2_500_000));
        assert_eq!(normalize_count("1B"), Some(1_000_000_000));
        assert_eq!(normalize_count(""), None);
        assert_eq!(normalize_count("abc"), None);
        assert_eq!(normalize_count("K"), None);
    }

    #[test]
    fn extracts_post_fields() {
        let extra = r#"
            <div role="group">
              <button data-testid="reply"><span>12</span></button>
              <button data-testid="retweet"><span>1.5K</span></button>
              <button data-testid="unlike"><span>2.29K</span></button>
              <a href="/dev/status/42/analytics"><span>10M</span></a>
            </div>
            <a href="https://t.co/abc" title="https://example.com/page">example.com</a>
            <img src="https://pbs.twimg.com/media/one.jpg">
            <video poster="https://pbs.twimg.com/ext_tw_video_thumb/1.jpg"></video>
        "#;
        let extraction = PostExtractor::new("https://x.com").extract(&snapshot(&article("42", "dev", extra)));

        assert_eq!(extraction.items_seen, 1);
        assert_eq!(extraction.noise, 0);
        let post = &extraction.posts[0];
        assert_eq!(post.id, "42");
        assert_eq!(post.url, "https://x.com/dev/status/42");
        assert_eq!(post.author.username, "dev");
        assert_eq!(post.author.display_name, "Display dev");
        assert_eq!(post.text, "Hello #Rust with @friend and #rust");
        assert_eq!(
            post.created_at.map(|d| d.to_rfc3339()),
            Some("2026-03-01T12:00:00+00:00".to_string())
        );
        assert_eq!(
            post.metrics,
            EngagementMetrics {
                likes: 2290,
                reposts: 1500,
                replies: 12,
                views: 10_000_000,
            }
        );
        assert_eq!(post.hashtags, vec!["#Rust", "#rust"]);
        assert_eq!(post.mentions, vec!["@friend"]);
        assert_eq!(post.links, vec!["https://example.com/page"]);
        assert_eq!(post.media_urls.len(), 2);
        assert!(!post.is_reply && !post.is_repost && !post.is_quote);
    }

    #[test]
    fn missing_metrics_default_to_zero_and_views_use_aria_label() {
        let extra = r#"<div aria-label="3 replies, 1,234 views"></div>"#;
        let extraction = PostExtractor::new("https://x.com").extract(&snapshot(&article("7", "a", extra)));
        let metrics = extraction.posts[0].metrics;
        assert_eq!(metrics.likes, 0);
        assert_eq!(metrics.reposts, 0);
        assert_eq!(metrics.views, 1234);
    }

    #[test]
    fn items_without_identifier_are_noise() {
        let body = format!(
            r#"{}<article data-testid="tweet"><div>promoted</div></article>{}"#,
            article("1", "a", ""),
            article("1", "a", "")
        );
        let extraction = PostExtractor::new("https://x.com").extract(&snapshot(&body));
        assert_eq!(extraction.items_seen, 3);
        assert_eq!(extraction.noise, 1);
        assert_eq!(extraction.posts.len(), 1);
    }

    #[test]
    fn kind_flags() {
        let extra = r#"<span data-testid="socialContext">Someone reposted</span>
            <div>Replying to <a href="/x">@x</a></div>
            <div data-testid="quoteTweet"><a href="/other/status/99">quoted</a></div>"#;
        let extraction = PostExtractor::new("https://x.com").extract(&snapshot(&article("5", "b", extra)));
        let post = &extraction.posts[0];
        assert!(post.is_repost && post.is_reply && post.is_quote);
        // The timestamp link identifies the post, not the quoted one.
        assert_eq!(post.id, "5");
    }

    #[test]
    fn block_markers_ignore_scripts_and_post_text() {
        let extractor = PostExtractor::new("https://x.com");

        let blocked = extractor.extract(&snapshot("<div><span>Rate limit exceeded.</span></div>"));
        assert_eq!(blocked.block.map(|b| b.marker), Some("Rate limit exceeded"));

        let script_only = extractor.extract(&snapshot("<script>var s = 'CAPTCHA';</script>"));
        assert!(script_only.block.is_none());
        assert!(script_only.is_blank());

        let post_mentions_marker = extractor.extract(&snapshot(&article(
            "1",
            "a",
            "<div>Solved my first CAPTCHA today</div>",
        )));
        assert_eq!(post_mentions_marker.posts.len(), 1);
        assert!(post_mentions_marker.block.is_none());
    }

    #[test]
    fn banner_below_feed_is_a_block_signal() {
        let extraction = PostExtractor::new("https://x.com").extract(&snapshot(&format!(
            "<section>{}{}</section><div>Something went wrong. Try reloading.</div>",
            article("1", "a", ""),
            article("2", "b", "")
        )));
        assert_eq!(extraction.posts.len(), 2);
        assert_eq!(extraction.block.as_ref().map(|b| b.marker), Some("Something went wrong"));
        assert!(!extraction.is_blank());
    }

    #[test]
    fn login_classification() {
        let login_url = RenderedSnapshot::new("https://x.com/i/flow/login", "<html></html>");
        assert_eq!(classify_login(&login_url), LoginStatus::SessionExpired);

        let home = RenderedSnapshot::new(
            "https://x.com/home",
            r#"<html><body><button data-testid="SideNav_AccountSwitcher_Button"></button></body></html>"#,
        );
        assert_eq!(classify_login(&home), LoginStatus::LoggedIn);

        let wall = RenderedSnapshot::new(
            "https://x.com/",
            r#"<html><body><a href="/login">Log in</a></body></html>"#,
        );
        assert_eq!(classify_login(&wall), LoginStatus::SessionExpired);

        let loading = RenderedSnapshot::new("https://x.com/home", "<html><body></body></html>");
        assert_eq!(classify_login(&loading), LoginStatus::Unknown);
    }
}
