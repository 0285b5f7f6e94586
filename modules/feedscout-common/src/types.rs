use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Cookie that carries the authenticated session on the target site.
pub const AUTH_COOKIE: &str = "auth_token";

pub const DEFAULT_MAX_POSTS: u32 = 3000;

// --- Search request ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Recency,
    Relevance,
}

impl std::str::FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "recency" | "latest" | "live" => Ok(SortOrder::Recency),
            "relevance" | "top" => Ok(SortOrder::Relevance),
            other => Err(format!("unknown sort order: {other}")),
        }
    }
}

/// Optional creation-time bounds for a search. Either side may be open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    /// Window covering the last `span`, ending now. `None` unless `span` is
    /// positive and its start is representable.
    pub fn last(span: chrono::Duration) -> Option<Self> {
        Self::last_from(Utc::now(), span)
    }

    pub fn last_from(now: DateTime<Utc>, span: chrono::Duration) -> Option<Self> {
        if span <= chrono::Duration::zero() {
            return None;
        }
        Some(Self {
            start: Some(now.checked_sub_signed(span)?),
            end: None,
        })
    }

    pub fn is_valid(&self) -> bool {
        match (self.start, self.end) {
            (Some(start), Some(end)) => start <= end,
            _ => true,
        }
    }
}

/// What to collect. Immutable once a run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct SearchRequest {
    /// Free-form query (may embed site operators) or a full site URL.
    #[builder(setter(into))]
    pub query: String,
    #[builder(default)]
    pub sort: SortOrder,
    #[builder(default = DEFAULT_MAX_POSTS)]
    pub max_posts: u32,
    #[builder(default, setter(strip_option))]
    pub window: Option<TimeWindow>,
    /// Language code, or "all" for no filter.
    #[builder(default, setter(strip_option, into))]
    pub language: Option<String>,
    #[builder(default = true)]
    pub include_replies: bool,
    #[builder(default = true)]
    pub include_reposts: bool,
    #[builder(default = true)]
    pub include_quotes: bool,
}

impl SearchRequest {
    /// Language code to filter on, if any. "all" and blank mean no filter.
    pub fn language_filter(&self) -> Option<&str> {
        self.language
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.eq_ignore_ascii_case("all"))
    }
}

// --- Cookies ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub domain: String,
    pub name: String,
    pub value: String,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    /// Seconds since the Unix epoch; `None` for session cookies.
    pub expires: Option<f64>,
    pub same_site: Option<String>,
}

impl Cookie {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let secs = self.expires?;
        if secs <= 0.0 {
            // Browsers export session cookies as -1.
            return None;
        }
        Utc.timestamp_opt(secs as i64, 0).single()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| at <= now)
    }
}

/// Cookies for a single site, keyed by cookie name. Replaced wholesale on
/// re-import; never merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CookieSet {
    pub domain: String,
    pub cookies: BTreeMap<String, Cookie>,
}

impl CookieSet {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            cookies: BTreeMap::new(),
        }
    }

    /// Insert a cookie, replacing any earlier cookie with the same name.
    pub fn insert(&mut self, cookie: Cookie) {
        self.cookies.insert(cookie.name.clone(), cookie);
    }

    pub fn get(&self, name: &str) -> Option<&Cookie> {
        self.cookies.get(name)
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cookie> {
        self.cookies.values()
    }

    /// True when the auth cookie is present and its expiry has passed.
    pub fn auth_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.get(AUTH_COOKIE).is_some_and(|c| c.is_expired_at(now))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportOutcome {
    pub domain: String,
    pub imported: usize,
    /// Cookies in the input that belonged to other domains.
    pub skipped: usize,
    pub imported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginStatus {
    LoggedIn,
    SessionExpired,
    Unknown,
}

// --- Posts ---

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Author {
    pub username: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngagementMetrics {
    pub likes: u64,
    pub reposts: u64,
    pub replies: u64,
    pub views: u64,
}

impl EngagementMetrics {
    /// Likes + reposts + replies. Views are exposure, not interaction.
    pub fn interactions(&self) -> u64 {
        self.likes
            .saturating_add(self.reposts)
            .saturating_add(self.replies)
    }

    pub fn saturating_add(self, other: Self) -> Self {
        Self {
            likes: self.likes.saturating_add(other.likes),
            reposts: self.reposts.saturating_add(other.reposts),
            replies: self.replies.saturating_add(other.replies),
            views: self.views.saturating_add(other.views),
        }
    }
}

/// A post as rendered in the feed. Identity is `id` alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub url: String,
    pub author: Author,
    pub text: String,
    pub created_at: Option<DateTime<Utc>>,
    pub metrics: EngagementMetrics,
    pub hashtags: Vec<String>,
    pub mentions: Vec<String>,
    pub links: Vec<String>,
    pub media_urls: Vec<String>,
    pub is_reply: bool,
    pub is_repost: bool,
    pub is_quote: bool,
    pub collected_at: DateTime<Utc>,
}

// --- Run lifecycle ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Initializing,
    Scrolling,
    Finishing,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Initializing)
                | (Initializing, Scrolling)
                | (Initializing, Failed)
                // A rate-limited search page stops the run before any scroll.
                | (Initializing, Finishing)
                | (Scrolling, Finishing)
                | (Scrolling, Failed)
                | (Finishing, Completed)
        )
    }
}

/// Why a run stopped. Graceful reasons end in `Completed`; the rest in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    TargetReached,
    RateLimited,
    NoNewContent,
    TimeExceeded,
    Cancelled,
    Failed,
}

impl TerminationReason {
    pub fn is_graceful(self) -> bool {
        !matches!(self, TerminationReason::Cancelled | TerminationReason::Failed)
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TerminationReason::TargetReached => "target_reached",
            TerminationReason::RateLimited => "rate_limited",
            TerminationReason::NoNewContent => "no_new_content",
            TerminationReason::TimeExceeded => "time_exceeded",
            TerminationReason::Cancelled => "cancelled",
            TerminationReason::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Stop-condition thresholds for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopLimits {
    /// Consecutive cycles with zero new posts before `NoNewContent`.
    pub no_new_content_threshold: u32,
    /// Consecutive cycles showing a block marker before `RateLimited`.
    pub rate_limit_threshold: u32,
    pub time_budget: Option<Duration>,
    /// Extra scrolls allowed when a snapshot renders no feed items at all.
    pub empty_snapshot_retries: u32,
}

impl Default for StopLimits {
    fn default() -> Self {
        Self {
            no_new_content_threshold: 3,
            rate_limit_threshold: 2,
            time_budget: None,
            empty_snapshot_retries: 1,
        }
    }
}

/// Progress emitted after every scroll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub scroll_index: u32,
    pub unique_count: usize,
    pub new_in_batch: usize,
}

// --- Results ---

/// Weights of the composite engagement score. Each metric is normalized by
/// its maximum over the ranked list before weighting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub likes: f64,
    pub reposts: f64,
    pub replies: f64,
    pub views: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            likes: 0.25,
            reposts: 0.25,
            replies: 0.25,
            views: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedPost {
    pub rank: u32,
    pub score: f64,
    pub post: Post,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCount {
    pub tag: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Summary {
    pub total_count: usize,
    pub totals: EngagementMetrics,
    /// Mean of likes + reposts + replies per post.
    pub average_interactions: f64,
    pub top_posts: Vec<RankedPost>,
    pub top_hashtags: Vec<TagCount>,
    pub top_mentions: Vec<TagCount>,
}

/// Outcome of one collection run. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionResult {
    pub run_id: Uuid,
    pub query: String,
    pub search_url: Option<String>,
    /// Unique posts in first-seen order.
    pub posts: Vec<Post>,
    pub total_count: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub termination_reason: TerminationReason,
    pub final_state: RunState,
    pub scroll_cycles: u32,
    pub error_count: u32,
    pub error: Option<String>,
    pub summary: Summary,
}

impl CollectionResult {
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    pub fn is_completed(&self) -> bool {
        self.final_state == RunState::Completed
    }
}
