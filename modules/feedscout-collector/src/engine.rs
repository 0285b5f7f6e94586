// Collection engine: the scroll loop and its state machine.
//
// Idle -> Initializing -> Scrolling -> Finishing -> Completed
//                      \-> Failed    \-> Failed
//
// Only request validation and missing/expired cookies escape as errors. Once
// a browser session is involved, every outcome (including failures and
// cancellation) comes back as a CollectionResult carrying whatever was
// collected so far.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use browserless_client::BrowserError;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use feedscout_common::{
    CollectError, CollectionResult, CollectorConfig, Post, ProgressEvent, RunState,
    ScoreWeights, SearchRequest, StopLimits, TerminationReason,
};

use crate::aggregate::Aggregator;
use crate::extractor::{Extraction, PostExtractor};
use crate::query::QueryBuilder;
use crate::session_store::CookieStore;
use crate::traits::{BrowserLauncher, FeedSession, ProgressSink, RenderedSnapshot};
use crate::wait::{poll_until, WaitPolicy};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineSettings {
    pub limits: StopLimits,
    /// Bounded wait for the feed to change after each scroll.
    pub wait: WaitPolicy,
    pub top_k: usize,
    pub weights: ScoreWeights,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            limits: StopLimits::default(),
            wait: WaitPolicy::default(),
            top_k: 5,
            weights: ScoreWeights::default(),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &CollectorConfig) -> Self {
        Self {
            limits: config.stop_limits(),
            wait: WaitPolicy::new(config.content_wait, config.content_poll),
            top_k: config.top_k,
            weights: config.score_weights,
        }
    }
}

pub struct CollectionEngine {
    launcher: Arc<dyn BrowserLauncher>,
    store: Arc<CookieStore>,
    queries: QueryBuilder,
    extractor: PostExtractor,
    aggregator: Aggregator,
    settings: EngineSettings,
}

impl CollectionEngine {
    pub fn new(
        launcher: Arc<dyn BrowserLauncher>,
        store: Arc<CookieStore>,
        queries: QueryBuilder,
        extractor: PostExtractor,
        settings: EngineSettings,
    ) -> Self {
        Self {
            launcher,
            store,
            queries,
            extractor,
            aggregator: Aggregator::new(settings.top_k, settings.weights),
            settings,
        }
    }

    pub fn from_config(
        config: &CollectorConfig,
        launcher: Arc<dyn BrowserLauncher>,
        store: Arc<CookieStore>,
    ) -> Self {
        Self::new(
            launcher,
            store,
            QueryBuilder::new(config.site_base_url.clone(), config.site_domain.clone()),
            PostExtractor::new(config.site_base_url.clone()),
            EngineSettings::from_config(config),
        )
    }

    /// Run one collection. `cancel` is checked between scroll cycles.
    pub async fn collect(
        &self,
        request: &SearchRequest,
        cancel: &AtomicBool,
        progress: &dyn ProgressSink,
    ) -> Result<CollectionResult, CollectError> {
        let mut run = Run::new(request);
        validate(request)?;

        run.advance(RunState::Initializing);
        let cookies = self.store.session_cookies(run.started_at)?;
        let search_url = self.queries.build(request)?;
        run.search_url = Some(search_url.clone());

        info!(
            run_id = %run.id,
            query = %request.query,
            max_posts = request.max_posts,
            url = %search_url,
            "Starting collection"
        );

        let mut session = match self.launcher.open(&cookies).await {
            Ok(session) => session,
            Err(e) => {
                warn!(run_id = %run.id, error = %format!("{e:#}"), "Failed to open browser session");
                let err = CollectError::Browser(format!("{e:#}"));
                return Ok(run.finish(&self.aggregator, TerminationReason::Failed, Some(err)));
            }
        };

        let (reason, error) = match self.open_feed(session.as_mut(), &search_url).await {
            Ok(initial) => {
                run.advance(RunState::Scrolling);
                self.scroll_loop(session.as_mut(), &mut run, initial, cancel, progress)
                    .await
            }
            Err(e @ CollectError::RateLimited(_)) => {
                warn!(run_id = %run.id, error = %e, "Search page rate limited");
                (TerminationReason::RateLimited, Some(e))
            }
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "Navigation failed");
                (TerminationReason::Failed, Some(e))
            }
        };

        if let Err(e) = session.close().await {
            warn!(run_id = %run.id, error = %e, "Failed to close browser session");
        }

        Ok(run.finish(&self.aggregator, reason, error))
    }

    /// Navigate to the search URL and return the first rendered snapshot.
    /// An HTTP 429 on the document comes back as `RateLimited`.
    async fn open_feed(
        &self,
        session: &mut dyn FeedSession,
        url: &str,
    ) -> Result<RenderedSnapshot, CollectError> {
        session.navigate(url).await.map_err(|e| {
            match e.downcast_ref::<BrowserError>() {
                Some(status) if status.is_rate_limited() => {
                    CollectError::RateLimited(status.to_string())
                }
                _ => CollectError::Navigation(format!("{e:#}")),
            }
        })?;

        let snapshot = session
            .current_content()
            .await
            .map_err(|e| CollectError::Navigation(format!("{e:#}")))?;
        if is_login_redirect(&snapshot.url) {
            return Err(CollectError::Navigation(format!(
                "redirected to login page ({}); session expired",
                snapshot.url
            )));
        }
        Ok(snapshot)
    }

    async fn scroll_loop(
        &self,
        session: &mut dyn FeedSession,
        run: &mut Run,
        initial: RenderedSnapshot,
        cancel: &AtomicBool,
        progress: &dyn ProgressSink,
    ) -> (TerminationReason, Option<CollectError>) {
        let limits = self.settings.limits;
        let mut fingerprint = initial.fingerprint();
        let mut empty_streak = 0u32;
        let mut blocked_streak = 0u32;

        loop {
            if cancel.load(Ordering::Relaxed) {
                info!(run_id = %run.id, collected = run.posts.len(), "Collection cancelled");
                return (TerminationReason::Cancelled, Some(CollectError::Cancelled));
            }

            run.scroll_cycles += 1;
            let extraction = match self.advance_feed(session, &mut fingerprint, run).await {
                Ok(extraction) => extraction,
                Err(e) => {
                    warn!(run_id = %run.id, cycle = run.scroll_cycles, error = %format!("{e:#}"), "Scroll cycle failed");
                    return (
                        TerminationReason::Failed,
                        Some(CollectError::Browser(format!("{e:#}"))),
                    );
                }
            };

            let new_in_batch = run.posts.merge(extraction.posts);
            // A marker only counts while the feed is stalled.
            let blocked = extraction.block.filter(|_| new_in_batch == 0);

            empty_streak = if new_in_batch == 0 { empty_streak + 1 } else { 0 };
            blocked_streak = if blocked.is_some() { blocked_streak + 1 } else { 0 };
            if let Some(signal) = &blocked {
                warn!(run_id = %run.id, marker = signal.marker, streak = blocked_streak, "Block signal on page");
            }

            progress.on_progress(ProgressEvent {
                scroll_index: run.scroll_cycles,
                unique_count: run.posts.len(),
                new_in_batch,
            });
            debug!(
                cycle = run.scroll_cycles,
                new = new_in_batch,
                total = run.posts.len(),
                "Scroll cycle done"
            );

            let stop = evaluate_stop(
                &StopInputs {
                    unique: run.posts.len(),
                    max_posts: run.posts.capacity,
                    empty_streak,
                    blocked_streak,
                    elapsed: run.clock.elapsed(),
                },
                &limits,
            );
            if let Some(reason) = stop {
                info!(run_id = %run.id, reason = %reason, collected = run.posts.len(), "Stopping collection");
                let error = (reason == TerminationReason::RateLimited).then(|| {
                    CollectError::RateLimited(
                        blocked.map(|b| b.marker.to_string()).unwrap_or_default(),
                    )
                });
                return (reason, error);
            }
        }
    }

    /// Scroll, wait for the feed to change, and extract. Blank snapshots are
    /// re-scrolled a bounded number of times.
    async fn advance_feed(
        &self,
        session: &mut dyn FeedSession,
        fingerprint: &mut u64,
        run: &mut Run,
    ) -> anyhow::Result<Extraction> {
        let mut retries = 0;
        loop {
            session.scroll_once().await?;

            let previous = *fingerprint;
            let reader: &dyn FeedSession = session;
            let outcome = poll_until(
                self.settings.wait,
                || async move { reader.current_content().await },
                |snapshot| snapshot.fingerprint() != previous,
            )
            .await?;
            if !outcome.is_ready() {
                debug!(cycle = run.scroll_cycles, "Feed unchanged after wait");
            }
            let snapshot = outcome.into_inner();
            *fingerprint = snapshot.fingerprint();

            let extraction = self.extractor.extract(&snapshot);
            run.noise += extraction.noise;

            if extraction.is_blank() && retries < self.settings.limits.empty_snapshot_retries {
                retries += 1;
                run.retries += 1;
                debug!(cycle = run.scroll_cycles, retries, "Empty snapshot, scrolling again");
                continue;
            }
            return Ok(extraction);
        }
    }
}

fn validate(request: &SearchRequest) -> Result<(), CollectError> {
    if request.max_posts == 0 {
        return Err(CollectError::InvalidRequest("max_posts must be at least 1".into()));
    }
    if request.query.trim().is_empty() {
        return Err(CollectError::InvalidRequest("query is empty".into()));
    }
    if request.window.is_some_and(|w| !w.is_valid()) {
        return Err(CollectError::InvalidRequest(
            "time window starts after it ends".into(),
        ));
    }
    Ok(())
}

fn is_login_redirect(url: &str) -> bool {
    url.contains("/login") || url.contains("/i/flow/login")
}

// ---------------------------------------------------------------------------
// Stop conditions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub(crate) struct StopInputs {
    pub unique: usize,
    pub max_posts: usize,
    pub empty_streak: u32,
    pub blocked_streak: u32,
    pub elapsed: Duration,
}

/// First matching stop condition, in priority order.
pub(crate) fn evaluate_stop(inputs: &StopInputs, limits: &StopLimits) -> Option<TerminationReason> {
    if inputs.unique >= inputs.max_posts {
        return Some(TerminationReason::TargetReached);
    }
    if inputs.blocked_streak >= limits.rate_limit_threshold {
        return Some(TerminationReason::RateLimited);
    }
    if inputs.empty_streak >= limits.no_new_content_threshold {
        return Some(TerminationReason::NoNewContent);
    }
    if limits.time_budget.is_some_and(|budget| inputs.elapsed >= budget) {
        return Some(TerminationReason::TimeExceeded);
    }
    None
}

// ---------------------------------------------------------------------------
// Run bookkeeping
// ---------------------------------------------------------------------------

/// Unique posts in first-seen order, capped at the request's max.
struct Accumulator {
    seen: HashSet<String>,
    posts: Vec<Post>,
    capacity: usize,
    include_quotes: bool,
}

impl Accumulator {
    fn new(capacity: usize, include_quotes: bool) -> Self {
        Self {
            seen: HashSet::new(),
            posts: Vec::new(),
            capacity,
            include_quotes,
        }
    }

    /// Returns how many posts were new.
    fn merge(&mut self, batch: Vec<Post>) -> usize {
        let mut added = 0;
        for post in batch {
            if self.posts.len() >= self.capacity {
                break;
            }
            if !self.seen.insert(post.id.clone()) {
                continue;
            }
            if post.is_quote && !self.include_quotes {
                continue;
            }
            self.posts.push(post);
            added += 1;
        }
        added
    }

    fn len(&self) -> usize {
        self.posts.len()
    }
}

struct Run {
    id: Uuid,
    query: String,
    search_url: Option<String>,
    started_at: DateTime<Utc>,
    clock: Instant,
    state: RunState,
    posts: Accumulator,
    scroll_cycles: u32,
    noise: u32,
    retries: u32,
}

impl Run {
    fn new(request: &SearchRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            query: request.query.clone(),
            search_url: None,
            started_at: Utc::now(),
            clock: Instant::now(),
            state: RunState::Idle,
            posts: Accumulator::new(request.max_posts as usize, request.include_quotes),
            scroll_cycles: 0,
            noise: 0,
            retries: 0,
        }
    }

    fn advance(&mut self, next: RunState) {
        if self.state.is_terminal() {
            warn!(run_id = %self.id, state = ?self.state, to = ?next, "Run already finished");
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!(run_id = %self.id, from = ?self.state, to = ?next, "Unexpected run state transition");
        }
        debug!(run_id = %self.id, from = ?self.state, to = ?next, "Run state");
        self.state = next;
    }

    fn finish(
        mut self,
        aggregator: &Aggregator,
        reason: TerminationReason,
        error: Option<CollectError>,
    ) -> CollectionResult {
        if reason.is_graceful() {
            self.advance(RunState::Finishing);
        }
        let summary = aggregator.aggregate(&self.posts.posts);
        self.advance(if reason.is_graceful() {
            RunState::Completed
        } else {
            RunState::Failed
        });

        let fatal = u32::from(reason == TerminationReason::Failed);
        let finished_at = Utc::now();
        let elapsed_ms = self.clock.elapsed().as_millis() as u64;

        info!(
            run_id = %self.id,
            reason = %reason,
            posts = self.posts.len(),
            cycles = self.scroll_cycles,
            elapsed_ms,
            "Collection finished"
        );

        CollectionResult {
            run_id: self.id,
            query: self.query,
            search_url: self.search_url,
            total_count: self.posts.len(),
            posts: self.posts.posts,
            started_at: self.started_at,
            finished_at,
            elapsed_ms,
            termination_reason: reason,
            final_state: self.state,
            scroll_cycles: self.scroll_cycles,
            error_count: self.noise + self.retries + fatal,
            error: error.map(|e| e.to_string()),
            summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use feedscout_common::{Author, EngagementMetrics, TimeWindow};

    fn inputs() -> StopInputs {
        StopInputs {
            unique: 0,
            max_posts: 10,
            empty_streak: 0,
            blocked_streak: 0,
            elapsed: Duration::ZERO,
        }
    }

    fn post(id: &str, quote: bool) -> Post {
        Post {
            id: id.into(),
            url: String::new(),
            author: Author::default(),
            text: String::new(),
            created_at: None,
            metrics: EngagementMetrics::default(),
            hashtags: vec![],
            mentions: vec![],
            links: vec![],
            media_urls: vec![],
            is_reply: false,
            is_repost: false,
            is_quote: quote,
            collected_at: Utc::now(),
        }
    }

    #[test]
    fn no_stop_while_making_progress() {
        assert_eq!(evaluate_stop(&inputs(), &StopLimits::default()), None);
    }

    #[test]
    fn target_wins_over_everything() {
        let limits = StopLimits {
            time_budget: Some(Duration::from_secs(1)),
            ..StopLimits::default()
        };
        let i = StopInputs {
            unique: 10,
            empty_streak: 5,
            blocked_streak: 5,
            elapsed: Duration::from_secs(5),
            ..inputs()
        };
        assert_eq!(evaluate_stop(&i, &limits), Some(TerminationReason::TargetReached));
    }

    #[test]
    fn rate_limit_before_no_new_content() {
        let i = StopInputs {
            empty_streak: 3,
            blocked_streak: 2,
            ..inputs()
        };
        assert_eq!(
            evaluate_stop(&i, &StopLimits::default()),
            Some(TerminationReason::RateLimited)
        );
    }

    #[test]
    fn no_new_content_needs_full_streak() {
        let limits = StopLimits::default();
        let i = StopInputs {
            empty_streak: 2,
            ..inputs()
        };
        assert_eq!(evaluate_stop(&i, &limits), None);
        let i = StopInputs {
            empty_streak: 3,
            ..inputs()
        };
        assert_eq!(evaluate_stop(&i, &limits), Some(TerminationReason::NoNewContent));
    }

    #[test]
    fn time_budget_is_last() {
        let limits = StopLimits {
            time_budget: Some(Duration::from_secs(10)),
            ..StopLimits::default()
        };
        let i = StopInputs {
            elapsed: Duration::from_secs(10),
            ..inputs()
        };
        assert_eq!(evaluate_stop(&i, &limits), Some(TerminationReason::TimeExceeded));
        assert_eq!(evaluate_stop(&i, &StopLimits::default()), None);
    }

    #[test]
    fn accumulator_dedups_and_caps() {
        let mut acc = Accumulator::new(3, true);
        assert_eq!(acc.merge(vec![post("1", false), post("2", false)]), 2);
        assert_eq!(acc.merge(vec![post("2", false), post("3", false), post("4", false)]), 1);
        let ids: Vec<&str> = acc.posts.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn excluded_quotes_are_dropped() {
        let mut acc = Accumulator::new(10, false);
        assert_eq!(acc.merge(vec![post("q", true), post("p", false)]), 1);
        assert_eq!(acc.merge(vec![post("q", true)]), 0);
        assert_eq!(acc.len(), 1);
    }

    #[test]
    fn validation_rejects_bad_requests() {
        let zero = SearchRequest::builder().query("rust").max_posts(0).build();
        assert!(matches!(validate(&zero), Err(CollectError::InvalidRequest(_))));

        let blank = SearchRequest::builder().query(" ").build();
        assert!(matches!(validate(&blank), Err(CollectError::InvalidRequest(_))));

        let now = Utc::now();
        let inverted = SearchRequest::builder()
            .query("rust")
            .window(TimeWindow {
                start: Some(now),
                end: Some(now - ChronoDuration::minutes(5)),
            })
            .build();
        assert!(matches!(validate(&inverted), Err(CollectError::InvalidRequest(_))));

        let ok = SearchRequest::builder().query("rust").max_posts(1).build();
        assert!(validate(&ok).is_ok());
    }
}
