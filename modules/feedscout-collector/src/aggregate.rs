// End-of-run summary: totals, composite-score ranking, and tag frequencies.

use std::cmp::Ordering;
use std::collections::HashMap;

use feedscout_common::{EngagementMetrics, Post, RankedPost, ScoreWeights, Summary, TagCount};

/// How many hashtags / mentions the summary keeps.
const TOP_TAGS: usize = 5;

#[derive(Debug, Clone, Copy)]
pub struct Aggregator {
    top_k: usize,
    weights: ScoreWeights,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(5, ScoreWeights::default())
    }
}

impl Aggregator {
    pub fn new(top_k: usize, weights: ScoreWeights) -> Self {
        Self { top_k, weights }
    }

    /// Pure and deterministic: the same list always yields the same summary.
    pub fn aggregate(&self, posts: &[Post]) -> Summary {
        let totals = posts
            .iter()
            .fold(EngagementMetrics::default(), |acc, p| acc.saturating_add(p.metrics));

        let average_interactions = if posts.is_empty() {
            0.0
        } else {
            totals.interactions() as f64 / posts.len() as f64
        };

        Summary {
            total_count: posts.len(),
            totals,
            average_interactions,
            top_posts: self.rank(posts),
            top_hashtags: top_tags(posts.iter().flat_map(|p| p.hashtags.iter())),
            top_mentions: top_tags(posts.iter().flat_map(|p| p.mentions.iter())),
        }
    }

    /// Top-K by composite score. Ties go to the earliest creation time
    /// (posts without one rank after those with one), then first-seen order.
    pub fn rank(&self, posts: &[Post]) -> Vec<RankedPost> {
        let max = posts.iter().fold(EngagementMetrics::default(), |m, p| EngagementMetrics {
            likes: m.likes.max(p.metrics.likes),
            reposts: m.reposts.max(p.metrics.reposts),
            replies: m.replies.max(p.metrics.replies),
            views: m.views.max(p.metrics.views),
        });

        let mut scored: Vec<(usize, f64)> = posts
            .iter()
            .enumerate()
            .map(|(i, p)| (i, self.score(&p.metrics, &max)))
            .collect();

        scored.sort_by(|(ia, sa), (ib, sb)| {
            sb.total_cmp(sa)
                .then_with(|| match (posts[*ia].created_at, posts[*ib].created_at) {
                    (Some(a), Some(b)) => a.cmp(&b),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                })
                .then_with(|| ia.cmp(ib))
        });

        scored
            .into_iter()
            .take(self.top_k)
            .enumerate()
            .map(|(rank, (i, score))| RankedPost {
                rank: rank as u32 + 1,
                score,
                post: posts[i].clone(),
            })
            .collect()
    }

    fn score(&self, m: &EngagementMetrics, max: &EngagementMetrics) -> f64 {
        fn part(value: u64, max: u64) -> f64 {
            if max == 0 {
                0.0
            } else {
                value as f64 / max as f64
            }
        }

        self.weights.likes * part(m.likes, max.likes)
            + self.weights.reposts * part(m.reposts, max.reposts)
            + self.weights.replies * part(m.replies, max.replies)
            + self.weights.views * part(m.views, max.views)
    }
}

/// Most frequent tags, grouped case-insensitively. Ties sort alphabetically.
fn top_tags<'a>(tags: impl Iterator<Item = &'a String>) -> Vec<TagCount> {
    let mut counts: HashMap<String, u32> = HashMap::new();
    for tag in tags {
        *counts.entry(tag.to_lowercase()).or_default() += 1;
    }

    let mut sorted: Vec<TagCount> = counts
        .into_iter()
        .map(|(tag, count)| TagCount { tag, count })
        .collect();
    sorted.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.tag.cmp(&b.tag)));
    sorted.truncate(TOP_TAGS);
    sorted
}
