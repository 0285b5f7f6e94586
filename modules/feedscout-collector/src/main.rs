use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use feedscout_collector::{
    ChromeLauncher, CollectionEngine, CookieStore, HomePageProbe, WaitPolicy,
};
use feedscout_common::{
    CollectionResult, CollectorConfig, LoginStatus, ProgressEvent, SearchRequest, SortOrder,
    TimeWindow, DEFAULT_MAX_POSTS,
};

#[derive(Parser)]
#[command(name = "feedscout", about = "Collect public posts from a search feed")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import cookies from a browser cookie-editor JSON export
    ImportCookies { file: PathBuf },
    /// Check whether the stored cookies still authenticate
    CheckLogin,
    /// Show what the cookie store holds
    Status,
    /// Delete the stored cookies
    ClearCookies,
    /// Run one collection
    Collect(CollectArgs),
}

#[derive(clap::Args)]
struct CollectArgs {
    /// Search query (site operators allowed) or a full search URL
    #[arg(long)]
    query: String,
    #[arg(long, default_value_t = DEFAULT_MAX_POSTS)]
    max_posts: u32,
    /// recency | relevance
    #[arg(long, default_value = "recency")]
    sort: SortOrder,
    /// Language code, or "all"
    #[arg(long)]
    lang: Option<String>,
    /// Only posts from the last N minutes
    #[arg(long, value_parser = clap::value_parser!(i64).range(1..))]
    since_minutes: Option<i64>,
    #[arg(long)]
    exclude_replies: bool,
    #[arg(long)]
    exclude_reposts: bool,
    #[arg(long)]
    exclude_quotes: bool,
    /// Stop after this many seconds (overrides TIME_BUDGET_SECS)
    #[arg(long)]
    time_budget_secs: Option<u64>,
    /// Write the result JSON here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,
}

/// Exit code for a run that returned a result but did not complete.
const EXIT_INCOMPLETE: u8 = 2;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("feedscout_collector=info".parse()?)
                .add_directive("feedscout_common=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let mut config = CollectorConfig::from_env()?;
    let store = Arc::new(CookieStore::open(
        config.cookie_store_path.clone(),
        config.cookie_domains(),
    )?);

    match cli.command {
        Command::ImportCookies { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let outcome = store.import_cookies(&raw)?;
            info!(
                imported = outcome.imported,
                skipped = outcome.skipped,
                domain = %outcome.domain,
                "Cookies stored"
            );
        }
        Command::CheckLogin => {
            let launcher = Arc::new(ChromeLauncher::from_config(&config));
            let probe = HomePageProbe::new(
                launcher,
                config.home_url(),
                WaitPolicy::new(config.content_wait * 2, config.content_poll),
            );
            let status = store.check_login(&probe).await;
            match status {
                LoginStatus::LoggedIn => info!("Logged in"),
                LoginStatus::SessionExpired => warn!("Session expired; re-import cookies"),
                LoginStatus::Unknown => warn!("Login status unknown"),
            }
            println!("{}", serde_json::to_string(&status)?);
        }
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&store.status())?);
        }
        Command::ClearCookies => store.clear()?,
        Command::Collect(args) => {
            if let Some(secs) = args.time_budget_secs {
                config.time_budget = Some(std::time::Duration::from_secs(secs));
            }
            let request = build_request(&args)?;
            let output = args.output.clone();

            let launcher = Arc::new(ChromeLauncher::from_config(&config));
            let engine = CollectionEngine::from_config(&config, launcher, store);

            let cancel = Arc::new(AtomicBool::new(false));
            let flag = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Ctrl-C received, stopping after the current scroll");
                    flag.store(true, Ordering::Relaxed);
                }
            });

            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ProgressEvent>();
            let reporter = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    info!(
                        scroll = event.scroll_index,
                        unique = event.unique_count,
                        new = event.new_in_batch,
                        "Progress"
                    );
                }
            });

            let result = engine.collect(&request, &cancel, &tx).await;
            drop(tx);
            let _ = reporter.await;

            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    if e.requires_user_action() {
                        warn!("Fix the request or re-import cookies, then run again");
                    }
                    return Err(e.into());
                }
            };
            log_report(&result);
            write_result(&result, output)?;
            if !result.is_completed() {
                return Ok(ExitCode::from(EXIT_INCOMPLETE));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn build_request(args: &CollectArgs) -> Result<SearchRequest> {
    let window = match args.since_minutes {
        Some(minutes) => Some(
            chrono::Duration::try_minutes(minutes)
                .and_then(TimeWindow::last)
                .with_context(|| format!("--since-minutes {minutes} is out of range"))?,
        ),
        None => None,
    };

    Ok(SearchRequest {
        query: args.query.clone(),
        sort: args.sort,
        max_posts: args.max_posts,
        window,
        language: args.lang.clone(),
        include_replies: !args.exclude_replies,
        include_reposts: !args.exclude_reposts,
        include_quotes: !args.exclude_quotes,
    })
}

fn log_report(result: &CollectionResult) {
    info!(
        run_id = %result.run_id,
        reason = %result.termination_reason,
        state = ?result.final_state,
        posts = result.total_count,
        cycles = result.scroll_cycles,
        errors = result.error_count,
        elapsed = ?result.elapsed(),
        "Run complete"
    );
    let totals = &result.summary.totals;
    info!(
        likes = totals.likes,
        reposts = totals.reposts,
        replies = totals.replies,
        views = totals.views,
        avg_interactions = %format!("{:.1}", result.summary.average_interactions),
        "Engagement totals"
    );
    for ranked in &result.summary.top_posts {
        info!(
            rank = ranked.rank,
            score = %format!("{:.3}", ranked.score),
            url = %ranked.post.url,
            "Top post"
        );
    }
    if let Some(ref err) = result.error {
        warn!(error = %err, "Run recorded an error");
    }
}

fn write_result(result: &CollectionResult, output: Option<PathBuf>) -> Result<()> {
    let json = serde_json::to_string_pretty(result)?;
    match output {
        Some(path) => {
            std::fs::write(&path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), "Result written");
        }
        None => println!("{json}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_args(extra: &[&str]) -> Result<CollectArgs, clap::Error> {
        let argv = ["feedscout", "collect", "--query", "rust"]
            .into_iter()
            .chain(extra.iter().copied());
        match Cli::try_parse_from(argv)?.command {
            Command::Collect(args) => Ok(args),
            _ => unreachable!("collect subcommand"),
        }
    }

    #[test]
    fn since_minutes_must_be_positive() {
        assert!(collect_args(&["--since-minutes", "0"]).is_err());
        assert!(collect_args(&["--since-minutes", "-5"]).is_err());

        let args = collect_args(&["--since-minutes", "30"]).unwrap();
        let window = build_request(&args).unwrap().window.unwrap();
        assert!(window.start.is_some_and(|start| start < chrono::Utc::now()));
    }

    #[test]
    fn huge_lookback_is_an_error_not_a_panic() {
        let args = collect_args(&["--since-minutes", &i64::MAX.to_string()]).unwrap();
        assert!(build_request(&args).is_err());
    }

    #[test]
    fn exclusion_flags_invert_includes() {
        let args = collect_args(&["--exclude-replies", "--exclude-quotes"]).unwrap();
        let request = build_request(&args).unwrap();
        assert!(!request.include_replies);
        assert!(request.include_reposts);
        assert!(!request.include_quotes);
        assert!(request.window.is_none());
    }
}
