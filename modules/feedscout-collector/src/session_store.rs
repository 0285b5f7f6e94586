// Cookie-backed session store.
//
// Holds the single imported CookieSet for the target site, persists it to a
// JSON file (atomic temp + rename), and tracks an invalidation flag beside the
// set when a login probe reports the session as expired. Cookies themselves
// are never edited after import; a re-import replaces the set wholesale.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use feedscout_common::{
    CollectError, Cookie, CookieImportError, CookieSet, ImportOutcome, LoginStatus,
};

use crate::extractor::classify_login;
use crate::traits::{BrowserLauncher, LoginProbe};
use crate::wait::{poll_until, WaitPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredCookies {
    imported_at: DateTime<Utc>,
    #[serde(default)]
    invalidated_at: Option<DateTime<Utc>>,
    set: CookieSet,
}

/// Snapshot of what the store currently holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStatus {
    pub has_cookies: bool,
    pub count: usize,
    pub imported_at: Option<DateTime<Utc>>,
    pub invalidated: bool,
    pub path: PathBuf,
}

pub struct CookieStore {
    path: PathBuf,
    /// Accepted cookie domains; the first one names the stored set.
    domains: Vec<String>,
    state: RwLock<Option<StoredCookies>>,
}

impl CookieStore {
    /// Open the store, loading any previously persisted set. A corrupt file is
    /// logged and treated as empty so a fresh import can replace it.
    pub fn open(path: impl Into<PathBuf>, domains: Vec<String>) -> Result<Self> {
        anyhow::ensure!(!domains.is_empty(), "cookie store needs at least one domain");
        let path = path.into();

        let state = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<StoredCookies>(&raw) {
                Ok(stored) => {
                    info!(
                        path = %path.display(),
                        count = stored.set.len(),
                        invalidated = stored.invalidated_at.is_some(),
                        "Loaded stored cookies"
                    );
                    Some(stored)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring unreadable cookie file");
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };

        Ok(Self {
            path,
            domains,
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the stored set with the cookies in `raw` (a browser
    /// cookie-editor JSON export). Cookies for other domains are skipped.
    /// On any failure the previous set stays in place.
    pub fn import_cookies(&self, raw: &str) -> Result<ImportOutcome, CookieImportError> {
        let entries = parse_cookie_list(raw)?;
        let total = entries.len();

        let mut set = CookieSet::new(self.domains[0].clone());
        for cookie in entries {
            if self.matches_domain(&cookie.domain) {
                set.insert(cookie);
            }
        }
        if set.is_empty() {
            return Err(CookieImportError::WrongDomain {
                expected: self.domains.join(", "),
            });
        }

        let stored = StoredCookies {
            imported_at: Utc::now(),
            invalidated_at: None,
            set,
        };
        self.persist(&stored)?;

        let outcome = ImportOutcome {
            domain: stored.set.domain.clone(),
            imported: stored.set.len(),
            skipped: total.saturating_sub(stored.set.len()),
            imported_at: stored.imported_at,
        };
        *self.write_state() = Some(stored);

        info!(
            domain = %outcome.domain,
            imported = outcome.imported,
            skipped = outcome.skipped,
            "Cookies imported"
        );
        Ok(outcome)
    }

    /// The stored set, or `None` if nothing was ever imported.
    pub fn valid_cookies(&self) -> Option<CookieSet> {
        self.read_state().as_ref().map(|s| s.set.clone())
    }

    /// Cookies usable for a run at `now`.
    pub fn session_cookies(&self, now: DateTime<Utc>) -> Result<CookieSet, CollectError> {
        let guard = self.read_state();
        let stored = guard.as_ref().ok_or(CollectError::NotAuthenticated)?;
        if stored.invalidated_at.is_some() || stored.set.auth_expired_at(now) {
            return Err(CollectError::SessionExpired);
        }
        Ok(stored.set.clone())
    }

    /// Probe the site with the stored cookies. `SessionExpired` flags the set
    /// as invalidated; `LoggedIn` clears the flag. Cookies are never touched.
    pub async fn check_login(&self, probe: &dyn LoginProbe) -> LoginStatus {
        let Some(set) = self.valid_cookies() else {
            debug!("No cookies stored, login status unknown");
            return LoginStatus::Unknown;
        };

        let status = if set.auth_expired_at(Utc::now()) {
            info!("Auth cookie expired locally, skipping probe");
            LoginStatus::SessionExpired
        } else {
            match probe.probe(&set).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(error = %e, "Login probe failed");
                    LoginStatus::Unknown
                }
            }
        };

        match status {
            LoginStatus::SessionExpired => self.mark_invalidated(&set, true),
            LoginStatus::LoggedIn => self.mark_invalidated(&set, false),
            LoginStatus::Unknown => {}
        }
        status
    }

    pub fn status(&self) -> StoreStatus {
        let guard = self.read_state();
        StoreStatus {
            has_cookies: guard.is_some(),
            count: guard.as_ref().map_or(0, |s| s.set.len()),
            imported_at: guard.as_ref().map(|s| s.imported_at),
            invalidated: guard.as_ref().is_some_and(|s| s.invalidated_at.is_some()),
            path: self.path.clone(),
        }
    }

    /// Forget the stored set and delete its file.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to remove {}", self.path.display()))
            }
        }
        *self.write_state() = None;
        info!(path = %self.path.display(), "Cookie store cleared");
        Ok(())
    }

    // --- internals ---

    fn matches_domain(&self, cookie_domain: &str) -> bool {
        let host = cookie_domain.trim_start_matches('.').to_ascii_lowercase();
        self.domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{d}")))
    }

    /// Flip the invalidation flag, but only if the stored set is still the one
    /// that was probed. A concurrent re-import wins.
    fn mark_invalidated(&self, probed: &CookieSet, invalidated: bool) {
        let mut guard = self.write_state();
        let Some(stored) = guard.as_mut() else { return };
        if stored.set != *probed || stored.invalidated_at.is_some() == invalidated {
            return;
        }

        let mut next = stored.clone();
        next.invalidated_at = invalidated.then(Utc::now);
        if let Err(e) = self.persist(&next) {
            warn!(error = %e, "Failed to persist invalidation flag");
            return;
        }
        *stored = next;
        if invalidated {
            warn!("Stored session marked expired; re-import cookies");
        }
    }

    fn persist(&self, stored: &StoredCookies) -> Result<(), CookieImportError> {
        let json = serde_json::to_vec_pretty(stored)
            .map_err(|e| CookieImportError::Persist(std::io::Error::other(e)))?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        std::io::Write::write_all(&mut tmp, &json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, Option<StoredCookies>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, Option<StoredCookies>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Parse a cookie-editor export: a non-empty JSON array of objects with string
/// `name`, `value` and `domain`.
fn parse_cookie_list(raw: &str) -> Result<Vec<Cookie>, CookieImportError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| CookieImportError::InvalidCookieFormat(format!("not JSON: {e}")))?;
    let Value::Array(items) = value else {
        return Err(CookieImportError::InvalidCookieFormat(
            "expected a JSON list of cookies".into(),
        ));
    };
    if items.is_empty() {
        return Err(CookieImportError::InvalidCookieFormat(
            "cookie list is empty".into(),
        ));
    }

    items
        .iter()
        .enumerate()
        .map(|(i, item)| parse_cookie(i, item))
        .collect()
}

fn parse_cookie(index: usize, item: &Value) -> Result<Cookie, CookieImportError> {
    let obj = item.as_object().ok_or_else(|| {
        CookieImportError::InvalidCookieFormat(format!("entry {index} is not an object"))
    })?;

    let required = |key: &str| -> Result<String, CookieImportError> {
        obj.get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                CookieImportError::InvalidCookieFormat(format!(
                    "entry {index} is missing string field `{key}`"
                ))
            })
    };

    let session = obj.get("session").and_then(Value::as_bool).unwrap_or(false);
    let expires = if session {
        None
    } else {
        obj.get("expirationDate")
            .or_else(|| obj.get("expires"))
            .and_then(Value::as_f64)
    };

    Ok(Cookie {
        name: required("name")?,
        value: required("value")?,
        domain: required("domain")?,
        path: obj
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or("/")
            .to_string(),
        secure: obj.get("secure").and_then(Value::as_bool).unwrap_or(false),
        http_only: obj.get("httpOnly").and_then(Value::as_bool).unwrap_or(false),
        expires,
        same_site: obj
            .get("sameSite")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

// ---------------------------------------------------------------------------
// Home-page login probe
// ---------------------------------------------------------------------------

/// Opens a throwaway session, loads the home page, and classifies what
/// renders. The session is closed on every path.
pub struct HomePageProbe {
    launcher: Arc<dyn BrowserLauncher>,
    home_url: String,
    wait: WaitPolicy,
}

impl HomePageProbe {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, home_url: impl Into<String>, wait: WaitPolicy) -> Self {
        Self {
            launcher,
            home_url: home_url.into(),
            wait,
        }
    }
}

#[async_trait]
impl LoginProbe for HomePageProbe {
    async fn probe(&self, cookies: &CookieSet) -> Result<LoginStatus> {
        let mut session = self.launcher.open(cookies).await?;

        let outcome = async {
            session
                .navigate(&self.home_url)
                .await
                .with_context(|| format!("Failed to load {}", self.home_url))?;
            let session_ref = &session;
            let status = poll_until(
                self.wait,
                || async move {
                    Ok::<_, anyhow::Error>(classify_login(&session_ref.current_content().await?))
                },
                |status| *status != LoginStatus::Unknown,
            )
            .await?
            .into_inner();
            Ok::<_, anyhow::Error>(status)
        }
        .await;

        if let Err(e) = session.close().await {
            warn!(error = %e, "Failed to close probe session");
        }

        let status = outcome?;
        info!(status = ?status, "Login probe finished");
        Ok(status)
    }
}
