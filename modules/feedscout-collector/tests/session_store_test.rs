//! Integration test: cookie import, persistence, and login checks.

use std::sync::Arc;
use std::time::Duration;

use feedscout_collector::testing::{cookie_json, home_html, ScriptedLauncher, StaticProbe};
use feedscout_collector::{CookieStore, HomePageProbe, LoginProbe, WaitPolicy};
use feedscout_common::{CookieImportError, LoginStatus};

const FUTURE: f64 = 4_102_444_800.0; // 2100-01-01

fn open_store(dir: &tempfile::TempDir) -> CookieStore {
    CookieStore::open(
        dir.path().join("data").join("cookies.json"),
        vec!["x.com".into(), "twitter.com".into()],
    )
    .unwrap()
}

#[test]
fn wrong_domain_leaves_prior_set_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store.import_cookies(&cookie_json(".x.com", FUTURE)).unwrap();
    let before = store.valid_cookies().unwrap();
    let file_before = std::fs::read_to_string(store.path()).unwrap();

    let err = store
        .import_cookies(&cookie_json(".other-domain.com", FUTURE))
        .unwrap_err();
    assert!(matches!(err, CookieImportError::WrongDomain { .. }));

    assert_eq!(store.valid_cookies().unwrap(), before);
    assert_eq!(std::fs::read_to_string(store.path()).unwrap(), file_before);
}

#[test]
fn invalid_format_leaves_prior_set_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store.import_cookies(&cookie_json(".x.com", FUTURE)).unwrap();
    let before = store.valid_cookies().unwrap();

    let err = store.import_cookies(r#"{"cookies": []}"#).unwrap_err();
    assert!(matches!(err, CookieImportError::InvalidCookieFormat(_)));
    assert_eq!(store.valid_cookies().unwrap(), before);
}

#[test]
fn reimport_replaces_instead_of_merging() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store.import_cookies(&cookie_json(".x.com", FUTURE)).unwrap();

    store
        .import_cookies(r#"[{"name":"auth_token","value":"new","domain":".twitter.com"}]"#)
        .unwrap();
    let set = store.valid_cookies().unwrap();
    assert_eq!(set.len(), 1);
    assert_eq!(set.get("auth_token").unwrap().value, "new");
}

#[tokio::test]
async fn identical_imports_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let probe = StaticProbe::new(LoginStatus::LoggedIn);

    store.import_cookies(&cookie_json(".x.com", FUTURE)).unwrap();
    let first = store.valid_cookies().unwrap();
    let first_status = store.check_login(&probe).await;

    store.import_cookies(&cookie_json(".x.com", FUTURE)).unwrap();
    let second = store.valid_cookies().unwrap();
    let second_status = store.check_login(&probe).await;

    assert_eq!(first, second);
    assert_eq!(first_status, LoginStatus::LoggedIn);
    assert_eq!(second_status, LoginStatus::LoggedIn);

    // Survives a restart unchanged.
    assert_eq!(open_store(&dir).valid_cookies().unwrap(), second);
}

#[tokio::test]
async fn expired_session_marks_invalid_but_keeps_cookies() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store.import_cookies(&cookie_json(".x.com", FUTURE)).unwrap();
    let before = store.valid_cookies().unwrap();

    let status = store
        .check_login(&StaticProbe::new(LoginStatus::SessionExpired))
        .await;
    assert_eq!(status, LoginStatus::SessionExpired);

    assert_eq!(store.valid_cookies().unwrap(), before);
    assert!(store.status().invalidated);
    assert!(store.session_cookies(chrono::Utc::now()).is_err());

    // The flag is persisted beside the set.
    assert!(open_store(&dir).status().invalidated);

    // A later successful probe clears it.
    let status = store.check_login(&StaticProbe::new(LoginStatus::LoggedIn)).await;
    assert_eq!(status, LoginStatus::LoggedIn);
    assert!(!store.status().invalidated);
}

#[tokio::test]
async fn invalidation_flag_follows_disk_when_persist_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store.import_cookies(&cookie_json(".x.com", FUTURE)).unwrap();

    // A plain file where the store directory should be: every write fails.
    std::fs::remove_dir_all(dir.path().join("data")).unwrap();
    std::fs::write(dir.path().join("data"), "").unwrap();

    let status = store
        .check_login(&StaticProbe::new(LoginStatus::SessionExpired))
        .await;
    assert_eq!(status, LoginStatus::SessionExpired);
    assert!(!store.status().invalidated);
    assert!(store.session_cookies(chrono::Utc::now()).is_ok());
}

#[tokio::test]
async fn locally_expired_auth_cookie_skips_probe() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store.import_cookies(&cookie_json(".x.com", 1000.0)).unwrap();

    let probe = StaticProbe::new(LoginStatus::LoggedIn);
    assert_eq!(store.check_login(&probe).await, LoginStatus::SessionExpired);
    assert_eq!(probe.calls(), 0);
}

#[tokio::test]
async fn probe_failure_is_unknown() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);

    let probe = StaticProbe::failing();
    assert_eq!(store.check_login(&probe).await, LoginStatus::Unknown);
    assert_eq!(probe.calls(), 0, "nothing stored, nothing to probe");

    store.import_cookies(&cookie_json(".x.com", FUTURE)).unwrap();
    assert_eq!(store.check_login(&probe).await, LoginStatus::Unknown);
    assert_eq!(probe.calls(), 1);
    assert!(!store.status().invalidated);
}

#[tokio::test]
async fn home_page_probe_reads_rendered_page() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store.import_cookies(&cookie_json(".x.com", FUTURE)).unwrap();
    let cookies = store.valid_cookies().unwrap();
    let wait = WaitPolicy::new(Duration::from_millis(10), Duration::from_millis(2));

    let logged_in = Arc::new(ScriptedLauncher::new(vec![]).with_initial(home_html(true)));
    let probe = HomePageProbe::new(logged_in.clone(), "https://x.com/home", wait);
    assert_eq!(probe.probe(&cookies).await.unwrap(), LoginStatus::LoggedIn);
    assert_eq!(logged_in.log().navigations, vec!["https://x.com/home"]);
    assert_eq!(logged_in.log().closed, 1);

    let wall = Arc::new(ScriptedLauncher::new(vec![]).with_initial(home_html(false)));
    let probe = HomePageProbe::new(wall.clone(), "https://x.com/home", wait);
    assert_eq!(store.check_login(&probe).await, LoginStatus::SessionExpired);
    assert!(store.status().invalidated);
    assert_eq!(wall.log().closed, 1);
}

#[tokio::test]
async fn home_page_probe_closes_session_on_navigation_failure() {
    let launcher = Arc::new(ScriptedLauncher::new(vec![]).failing_navigation());
    let probe = HomePageProbe::new(
        launcher.clone(),
        "https://x.com/home",
        WaitPolicy::new(Duration::from_millis(10), Duration::from_millis(2)),
    );
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store.import_cookies(&cookie_json(".x.com", FUTURE)).unwrap();

    assert_eq!(store.check_login(&probe).await, LoginStatus::Unknown);
    assert_eq!(launcher.log().opened, 1);
    assert_eq!(launcher.log().closed, 1);
}
