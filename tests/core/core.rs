use agentfeed::core::broker::{AUDIT_LOG_NAME, DbBroker};
use agentfeed::core::config::{self, RateLimitConfig};
use agentfeed::core::db;
use agentfeed::core::error::AgentFeedError;
use agentfeed::core::rate_limit::{RateLimiter, spawn_sweeper_every};
use agentfeed::core::schemas;
use agentfeed::core::store::{STORE_DIR, Store, find_project_root};
use agentfeed::core::time::{Clock, ManualClock, SystemClock};
use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

#[test]
fn store_initialize_writes_db_config_and_is_idempotent() {
    let tmp = tempdir().unwrap();
    let store = Store::at(tmp.path());
    assert!(!store.is_initialized());
    assert!(matches!(
        store.require_initialized(),
        Err(AgentFeedError::NotFound(_))
    ));

    store.initialize().unwrap();
    assert!(store.is_initialized());
    assert!(store.db_path().ends_with(schemas::FEED_DB_NAME));
    let config_path = config::config_path(tmp.path());
    assert!(config_path.exists());

    // A hand-edited config survives a second init.
    fs::write(&config_path, "[rate_limit]\nmax_requests = 3\n").unwrap();
    store.initialize().unwrap();
    let loaded = store.load_config().unwrap();
    assert_eq!(loaded.rate_limit.max_requests, 3);
    assert_eq!(loaded.rate_limit.window_secs, 60);
}

#[test]
fn project_root_is_found_from_nested_directory() {
    let tmp = tempdir().unwrap();
    Store::at(tmp.path()).initialize().unwrap();
    let nested = tmp.path().join("a").join("b");
    fs::create_dir_all(&nested).unwrap();

    assert_eq!(find_project_root(&nested).unwrap(), tmp.path());
    assert!(tmp.path().join(STORE_DIR).is_dir());
}

#[test]
fn invalid_config_is_a_validation_error() {
    let tmp = tempdir().unwrap();
    let store = Store::at(tmp.path());
    store.initialize().unwrap();
    fs::write(
        config::config_path(tmp.path()),
        "[content]\nflag_threshold = 0.9\nblock_threshold = 0.5\n",
    )
    .unwrap();
    assert!(matches!(
        store.load_config(),
        Err(AgentFeedError::ValidationError(_))
    ));

    fs::write(config::config_path(tmp.path()), "[rate_limit\n").unwrap();
    assert!(matches!(
        store.load_config(),
        Err(AgentFeedError::ConfigError(_))
    ));
}

#[test]
fn broker_audits_success_and_failure() {
    let tmp = tempdir().unwrap();
    db::initialize_feed_db(tmp.path()).unwrap();
    let broker = DbBroker::new(tmp.path());
    let db_path = db::feed_db_path(tmp.path());

    broker
        .with_conn(&db_path, "tester", "widget.ok", |conn| {
            conn.execute_batch("SELECT 1;")?;
            Ok(())
        })
        .unwrap();
    let failed: Result<(), _> = broker.with_conn(&db_path, "tester", "widget.fail", |conn| {
        conn.execute("INSERT INTO no_such_table VALUES(1)", [])?;
        Ok(())
    });
    assert!(failed.is_err());

    let events = broker.read_events().unwrap();
    let widget_ops: Vec<_> = events
        .iter()
        .filter(|e| e.op.starts_with("widget."))
        .map(|e| (e.op.as_str(), e.status.as_str()))
        .collect();
    assert_eq!(widget_ops, vec![("widget.ok", "success"), ("widget.fail", "error")]);
    assert!(tmp.path().join(AUDIT_LOG_NAME).exists());
}

#[test]
fn concurrent_checks_never_exceed_capacity() {
    let limiter = Arc::new(RateLimiter::new(
        &RateLimitConfig {
            max_requests: 30,
            window_secs: 60,
        },
        Arc::new(ManualClock::new(5_000)),
    ));
    let threads = 16;
    let per_thread = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let limiter = limiter.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                (0..per_thread)
                    .filter(|_| limiter.check("agent-hot").unwrap().allowed)
                    .count()
            })
        })
        .collect();

    let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(admitted, 30);
    let status = limiter.status("agent-hot").unwrap();
    assert_eq!(status.remaining, 0);
}

#[test]
fn sweeper_thread_evicts_expired_windows() {
    let clock = Arc::new(ManualClock::new(0));
    let limiter = Arc::new(RateLimiter::new(
        &RateLimitConfig {
            max_requests: 5,
            window_secs: 1,
        },
        clock.clone(),
    ));
    limiter.check("a").unwrap();
    limiter.check("b").unwrap();
    assert_eq!(limiter.tracked_identities().unwrap(), 2);

    let _sweeper = spawn_sweeper_every(limiter.clone(), Duration::from_millis(10));
    clock.advance(Duration::from_secs(2));

    let deadline = Instant::now() + Duration::from_secs(5);
    while limiter.tracked_identities().unwrap() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(limiter.tracked_identities().unwrap(), 0);
}

#[test]
fn system_clock_is_monotone_enough_for_windows() {
    let a = SystemClock.now_ms();
    let b = SystemClock.now_ms();
    assert!(b >= a);
    assert!(a > 1_600_000_000_000);
}
