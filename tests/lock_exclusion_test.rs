//! Watchers sharing a lock file never run their actions concurrently.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use confwatch::watcher::{ActionRunner, ConfigWatcher, CriticalSectionGate, WatchSpec};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const QUIET_MS: u64 = 200;

/// Hook that brackets a slow section with start/end lines in `log`.
fn slow_hook(name: &str, log: &Path) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!(
            "echo start {name} >> {log}; sleep 0.3; echo end {name} >> {log}",
            log = log.display()
        ),
    ]
}

fn make_root(base: &Path, name: &str) -> PathBuf {
    let root = base.join(name);
    fs::create_dir_all(&root).unwrap();
    root
}

#[tokio::test]
async fn test_shared_lock_serializes_actions() {
    let temp_dir = TempDir::new().unwrap();
    let base = temp_dir.path().canonicalize().unwrap();
    let log = base.join("hooks.log");
    let lock = base.join("confwatch.lock");

    let shutdown = CancellationToken::new();
    let (report_tx, mut report_rx) = mpsc::unbounded_channel();
    let mut handles = Vec::new();
    let mut roots = Vec::new();

    for name in ["a", "b", "c"] {
        let root = make_root(&base, name);
        let watcher = ConfigWatcher::builder()
            .spec(WatchSpec::new(&root))
            .quiet_period_ms(QUIET_MS)
            .lock_path(lock.clone())
            .runner(ActionRunner::whole_tree(slow_hook(name, &log)))
            .report_to(report_tx.clone())
            .build()
            .unwrap();
        handles.push(tokio::spawn(watcher.watch(shutdown.clone())));
        roots.push(root);
    }
    drop(report_tx);
    sleep(Duration::from_millis(200)).await;

    // All three settle at about the same moment.
    for root in &roots {
        fs::write(root.join("aliases"), "root: admin\n").unwrap();
    }

    for _ in 0..roots.len() {
        let invocation = timeout(Duration::from_secs(10), report_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(invocation.succeeded());
    }

    let content = fs::read_to_string(&log).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 6);
    for pair in lines.chunks(2) {
        let started = pair[0].strip_prefix("start ").unwrap();
        let ended = pair[1].strip_prefix("end ").unwrap();
        assert_eq!(started, ended, "actions overlapped: {lines:?}");
    }

    shutdown.cancel();
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
}

#[tokio::test]
async fn test_burst_waits_for_foreign_lock_holder() {
    let temp_dir = TempDir::new().unwrap();
    let base = temp_dir.path().canonicalize().unwrap();
    let root = make_root(&base, "postfix");
    let lock = base.join("confwatch.lock");
    let marker = base.join("ran");

    let (report_tx, mut report_rx) = mpsc::unbounded_channel();
    let watcher = ConfigWatcher::builder()
        .spec(WatchSpec::new(&root))
        .quiet_period_ms(QUIET_MS)
        .lock_path(lock.clone())
        .runner(ActionRunner::whole_tree(vec![
            "touch".to_string(),
            marker.display().to_string(),
        ]))
        .report_to(report_tx)
        .build()
        .unwrap();

    // Another holder, e.g. an administrator's manual reload.
    let holder = CriticalSectionGate::new(&lock);
    let guard = holder.acquire().await.unwrap();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(watcher.watch(shutdown.clone()));
    sleep(Duration::from_millis(200)).await;

    fs::write(root.join("virtual"), "a@example.com b\n").unwrap();
    sleep(Duration::from_millis(QUIET_MS * 4)).await;
    assert!(!marker.exists(), "action ran while the lock was held");

    drop(guard);
    let invocation = timeout(Duration::from_secs(5), report_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(invocation.succeeded());
    assert!(marker.exists());

    shutdown.cancel();
    assert!(handle.await.unwrap().is_ok());
}
