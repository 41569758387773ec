//! Integration tests for the project watcher against a real filesystem.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;

use smith_index::{HashEmbedder, PathLocks, VectorIndex};
use smith_watch::{ProjectWatcher, WatchError, WatcherConfig};

fn config() -> WatcherConfig {
    WatcherConfig {
        debounce: Duration::from_millis(100),
        read_retries: 2,
        retry_delay: Duration::from_millis(20),
        workers: 2,
        queue_capacity: 16,
    }
}

/// Poll `check` until it holds or five seconds pass.
async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

/// A manual edit to a stylesheet is reflected in the index.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_manual_edit_is_reindexed() {
    let temp = tempdir().unwrap();
    let root = temp.path().join("site-s1");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("styles.css"), "body { background: white; }").unwrap();

    let index = Arc::new(VectorIndex::in_memory(Arc::new(HashEmbedder::default())));
    index.sync_tree("site-s1", &root).await.unwrap();

    let watcher = ProjectWatcher::start(index.clone(), PathLocks::new(), config());
    watcher.watch("site-s1", &root).unwrap();
    assert!(watcher.is_watching("site-s1"));

    fs::write(root.join("styles.css"), "body { background: #0b0b0b; color: #eee; }").unwrap();

    let updated = eventually(|| {
        index
            .fragments_for("site-s1", "styles.css")
            .first()
            .map(|f| f.text.contains("#0b0b0b"))
            .unwrap_or(false)
    })
    .await;
    assert!(updated, "index never picked up the manual edit");

    let hits = index.query("background", 5, Some("site-s1")).await.unwrap();
    assert!(hits.iter().all(|h| !h.fragment.text.contains("white")));

    watcher.shutdown().await;
}

/// Deleting a file removes its fragments.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deleted_file_is_removed() {
    let temp = tempdir().unwrap();
    let root = temp.path().join("site-s2");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("app.js"), "console.log('x');").unwrap();

    let index = Arc::new(VectorIndex::in_memory(Arc::new(HashEmbedder::default())));
    index.sync_tree("site-s2", &root).await.unwrap();
    assert_eq!(index.files("site-s2").len(), 1);

    let watcher = ProjectWatcher::start(index.clone(), PathLocks::new(), config());
    watcher.watch("site-s2", &root).unwrap();

    fs::remove_file(root.join("app.js")).unwrap();

    assert!(eventually(|| index.files("site-s2").is_empty()).await);
    assert!(watcher.stats().removed() >= 1);

    watcher.shutdown().await;
}

/// Watching a missing directory fails and unwatching an unknown project is a no-op.
#[tokio::test]
async fn test_watch_registration_edges() {
    let temp = tempdir().unwrap();
    let index = Arc::new(VectorIndex::in_memory(Arc::new(HashEmbedder::default())));
    let watcher = ProjectWatcher::start(index, PathLocks::new(), config());

    let missing = watcher.watch("ghost", &temp.path().join("nope"));
    assert!(matches!(missing, Err(WatchError::RootNotFound(_))));

    watcher.unwatch("ghost");
    assert!(!watcher.is_watching("ghost"));

    watcher.shutdown().await;
    let after = watcher.watch("late", temp.path());
    assert!(matches!(after, Err(WatchError::ShutDown)));
}

/// Renaming a folder moves its files' fragments to the new paths.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_renamed_directory_is_resynced() {
    let temp = tempdir().unwrap();
    let root = temp.path().join("site-s3");
    fs::create_dir_all(root.join("css")).unwrap();
    fs::write(root.join("css").join("main.css"), "h1 { color: navy; }").unwrap();
    fs::write(root.join("index.html"), "<h1>Home</h1>").unwrap();

    let index = Arc::new(VectorIndex::in_memory(Arc::new(HashEmbedder::default())));
    index.sync_tree("site-s3", &root).await.unwrap();

    let watcher = ProjectWatcher::start(index.clone(), PathLocks::new(), config());
    watcher.watch("site-s3", &root).unwrap();

    fs::rename(root.join("css"), root.join("styles")).unwrap();

    let moved = eventually(|| {
        index.files("site-s3") == vec!["index.html".to_string(), "styles/main.css".to_string()]
    })
    .await;
    assert!(moved, "index still holds {:?}", index.files("site-s3"));

    // Removing the folder drops its fragments too.
    fs::remove_dir_all(root.join("styles")).unwrap();
    assert!(eventually(|| index.files("site-s3") == vec!["index.html".to_string()]).await);

    watcher.shutdown().await;
}

/// Jobs still waiting in the debounce window are dropped on unwatch.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unwatch_discards_pending_jobs() {
    let temp = tempdir().unwrap();
    let root = temp.path().join("site-s4");
    fs::create_dir_all(&root).unwrap();

    let index = Arc::new(VectorIndex::in_memory(Arc::new(HashEmbedder::default())));
    let mut slow = config();
    slow.debounce = Duration::from_millis(400);
    let watcher = ProjectWatcher::start(index.clone(), PathLocks::new(), slow);
    watcher.watch("site-s4", &root).unwrap();

    fs::write(root.join("app.js"), "console.log('pending');").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    watcher.unwatch("site-s4");

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(index.is_empty());
    assert_eq!(watcher.stats().reindexed(), 0);

    watcher.shutdown().await;
}
