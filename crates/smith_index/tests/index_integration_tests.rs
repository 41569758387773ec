//! Integration tests for the fragment index.

use std::fs;
use std::sync::Arc;

use tempfile::tempdir;

use smith_index::{HashEmbedder, IndexOutcome, VectorIndex};

fn embedder() -> Arc<HashEmbedder> {
    Arc::new(HashEmbedder::default())
}

/// Syncing a tree indexes site files and ignores everything else.
#[tokio::test]
async fn test_sync_tree_indexes_site_files() {
    let temp = tempdir().unwrap();
    let root = temp.path().join("site-demo");
    fs::create_dir_all(root.join("assets")).unwrap();
    fs::write(root.join("index.html"), "<html><body><h1>Bakery</h1></body></html>").unwrap();
    fs::write(root.join("styles.css"), "body { background: #fff; }").unwrap();
    fs::write(root.join("assets").join("app.js"), "console.log('hi');").unwrap();
    fs::write(root.join("logo.png"), [0u8, 1, 2]).unwrap();
    fs::write(root.join(".hidden.css"), "a {}").unwrap();

    let index = VectorIndex::in_memory(embedder());
    let report = index.sync_tree("site-demo", &root).await.unwrap();

    assert_eq!(report.indexed, 3);
    assert_eq!(report.removed, 0);
    assert_eq!(
        index.files("site-demo"),
        vec!["assets/app.js".to_string(), "index.html".to_string(), "styles.css".to_string()]
    );
}

/// Files deleted from disk lose their fragments on the next sync.
#[tokio::test]
async fn test_sync_tree_drops_deleted_files() {
    let temp = tempdir().unwrap();
    let root = temp.path().join("site");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("index.html"), "<p>one</p>").unwrap();
    fs::write(root.join("app.js"), "let a = 1;").unwrap();

    let index = VectorIndex::in_memory(embedder());
    index.sync_tree("site", &root).await.unwrap();
    assert_eq!(index.files("site").len(), 2);

    fs::remove_file(root.join("app.js")).unwrap();
    let report = index.sync_tree("site", &root).await.unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(index.files("site"), vec!["index.html".to_string()]);

    fs::remove_dir_all(&root).unwrap();
    index.sync_tree("site", &root).await.unwrap();
    assert!(index.projects().is_empty());
}

/// Indexing a missing file removes what was stored for it.
#[tokio::test]
async fn test_index_file_missing_removes_fragments() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    fs::write(root.join("styles.css"), "h1 { color: red; }").unwrap();

    let index = VectorIndex::in_memory(embedder());
    let outcome = index.index_file("p", root, "styles.css").await.unwrap();
    assert_eq!(outcome, IndexOutcome::Indexed { chunks: 1 });

    fs::remove_file(root.join("styles.css")).unwrap();
    let outcome = index.index_file("p", root, "styles.css").await.unwrap();
    assert_eq!(outcome, IndexOutcome::Removed);
    assert!(index.is_empty());

    let outcome = index.index_file("p", root, "notes.txt").await.unwrap();
    assert_eq!(outcome, IndexOutcome::Skipped);
}

/// After a file is re-indexed, queries never return text from the old version.
#[tokio::test]
async fn test_query_never_returns_stale_text() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    let index = VectorIndex::in_memory(embedder());

    fs::write(root.join("styles.css"), "body { background: white; }").unwrap();
    index.index_file("p", root, "styles.css").await.unwrap();

    fs::write(root.join("styles.css"), "body { background: black; }").unwrap();
    index.index_file("p", root, "styles.css").await.unwrap();

    let hits = index.query("background white", 10, Some("p")).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].fragment.text.contains("black"));
}

/// Concurrent upserts to different files all land in the index.
#[tokio::test]
async fn test_concurrent_upserts() {
    let temp = tempdir().unwrap();
    let index = Arc::new(VectorIndex::open(temp.path().join("fragments.json"), embedder()).unwrap());

    let mut handles = Vec::new();
    for i in 0..8 {
        let index = index.clone();
        handles.push(tokio::spawn(async move {
            index
                .index_content("p", &format!("page{}.html", i), &format!("<h1>Page {}</h1>", i))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(index.files("p").len(), 8);

    let reopened = VectorIndex::open(temp.path().join("fragments.json"), embedder()).unwrap();
    assert_eq!(reopened.files("p").len(), 8);
}

/// A persist failure rolls the in-memory change back.
#[tokio::test]
async fn test_failed_persist_rolls_back() {
    let temp = tempdir().unwrap();
    // The snapshot path's parent is a regular file, so every write fails.
    let blocker = temp.path().join("blocker");
    fs::write(&blocker, "x").unwrap();
    let index = VectorIndex::open(blocker.join("fragments.json"), embedder()).unwrap();

    let result = index.index_content("p", "index.html", "<p>hello</p>").await;
    assert!(result.is_err());
    assert!(index.is_empty());
}

/// Two handles on one snapshot file keep each other's commits.
#[tokio::test]
async fn test_shared_snapshot_keeps_both_writers() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("index").join("fragments.json");

    let first = VectorIndex::open(&path, embedder()).unwrap();
    let second = VectorIndex::open(&path, embedder()).unwrap();

    second
        .index_content("site-s1", "index.html", "<h1>Bakery</h1>")
        .await
        .unwrap();
    first
        .index_content("site-s2", "styles.css", "body { background: black; }")
        .await
        .unwrap();

    // The handle that wrote last saw the other's fragments before writing.
    assert_eq!(first.files("site-s1"), vec!["index.html".to_string()]);

    // The other picks them up on its next query.
    let hits = second.query("background black", 5, Some("site-s2")).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].fragment.file_path, "styles.css");

    second.remove("site-s1", None).unwrap();
    assert!(first.query("bakery", 5, Some("site-s1")).await.unwrap().is_empty());
    assert_eq!(first.projects(), vec!["site-s2".to_string()]);

    drop(first);
    drop(second);
    let reopened = VectorIndex::open(&path, embedder()).unwrap();
    assert_eq!(reopened.projects(), vec!["site-s2".to_string()]);
    assert_eq!(reopened.fragments_for("site-s2", "styles.css").len(), 1);
    assert_eq!(reopened.revision(), 3);
}

/// Fragments written by another handle survive a commit of this one.
#[tokio::test]
async fn test_commit_merges_onto_newer_snapshot() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("fragments.json");

    let stale = VectorIndex::open(&path, embedder()).unwrap();
    stale.index_content("site-a", "app.js", "let a = 1;").await.unwrap();

    {
        let other = VectorIndex::open(&path, embedder()).unwrap();
        other.index_content("site-b", "app.js", "let b = 2;").await.unwrap();
        other.index_content("site-a", "index.html", "<p>a</p>").await.unwrap();
    }

    stale.remove("site-a", Some("app.js")).unwrap();

    let reopened = VectorIndex::open(&path, embedder()).unwrap();
    assert_eq!(reopened.files("site-a"), vec!["index.html".to_string()]);
    assert_eq!(reopened.files("site-b"), vec!["app.js".to_string()]);
}
