//! Long-poll watch behavior against a live repository.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde_json::json;
use tempfile::tempdir;
use tokio::time::timeout;

use dogma_storage::{
    Author, Change, CommitMessage, ComputationCache, Repository, RepositoryManager, Revision,
    StoreConfig, StoreError,
};

fn author() -> Author {
    Author::new("alice", "alice@example.com")
}

fn new_manager(dir: &std::path::Path) -> RepositoryManager {
    let cache =
        Arc::new(ComputationCache::new(StoreConfig::DEFAULT_CACHE_SPEC).expect("cache spec"));
    RepositoryManager::new(dir, "proj", StoreConfig::default(), cache).expect("manager")
}

async fn commit_json(repo: &Repository, base: i64, path: &str, value: serde_json::Value) {
    repo.commit(
        Revision::from(base),
        Utc::now(),
        author(),
        CommitMessage::new("update"),
        vec![Change::upsert_json(path, value)],
        false,
    )
    .await
    .expect("commit");
}

#[tokio::test]
async fn test_watch_completes_on_matching_commit() {
    let dir = tempdir().unwrap();
    let manager = new_manager(dir.path());
    let repo = manager.create("bar", author(), Utc::now()).unwrap();
    commit_json(&repo, 1, "/a.json", json!({"k": "v"})).await;

    let watch = repo.watch(Revision::from(2), "/a.json").await.unwrap();

    let writer = repo.clone();
    let handle = tokio::spawn(async move {
        commit_json(&writer, 2, "/a.json", json!({"k": "w"})).await;
    });

    let revision = timeout(Duration::from_secs(5), watch)
        .await
        .expect("watch should complete")
        .unwrap();
    assert_eq!(revision, Revision::from(3));
    handle.await.unwrap();
}

#[tokio::test]
async fn test_watch_ignores_unrelated_commit() {
    let dir = tempdir().unwrap();
    let manager = new_manager(dir.path());
    let repo = manager.create("bar", author(), Utc::now()).unwrap();
    commit_json(&repo, 1, "/a.json", json!({"k": "v"})).await;
    commit_json(&repo, 2, "/c.json", json!(1)).await;

    let watch = repo.watch(Revision::from(3), "/b.json").await.unwrap();
    commit_json(&repo, 3, "/a.json", json!({"k": "x"})).await;

    // The registration must still be pending after an unrelated commit.
    assert!(timeout(Duration::from_millis(200), watch).await.is_err());
}

#[tokio::test]
async fn test_watch_resolves_immediately_when_already_newer() {
    let dir = tempdir().unwrap();
    let manager = new_manager(dir.path());
    let repo = manager.create("bar", author(), Utc::now()).unwrap();
    commit_json(&repo, 1, "/a.json", json!({"k": "v"})).await;
    commit_json(&repo, 2, "/a.json", json!({"k": "w"})).await;

    // Head already moved past last_known with a matching change.
    let watch = repo.watch(Revision::from(2), "/a.json").await.unwrap();
    let revision = timeout(Duration::from_secs(1), watch)
        .await
        .expect("ready watch resolves without a commit")
        .unwrap();
    assert_eq!(revision, Revision::from(3));
}

#[tokio::test]
async fn test_watch_fast_path_from_initial_revision() {
    let dir = tempdir().unwrap();
    let manager = new_manager(dir.path());
    let repo = manager.create("bar", author(), Utc::now()).unwrap();
    commit_json(&repo, 1, "/a.json", json!({"k": "v"})).await;

    // last_known = 1 and a matching file exists at the head.
    let latest = repo
        .find_latest_revision(Revision::INIT, "/a.json")
        .await
        .unwrap();
    assert_eq!(latest, Some(Revision::from(2)));

    // No matching file: nothing to report.
    let none = repo
        .find_latest_revision(Revision::INIT, "/other.json")
        .await
        .unwrap();
    assert_eq!(none, None);

    // Nothing is newer than the head itself.
    let at_head = repo
        .find_latest_revision(Revision::from(2), "/a.json")
        .await
        .unwrap();
    assert_eq!(at_head, None);
}

#[tokio::test]
async fn test_watch_safety_revision_exceeds_last_known() {
    let dir = tempdir().unwrap();
    let manager = new_manager(dir.path());
    let repo = manager.create("bar", author(), Utc::now()).unwrap();
    commit_json(&repo, 1, "/a.json", json!({"k": "v"})).await;

    let watch = repo.watch(Revision::HEAD, "/**").await.unwrap();
    commit_json(&repo, 2, "/a.json", json!({"k": "w"})).await;
    let revision = timeout(Duration::from_secs(5), watch).await.unwrap().unwrap();
    assert!(revision > Revision::from(2));
}

#[tokio::test]
async fn test_watch_cancel() {
    let dir = tempdir().unwrap();
    let manager = new_manager(dir.path());
    let repo = manager.create("bar", author(), Utc::now()).unwrap();
    commit_json(&repo, 1, "/a.json", json!({"k": "v"})).await;

    let mut watch = repo.watch(Revision::from(2), "/a.json").await.unwrap();
    watch.cancel();
    commit_json(&repo, 2, "/a.json", json!({"k": "w"})).await;

    let result = timeout(Duration::from_millis(200), watch).await;
    match result {
        // Cancellation surfaces as the close error if polled to completion.
        Ok(Err(StoreError::Cancelled(_))) => {}
        // Or the future simply never resolves.
        Err(_) => {}
        other => panic!("cancelled watch must not yield a revision: {other:?}"),
    }
}

#[tokio::test]
async fn test_close_completes_pending_watches() {
    let dir = tempdir().unwrap();
    let manager = new_manager(dir.path());
    let repo = manager.create("bar", author(), Utc::now()).unwrap();
    commit_json(&repo, 1, "/a.json", json!({"k": "v"})).await;

    let watch = repo.watch(Revision::from(2), "/a.json").await.unwrap();
    repo.close();

    let result = timeout(Duration::from_secs(1), watch)
        .await
        .expect("close must complete pending watches");
    assert!(matches!(result, Err(StoreError::Cancelled(_))));
}

#[tokio::test]
async fn test_one_commit_wakes_multiple_watchers() {
    let dir = tempdir().unwrap();
    let manager = new_manager(dir.path());
    let repo = manager.create("bar", author(), Utc::now()).unwrap();
    commit_json(&repo, 1, "/conf/a.json", json!(1)).await;

    let watch_all = repo.watch(Revision::from(2), "/**").await.unwrap();
    let watch_glob = repo.watch(Revision::from(2), "/conf/*.json").await.unwrap();
    let watch_other = repo.watch(Revision::from(2), "/other/**").await.unwrap();

    commit_json(&repo, 2, "/conf/a.json", json!(2)).await;

    assert_eq!(
        timeout(Duration::from_secs(5), watch_all).await.unwrap().unwrap(),
        Revision::from(3)
    );
    assert_eq!(
        timeout(Duration::from_secs(5), watch_glob).await.unwrap().unwrap(),
        Revision::from(3)
    );
    assert!(timeout(Duration::from_millis(200), watch_other).await.is_err());
}
