//! Online compaction: secondary build, mirroring, promotion, and the
//! invariance of reads across the flip.

use std::{collections::BTreeMap, sync::Arc};

use chrono::Utc;
use serde_json::json;
use tempfile::tempdir;

use dogma_storage::{
    Author, Change, CommitMessage, ComputationCache, EntryContent, Query, Repository,
    RepositoryManager, RetentionPolicy, Revision, StoreConfig, StoreError,
};

fn author() -> Author {
    Author::new("alice", "alice@example.com")
}

fn new_manager(dir: &std::path::Path) -> RepositoryManager {
    let cache =
        Arc::new(ComputationCache::new(StoreConfig::DEFAULT_CACHE_SPEC).expect("cache spec"));
    let cfg = StoreConfig {
        min_retention_commits: 5,
        min_retention_days: 0,
        ..StoreConfig::default()
    };
    RepositoryManager::new(dir, "proj", cfg, cache).expect("manager")
}

async fn bump(repo: &Repository, value: i64) {
    let base = repo.head_revision();
    repo.commit(
        Revision::from(base),
        Utc::now(),
        author(),
        CommitMessage::new(format!("bump {value}")),
        vec![Change::upsert_json("/n.json", json!({"i": value}))],
        false,
    )
    .await
    .expect("commit");
}

async fn content_at(repo: &Repository, revision: i64) -> EntryContent {
    repo.get(Revision::from(revision), Query::identity("/n.json").unwrap())
        .await
        .unwrap()
        .content
}

#[tokio::test]
async fn test_compaction_cycle_and_invariance() {
    let dir = tempdir().unwrap();
    let manager = new_manager(dir.path());
    let repo = manager.create("bar", author(), Utc::now()).unwrap();
    let policy = RetentionPolicy {
        min_retention_commits: 5,
        min_retention_days: 0,
    };

    for i in 0..20 {
        bump(&repo, i).await;
    }
    assert_eq!(repo.head_revision(), 21);
    assert_eq!(repo.first_revision(), 1);

    // First cycle: the primary exceeds the policy, a secondary is built
    // from the head snapshot. The primary keeps its history.
    assert!(repo.remove_old_commits(&policy, Utc::now()).unwrap());
    assert_eq!(repo.first_revision(), 1);
    assert_eq!(repo.head_revision(), 21);
    // The freshly attached secondary has no span yet.
    assert!(!repo.remove_old_commits(&policy, Utc::now()).unwrap());

    // Mirrored commits accumulate span in the secondary.
    for i in 20..26 {
        bump(&repo, i).await;
    }
    assert_eq!(repo.head_revision(), 27);

    let before: BTreeMap<i64, EntryContent> = {
        let mut map = BTreeMap::new();
        for revision in 21..=27 {
            map.insert(revision, content_at(&repo, revision).await);
        }
        map
    };

    // Second cycle: the secondary's span (27 - 21 = 6) exceeds the policy,
    // so it is promoted and a successor starts building.
    assert!(repo.remove_old_commits(&policy, Utc::now()).unwrap());
    assert_eq!(repo.head_revision(), 27, "promotion never moves the head");
    assert_eq!(repo.first_revision(), 21);

    // Compaction invariance: every retained revision reads identically.
    for revision in 21..=27 {
        assert_eq!(
            content_at(&repo, revision).await,
            before[&revision],
            "revision {revision} changed across promotion"
        );
    }

    // The full retained history is still walkable.
    let history = repo
        .history(Revision::from(21), Revision::HEAD, "/**", 100)
        .await
        .unwrap();
    assert_eq!(history.len(), 7);
    assert_eq!(history[0].revision, Revision::from(21));
    assert_eq!(history[6].revision, Revision::from(27));

    // Discarded revisions clamp up to the first retained one.
    assert_eq!(
        repo.normalize(Revision::from(2)).await.unwrap(),
        Revision::from(21)
    );
    assert_eq!(
        repo.normalize(Revision::from(-100)).await.unwrap(),
        Revision::from(21)
    );
    assert_eq!(
        content_at(&repo, 2).await,
        before[&21],
        "reads below the first retained revision clamp to it"
    );
}

#[tokio::test]
async fn test_commits_keep_flowing_through_compaction() {
    let dir = tempdir().unwrap();
    let manager = new_manager(dir.path());
    let repo = manager.create("bar", author(), Utc::now()).unwrap();
    let policy = RetentionPolicy {
        min_retention_commits: 5,
        min_retention_days: 0,
    };

    for i in 0..10 {
        bump(&repo, i).await;
        repo.remove_old_commits(&policy, Utc::now()).unwrap();
    }
    // Writes never stalled and the head advanced once per commit.
    assert_eq!(repo.head_revision(), 11);
    assert_eq!(
        content_at(&repo, 11).await,
        EntryContent::Json(json!({"i": 9}))
    );
}

#[tokio::test]
async fn test_disabled_policy_is_inert() {
    let dir = tempdir().unwrap();
    let manager = new_manager(dir.path());
    let repo = manager.create("bar", author(), Utc::now()).unwrap();
    for i in 0..10 {
        bump(&repo, i).await;
    }
    let disabled = RetentionPolicy {
        min_retention_commits: 0,
        min_retention_days: 0,
    };
    assert!(!repo.remove_old_commits(&disabled, Utc::now()).unwrap());
    assert_eq!(repo.first_revision(), 1);
}

#[tokio::test]
async fn test_retention_days_gate_fresh_history() {
    let dir = tempdir().unwrap();
    let manager = new_manager(dir.path());
    let repo = manager.create("bar", author(), Utc::now()).unwrap();
    for i in 0..10 {
        bump(&repo, i).await;
    }
    // Commits are seconds old; a one-day gate blocks compaction.
    let gated = RetentionPolicy {
        min_retention_commits: 5,
        min_retention_days: 1,
    };
    assert!(!repo.remove_old_commits(&gated, Utc::now()).unwrap());
    assert_eq!(repo.first_revision(), 1);

    // With the clock a month ahead the same policy compacts.
    let future = Utc::now() + chrono::Duration::days(30);
    assert!(repo.remove_old_commits(&gated, future).unwrap());
}

#[tokio::test]
async fn test_watch_survives_promotion() {
    let dir = tempdir().unwrap();
    let manager = new_manager(dir.path());
    let repo = manager.create("bar", author(), Utc::now()).unwrap();
    let policy = RetentionPolicy {
        min_retention_commits: 2,
        min_retention_days: 0,
    };
    for i in 0..5 {
        bump(&repo, i).await;
    }
    repo.remove_old_commits(&policy, Utc::now()).unwrap();

    let head = repo.head_revision();
    let watch = repo.watch(Revision::from(head), "/n.json").await.unwrap();

    for i in 5..8 {
        bump(&repo, i).await;
    }
    repo.remove_old_commits(&policy, Utc::now()).unwrap();

    let revision = tokio::time::timeout(std::time::Duration::from_secs(5), watch)
        .await
        .expect("watch must have completed")
        .unwrap();
    assert!(revision.as_i64() > head);
}

#[tokio::test]
async fn test_mirror_reopen_after_restart() {
    let dir = tempdir().unwrap();
    {
        let manager = new_manager(dir.path());
        let repo = manager.create("bar", author(), Utc::now()).unwrap();
        let policy = RetentionPolicy {
            min_retention_commits: 3,
            min_retention_days: 0,
        };
        for i in 0..6 {
            bump(&repo, i).await;
        }
        repo.remove_old_commits(&policy, Utc::now()).unwrap();
        for i in 6..8 {
            bump(&repo, i).await;
        }
        manager.close_all();
    }

    let manager = new_manager(dir.path());
    let repo = manager.get("bar").unwrap();
    assert_eq!(repo.head_revision(), 9);
    assert_eq!(
        content_at(&repo, 9).await,
        EntryContent::Json(json!({"i": 7}))
    );

    // The reopened secondary still mirrors and can still be promoted.
    let policy = RetentionPolicy {
        min_retention_commits: 3,
        min_retention_days: 0,
    };
    for i in 8..12 {
        bump(&repo, i).await;
    }
    assert!(repo.remove_old_commits(&policy, Utc::now()).unwrap());
    assert_eq!(repo.first_revision(), 7);
    assert_eq!(repo.head_revision(), 13);
}

#[tokio::test]
async fn test_old_revisions_unreachable_after_promotion() {
    let dir = tempdir().unwrap();
    let manager = new_manager(dir.path());
    let repo = manager.create("bar", author(), Utc::now()).unwrap();
    let policy = RetentionPolicy {
        min_retention_commits: 2,
        min_retention_days: 0,
    };
    for i in 0..5 {
        bump(&repo, i).await;
    }
    repo.remove_old_commits(&policy, Utc::now()).unwrap();
    for i in 5..8 {
        bump(&repo, i).await;
    }
    repo.remove_old_commits(&policy, Utc::now()).unwrap();

    let first = repo.first_revision();
    assert!(first > 1);
    // Absolute revisions below the retained range clamp rather than fail.
    assert_eq!(
        repo.normalize(Revision::INIT).await.unwrap(),
        Revision::from(first)
    );
    // And a revision beyond the head still fails.
    let beyond = repo.head_revision() + 1;
    assert!(matches!(
        repo.normalize(Revision::from(beyond)).await,
        Err(StoreError::RevisionNotFound(_))
    ));
}
