//! Online history compaction.
//!
//! Compaction discards old history without ever blocking writers for the
//! duration of a rebuild. A secondary sub-repository is seeded from a head
//! snapshot taken under the writer lock, populated off-lock, caught up from
//! the lag buffer at attach time, then kept in lockstep by the commit
//! pipeline until its own span exceeds the retention policy, at which point
//! it is promoted to primary in a single metadata flip. Readers only ever
//! observe the flip: the head revision never changes during promotion.

use std::{collections::BTreeMap, fs, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::{
    config::StoreConfig,
    errors::{Result, StoreError},
    model::CommitMessage,
    repository::{
        Repository, SubRepo, read_metadata, replay_commit, store_dir_name, write_metadata,
    },
};

/// Retention thresholds gating secondary creation and promotion. A zero
/// commit threshold disables compaction entirely; a zero day threshold
/// disables the age gate.
#[derive(Clone, Copy, Debug)]
pub struct RetentionPolicy {
    pub min_retention_commits: usize,
    pub min_retention_days: u32,
}

impl RetentionPolicy {
    pub fn from_config(cfg: &StoreConfig) -> RetentionPolicy {
        RetentionPolicy {
            min_retention_commits: cfg.min_retention_commits,
            min_retention_days: cfg.min_retention_days,
        }
    }

    pub fn enabled(&self) -> bool {
        self.min_retention_commits > 0
    }
}

impl Repository {
    /// Run one compaction cycle: promote a secondary whose span exceeds
    /// the policy (and immediately start building its successor), or start
    /// building a first secondary when the primary exceeds the policy.
    /// Returns true when any state transition happened. Thresholds are
    /// re-evaluated from scratch on every cycle.
    pub fn remove_old_commits(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<bool> {
        if !policy.enabled() {
            return Ok(false);
        }
        let inner = self.inner();

        enum Step {
            Promote,
            Build,
            Nothing,
        }
        let step = {
            let state = super::read_state(inner)?;
            if let Some(secondary) = &state.secondary {
                if exceeds(secondary, policy, now)? {
                    Step::Promote
                } else {
                    Step::Nothing
                }
            } else if !state.creating_secondary && exceeds(&state.primary, policy, now)? {
                Step::Build
            } else {
                Step::Nothing
            }
        };

        match step {
            Step::Nothing => Ok(false),
            Step::Build => {
                self.build_secondary()?;
                Ok(true)
            }
            Step::Promote => {
                self.promote_secondary()?;
                // The successor starts building right away; the next cycle
                // re-checks thresholds against the promoted primary.
                self.build_secondary()?;
                Ok(true)
            }
        }
    }
}

/// A sub-repository exceeds the policy when its retained span is larger
/// than the commit threshold and its second commit has aged past the day
/// threshold.
fn exceeds(sub: &SubRepo, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<bool> {
    let head = sub.index.head_revision();
    let first = sub.index.first_revision();
    if head == 0 || head - first <= policy.min_retention_commits as i64 {
        return Ok(false);
    }
    if policy.min_retention_days == 0 {
        return Ok(true);
    }
    let second = sub.commit_object_at(first + 1)?;
    Ok(second.when < now - Duration::days(i64::from(policy.min_retention_days)))
}

impl Repository {
    /// Build a secondary seeded from the current head, then attach it
    /// after replaying any commits that landed during the build.
    pub(crate) fn build_secondary(&self) -> Result<()> {
        let inner = self.inner();

        // Phase 1: snapshot the head and raise the lag flag, under the
        // writer lock.
        let (primary, snapshot_revision) = {
            let mut state = super::write_state(inner)?;
            if state.secondary.is_some() || state.creating_secondary {
                return Ok(());
            }
            state.creating_secondary = true;
            state.lag.clear();
            (Arc::clone(&state.primary), state.head)
        };

        // Phase 2: off-lock, copy the full tree at the snapshot revision
        // into a fresh sub-repository whose history starts at that same
        // revision, keeping future revision numbers aligned.
        let dir_name = store_dir_name(snapshot_revision);
        let built = (|| -> Result<SubRepo> {
            let secondary = SubRepo::create(&inner.root, &dir_name)?;
            let snapshot = primary.snapshot_at(snapshot_revision)?;
            let mut files = BTreeMap::new();
            for (path, id) in &snapshot.files {
                let content = primary.store.read_blob(id)?;
                files.insert(path.clone(), secondary.store.put_blob(&content)?);
            }
            let head_commit = primary.commit_object_at(snapshot_revision)?;
            secondary.root_commit(
                snapshot_revision,
                &files,
                &head_commit.author,
                head_commit.when,
                &CommitMessage::new("Create a new repository."),
            )?;
            Ok(secondary)
        })();

        let secondary = match built {
            Ok(secondary) => secondary,
            Err(e) => {
                // Drop the partial build; the lagged commits are all in the
                // primary, so nothing is lost and a later cycle retries.
                warn!(repo = %inner.repo_id(), error = %e, "secondary build failed");
                let mut state = super::write_state(inner)?;
                state.creating_secondary = false;
                state.lag.clear();
                drop(state);
                let _ = fs::remove_dir_all(inner.root.join(&dir_name));
                return Err(e);
            }
        };

        // Phase 3: replay the lag buffer in commit order and attach, under
        // the attach mutex and the writer lock.
        let _attach = inner.attach_lock.lock().expect("attach lock poisoned");
        let mut state = super::write_state(inner)?;
        let lagged: Vec<_> = state.lag.drain(..).collect();
        for commit in &lagged {
            if let Err(e) = replay_commit(
                &secondary,
                commit.base,
                commit.revision,
                &commit.author,
                commit.when,
                &commit.message,
                &commit.changes,
            ) {
                warn!(repo = %inner.repo_id(), error = %e, "lag replay failed");
                state.creating_secondary = false;
                drop(state);
                let _ = fs::remove_dir_all(inner.root.join(&dir_name));
                return Err(e);
            }
        }
        let mut metadata = read_metadata(&inner.root)?;
        metadata.secondary_repo_dir = Some(dir_name.clone());
        write_metadata(&inner.root, &metadata)?;
        state.secondary = Some(Arc::new(secondary));
        state.creating_secondary = false;
        let replayed = lagged.len();
        drop(state);
        info!(
            repo = %inner.repo_id(),
            snapshot_revision,
            replayed,
            "attached secondary"
        );
        Ok(())
    }

    /// Atomically make the secondary the new primary. The head revision is
    /// unchanged; the old primary directory is deleted asynchronously.
    pub(crate) fn promote_secondary(&self) -> Result<()> {
        let inner = self.inner();
        let old_dir;
        let new_first;
        {
            let _attach = inner.attach_lock.lock().expect("attach lock poisoned");
            let mut state = super::write_state(inner)?;
            let Some(secondary) = state.secondary.take() else {
                return Ok(());
            };
            if secondary.index.head_revision() != state.head {
                // Never flip to a mirror that is not in lockstep.
                let head = secondary.index.head_revision();
                state.secondary = Some(secondary);
                return Err(StoreError::Storage(format!(
                    "secondary head {head} does not match primary head {}",
                    state.head
                )));
            }
            let mut metadata = read_metadata(&inner.root)?;
            old_dir = state.primary.dir_name.clone();
            metadata.primary_repo_dir = secondary.dir_name.clone();
            metadata.secondary_repo_dir = None;
            write_metadata(&inner.root, &metadata)?;
            new_first = secondary.index.first_revision();
            state.primary = secondary;
        }
        let trash = inner.root.join(&old_dir);
        inner.pool.execute(move || {
            let _ = fs::remove_dir_all(trash);
        });
        info!(repo = %inner.repo_id(), new_first, "promoted secondary");
        Ok(())
    }
}
