use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use hashbrown::HashMap;

use crate::error::{SearchError, SearchResult};

/// One durable commit point as shown to a [`DeletionPolicy`]. Calling
/// `delete` only flags the commit; the file deleter reclaims its files
/// after the policy returns, once no other commit references them.
#[derive(Debug)]
pub struct IndexCommit {
    pub segments_file: String,
    pub generation: u64,
    pub files: Vec<String>,
    pub user_data: Vec<(String, String)>,
    /// Wall-clock time of the commit, for age-based policies.
    pub timestamp: u64,
    deleted: AtomicBool,
}

impl IndexCommit {
    pub fn new(
        segments_file: String,
        generation: u64,
        files: Vec<String>,
        user_data: Vec<(String, String)>,
        timestamp: u64,
    ) -> Self {
        Self {
            segments_file,
            generation,
            files,
            user_data,
            timestamp,
            deleted: AtomicBool::new(false),
        }
    }

    pub fn delete(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    pub fn undelete(&self) {
        self.deleted.store(false, Ordering::Release);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }
}

/// Decides which commit points survive. `commits` is always sorted by
/// ascending generation and never empty.
pub trait DeletionPolicy: Send + Sync {
    /// Invoked once when a writer opens over existing commits.
    fn on_init(&self, commits: &[Arc<IndexCommit>]) {
        self.on_commit(commits);
    }

    /// Invoked after every new commit.
    fn on_commit(&self, commits: &[Arc<IndexCommit>]);
}

/// The default: only the newest commit survives.
#[derive(Debug, Default)]
pub struct KeepOnlyLastCommit;

impl DeletionPolicy for KeepOnlyLastCommit {
    fn on_commit(&self, commits: &[Arc<IndexCommit>]) {
        for commit in &commits[..commits.len() - 1] {
            commit.delete();
        }
    }
}

/// Keeps the newest `n` commits.
#[derive(Debug)]
pub struct KeepLastN {
    pub n: usize,
}

impl KeepLastN {
    pub fn new(n: usize) -> Self {
        Self { n: n.max(1) }
    }
}

impl DeletionPolicy for KeepLastN {
    fn on_commit(&self, commits: &[Arc<IndexCommit>]) {
        let keep_from = commits.len().saturating_sub(self.n);
        for commit in &commits[..keep_from] {
            commit.delete();
        }
    }
}

/// Deletes commits older than `max_age_ms`, measured against the newest
/// commit's timestamp. The newest commit always survives.
#[derive(Debug)]
pub struct ExpirationTimeDeletionPolicy {
    pub max_age_ms: u64,
}

impl ExpirationTimeDeletionPolicy {
    pub fn new(max_age_ms: u64) -> Self {
        Self { max_age_ms }
    }
}

impl DeletionPolicy for ExpirationTimeDeletionPolicy {
    fn on_commit(&self, commits: &[Arc<IndexCommit>]) {
        let newest = commits[commits.len() - 1].timestamp;
        for commit in &commits[..commits.len() - 1] {
            if newest.saturating_sub(commit.timestamp) > self.max_age_ms {
                commit.delete();
            }
        }
    }
}

/// Layers named snapshots over any base policy: a snapshotted commit
/// survives until its id is released, whatever the base decides.
pub struct SnapshotDeletionPolicy {
    base: Arc<dyn DeletionPolicy>,
    snapshots: Mutex<HashMap<String, String>>,
    last_commit: Mutex<Option<String>>,
}

impl SnapshotDeletionPolicy {
    pub fn new(base: Arc<dyn DeletionPolicy>) -> Self {
        Self {
            base,
            snapshots: Mutex::new(HashMap::new()),
            last_commit: Mutex::new(None),
        }
    }

    /// Pins the most recent commit under `id` and returns its segments
    /// file name, the handle an external backup would copy from.
    pub fn snapshot(&self, id: &str) -> SearchResult<String> {
        let mut snapshots = self.snapshots.lock().unwrap();
        if snapshots.contains_key(id) {
            return Err(SearchError::IllegalArgument(format!(
                "snapshot id {id} is already in use"
            )));
        }
        let last = self.last_commit.lock().unwrap();
        let segments_file = last.clone().ok_or_else(|| {
            SearchError::IllegalArgument("no commit to snapshot yet".to_string())
        })?;
        snapshots.insert(id.to_string(), segments_file.clone());
        Ok(segments_file)
    }

    pub fn release(&self, id: &str) -> SearchResult<()> {
        self.snapshots
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SearchError::IllegalArgument(format!("no snapshot with id {id}")))
    }
}

impl DeletionPolicy for SnapshotDeletionPolicy {
    fn on_init(&self, commits: &[Arc<IndexCommit>]) {
        *self.last_commit.lock().unwrap() =
            Some(commits[commits.len() - 1].segments_file.clone());
        self.base.on_init(commits);
        self.protect_snapshots(commits);
    }

    fn on_commit(&self, commits: &[Arc<IndexCommit>]) {
        *self.last_commit.lock().unwrap() =
            Some(commits[commits.len() - 1].segments_file.clone());
        self.base.on_commit(commits);
        self.protect_snapshots(commits);
    }
}

impl SnapshotDeletionPolicy {
    fn protect_snapshots(&self, commits: &[Arc<IndexCommit>]) {
        let snapshots = self.snapshots.lock().unwrap();
        if snapshots.is_empty() {
            return;
        }
        for commit in commits {
            if snapshots.values().any(|f| *f == commit.segments_file) {
                commit.undelete();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commits(stamps: &[u64]) -> Vec<Arc<IndexCommit>> {
        stamps
            .iter()
            .enumerate()
            .map(|(i, &ts)| {
                Arc::new(IndexCommit::new(
                    format!("segments_{:x}", i + 1),
                    i as u64 + 1,
                    vec![],
                    vec![],
                    ts,
                ))
            })
            .collect()
    }

    #[test]
    fn keep_only_last() {
        let commits = commits(&[10, 20, 30]);
        KeepOnlyLastCommit.on_commit(&commits);
        assert!(commits[0].is_deleted());
        assert!(commits[1].is_deleted());
        assert!(!commits[2].is_deleted());
    }

    #[test]
    fn keep_last_n() {
        let commits = commits(&[1, 2, 3, 4]);
        KeepLastN::new(2).on_commit(&commits);
        let flags: Vec<bool> = commits.iter().map(|c| c.is_deleted()).collect();
        assert_eq!(flags, vec![true, true, false, false]);
    }

    #[test]
    fn expiration_keeps_young_and_newest() {
        let commits = commits(&[0, 5_000, 9_000, 10_000]);
        ExpirationTimeDeletionPolicy::new(2_000).on_commit(&commits);
        let flags: Vec<bool> = commits.iter().map(|c| c.is_deleted()).collect();
        assert_eq!(flags, vec![true, true, false, false]);
    }

    #[test]
    fn snapshot_overrides_base() {
        let policy = SnapshotDeletionPolicy::new(Arc::new(KeepOnlyLastCommit));
        let first = commits(&[1]);
        policy.on_commit(&first);
        let pinned = policy.snapshot("backup").unwrap();
        assert_eq!(pinned, "segments_1");

        let both = commits(&[1, 2]);
        policy.on_commit(&both);
        assert!(!both[0].is_deleted());

        policy.release("backup").unwrap();
        assert!(policy.release("backup").is_err());
        let both = commits(&[1, 2]);
        policy.on_commit(&both);
        assert!(both[0].is_deleted());
    }
}
