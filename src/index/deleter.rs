use std::sync::Arc;

use hashbrown::HashMap;
use log::{debug, warn};

use crate::directory::DirectoryRc;
use crate::error::SearchResult;
use crate::index::deletion_policy::{DeletionPolicy, IndexCommit};
use crate::index::segment_infos::{
    parse_generation, segments_file_name, SegmentInfos, SEGMENTS_GEN,
};

/// Central bookkeeper for file lifetimes. Every commit point and every
/// live reader holds references on the files it needs; a file is deleted
/// the moment its count drops to zero. Deletions the directory refuses
/// (file still open) are parked and retried.
pub struct IndexFileDeleter {
    dir: DirectoryRc,
    policy: Arc<dyn DeletionPolicy>,
    ref_counts: HashMap<String, u32>,
    commits: Vec<Arc<IndexCommit>>,
    /// Files referenced by the writer's in-memory manifest between commits.
    last_checkpoint: Vec<String>,
    /// Failed deletions awaiting retry.
    deferred: Vec<String>,
}

fn is_index_file(name: &str) -> bool {
    if name == SEGMENTS_GEN {
        return false;
    }
    name.starts_with('_') || parse_generation(name).is_some()
}

impl IndexFileDeleter {
    /// Scans the directory, builds the commit list, applies the policy's
    /// `on_init`, and sweeps files no surviving commit references.
    pub fn new(
        dir: DirectoryRc,
        policy: Arc<dyn DeletionPolicy>,
        current: &SegmentInfos,
    ) -> SearchResult<Self> {
        let mut deleter = Self {
            dir,
            policy,
            ref_counts: HashMap::new(),
            commits: Vec::new(),
            last_checkpoint: Vec::new(),
            deferred: Vec::new(),
        };

        let mut generations: Vec<u64> = deleter
            .dir
            .list_all()?
            .iter()
            .filter_map(|name| parse_generation(name))
            .filter(|&generation| generation <= current.generation)
            .collect();
        generations.sort_unstable();
        for generation in generations {
            let name = segments_file_name(generation);
            let infos = if generation == current.generation {
                current.clone()
            } else {
                match SegmentInfos::read_generation(deleter.dir.as_ref(), generation) {
                    Ok(infos) => infos,
                    Err(err) => {
                        warn!("skipping unreadable commit {name}: {err}");
                        continue;
                    }
                }
            };
            let mut files = infos.files(false);
            files.push(name.clone());
            for file in &files {
                deleter.inc_ref(file);
            }
            let timestamp = deleter.dir.file_modified(&name).unwrap_or(0);
            deleter.commits.push(Arc::new(IndexCommit::new(
                name,
                generation,
                files,
                infos.user_data.clone(),
                timestamp,
            )));
        }

        // the in-memory manifest holds its own references until replaced
        deleter.last_checkpoint = current.files(false);
        for file in deleter.last_checkpoint.clone() {
            deleter.inc_ref(&file);
        }

        // sweep stray index files from crashed sessions
        for name in deleter.dir.list_all()? {
            if is_index_file(&name) && !deleter.ref_counts.contains_key(&name) {
                debug!("removing unreferenced file {name}");
                deleter.delete_now(&name);
            }
        }

        if !deleter.commits.is_empty() {
            deleter.policy.on_init(&deleter.commits);
            deleter.reap_commits();
        }
        Ok(deleter)
    }

    pub fn inc_ref(&mut self, name: &str) {
        *self.ref_counts.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn inc_ref_all(&mut self, names: &[String]) {
        for name in names {
            self.inc_ref(name);
        }
    }

    pub fn dec_ref(&mut self, name: &str) {
        match self.ref_counts.get_mut(name) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.ref_counts.remove(name);
                self.delete_now(name);
            }
            None => warn!("dec_ref on untracked file {name}"),
        }
    }

    pub fn dec_ref_all(&mut self, names: &[String]) {
        for name in names {
            self.dec_ref(name);
        }
    }

    fn delete_now(&mut self, name: &str) {
        if !self.dir.file_exists(name) {
            return;
        }
        if let Err(err) = self.dir.delete_file(name) {
            debug!("deferring deletion of {name}: {err}");
            self.deferred.push(name.to_string());
        }
    }

    /// Retries deletions a pinned reader previously blocked.
    pub fn retry_deferred(&mut self) {
        let pending = std::mem::take(&mut self.deferred);
        for name in pending {
            if self.ref_counts.contains_key(&name) {
                continue;
            }
            self.delete_now(&name);
        }
    }

    /// Records the writer's new in-memory manifest. With `is_commit`, a
    /// durable commit point is registered and the policy is consulted.
    pub fn checkpoint(&mut self, infos: &SegmentInfos, is_commit: bool) -> SearchResult<()> {
        let new_files = infos.files(false);
        self.inc_ref_all(&new_files);

        if is_commit {
            let name = infos.current_file_name();
            let mut files = new_files.clone();
            files.push(name.clone());
            self.inc_ref(&name);
            let timestamp = self.dir.file_modified(&name).unwrap_or(0);
            self.commits.push(Arc::new(IndexCommit::new(
                name,
                infos.generation,
                files,
                infos.user_data.clone(),
                timestamp,
            )));
            self.policy.on_commit(&self.commits);
            self.reap_commits();
        }

        let previous = std::mem::replace(&mut self.last_checkpoint, new_files);
        self.dec_ref_all(&previous);
        self.retry_deferred();
        Ok(())
    }

    fn reap_commits(&mut self) {
        let mut kept = Vec::with_capacity(self.commits.len());
        for commit in std::mem::take(&mut self.commits) {
            if commit.is_deleted() {
                debug!("reclaiming commit {}", commit.segments_file);
                for file in commit.files.clone() {
                    self.dec_ref(&file);
                }
            } else {
                kept.push(commit);
            }
        }
        self.commits = kept;
    }

    pub fn commits(&self) -> &[Arc<IndexCommit>] {
        &self.commits
    }

    /// Drops the checkpoint references, e.g. on writer close.
    pub fn release_checkpoint(&mut self) {
        let previous = std::mem::take(&mut self.last_checkpoint);
        self.dec_ref_all(&previous);
        self.retry_deferred();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Directory, RamDirectory};
    use crate::index::deletion_policy::{KeepLastN, KeepOnlyLastCommit};
    use crate::index::segment_infos::SegmentInfo;

    fn touch(dir: &dyn Directory, name: &str) {
        dir.create_output(name).unwrap().close().unwrap();
    }

    fn segment_files(dir: &dyn Directory, name: &str) -> SegmentInfo {
        for ext in crate::codec::COMPOUND_MEMBER_EXTS {
            touch(dir, &crate::codec::segment_file_name(name, ext));
        }
        let mut info = SegmentInfo::new(name, 1, false);
        info.has_norms = true;
        info.has_vectors = true;
        info
    }

    #[test]
    fn keep_only_last_reclaims_old_commit_files() {
        let dir = RamDirectory::new();
        let mut infos = SegmentInfos::new();
        let name = infos.next_segment_name();
        infos.segments.push(segment_files(dir.as_ref(), &name));
        infos.commit(dir.as_ref()).unwrap();

        // second commit replaces the only segment
        let old_files = infos.segments[0].files();
        let name = infos.next_segment_name();
        infos.segments[0] = segment_files(dir.as_ref(), &name);
        infos.commit(dir.as_ref()).unwrap();

        let _deleter = IndexFileDeleter::new(
            dir.clone() as DirectoryRc,
            Arc::new(KeepOnlyLastCommit),
            &infos,
        )
        .unwrap();
        assert!(!dir.file_exists("segments_1"));
        assert!(dir.file_exists("segments_2"));
        for file in old_files {
            assert!(!dir.file_exists(&file), "{file} should be gone");
        }
        for file in infos.segments[0].files() {
            assert!(dir.file_exists(&file), "{file} should survive");
        }
    }

    #[test]
    fn stray_files_swept_at_startup() {
        let dir = RamDirectory::new();
        let mut infos = SegmentInfos::new();
        let name = infos.next_segment_name();
        infos.segments.push(segment_files(dir.as_ref(), &name));
        infos.commit(dir.as_ref()).unwrap();

        touch(dir.as_ref(), "_dead.tis");
        touch(dir.as_ref(), "not_an_index_file.txt");

        let _deleter = IndexFileDeleter::new(
            dir.clone() as DirectoryRc,
            Arc::new(KeepOnlyLastCommit),
            &infos,
        )
        .unwrap();
        assert!(!dir.file_exists("_dead.tis"));
        // non-index files are left alone
        assert!(dir.file_exists("not_an_index_file.txt"));
    }

    #[test]
    fn keep_last_n_retains_commits() {
        let dir = RamDirectory::new();
        let mut infos = SegmentInfos::new();
        let name = infos.next_segment_name();
        infos.segments.push(segment_files(dir.as_ref(), &name));
        infos.commit(dir.as_ref()).unwrap();
        infos.commit(dir.as_ref()).unwrap();
        infos.commit(dir.as_ref()).unwrap();

        let deleter = IndexFileDeleter::new(
            dir.clone() as DirectoryRc,
            Arc::new(KeepLastN::new(2)),
            &infos,
        )
        .unwrap();
        assert!(!dir.file_exists("segments_1"));
        assert!(dir.file_exists("segments_2"));
        assert!(dir.file_exists("segments_3"));
        assert_eq!(deleter.commits().len(), 2);
    }
}
