use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::directory::Directory;
use crate::error::{SearchError, SearchResult};
use crate::index::segment_infos::{SegmentInfo, SegmentInfos};

/// One merge job: a contiguous run of segments to be replaced by a single
/// output segment at the position of the first input.
pub struct OneMerge {
    pub segments: Vec<SegmentInfo>,
    aborted: AtomicBool,
    paused: AtomicBool,
    state: Mutex<OneMergeState>,
}

#[derive(Default)]
struct OneMergeState {
    error: Option<String>,
    done: bool,
    done_tx: Vec<oneshot::Sender<SearchResult<String>>>,
}

impl OneMerge {
    pub fn new(segments: Vec<SegmentInfo>) -> Self {
        Self {
            segments,
            aborted: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            state: Mutex::new(OneMergeState::default()),
        }
    }

    pub fn segment_names(&self) -> Vec<String> {
        self.segments.iter().map(|s| s.name.clone()).collect()
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Throttles a running merge without cancelling it; an abort while
    /// paused still takes effect at the next checkpoint.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    /// Merge workers poll this between work units; it parks while the
    /// merge is paused.
    pub fn check_aborted(&self) -> SearchResult<()> {
        while self.paused.load(Ordering::Acquire) && !self.is_aborted() {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        if self.is_aborted() {
            Err(SearchError::MergeAborted(format!(
                "merge of {:?} aborted",
                self.segment_names()
            )))
        } else {
            Ok(())
        }
    }

    /// Registers interest in this merge's completion; the receiver yields
    /// the merged segment's name or the failure.
    pub fn watch(&self) -> oneshot::Receiver<SearchResult<String>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap();
        if state.done {
            let result = match &state.error {
                Some(error) => Err(SearchError::ThreadError(error.clone())),
                None => Ok(String::new()),
            };
            let _ = tx.send(result);
        } else {
            state.done_tx.push(tx);
        }
        rx
    }

    pub fn set_done(&self, result: Result<String, String>) {
        let mut state = self.state.lock().unwrap();
        state.done = true;
        if let Err(error) = &result {
            state.error = Some(error.clone());
        }
        for tx in state.done_tx.drain(..) {
            let payload = match &result {
                Ok(name) => Ok(name.clone()),
                Err(error) => Err(SearchError::ThreadError(error.clone())),
            };
            let _ = tx.send(payload);
        }
    }

    pub fn take_error(&self) -> Option<String> {
        self.state.lock().unwrap().error.take()
    }
}

impl fmt::Debug for OneMerge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OneMerge({:?})", self.segment_names())
    }
}

#[derive(Debug, Default)]
pub struct MergeSpecification {
    pub merges: Vec<OneMerge>,
}

impl MergeSpecification {
    pub fn is_empty(&self) -> bool {
        self.merges.is_empty()
    }
}

/// Picks which segments to merge. Inputs of one merge must be contiguous
/// in the manifest's order.
pub trait MergePolicy: Send + Sync {
    fn find_merges(
        &self,
        dir: &dyn Directory,
        infos: &SegmentInfos,
    ) -> SearchResult<MergeSpecification>;

    /// Merges that drive the segment count down to `max_segments`.
    fn find_merges_for_optimize(
        &self,
        dir: &dyn Directory,
        infos: &SegmentInfos,
        max_segments: usize,
    ) -> SearchResult<MergeSpecification>;

    /// Whether a freshly written segment should be bundled into a
    /// compound file.
    fn use_compound_file(&self, infos: &SegmentInfos, new_segment: &SegmentInfo) -> bool;
}

/// Never merges; for tests and bulk-load-then-optimize setups.
#[derive(Debug, Default)]
pub struct NoMergePolicy;

impl MergePolicy for NoMergePolicy {
    fn find_merges(
        &self,
        _dir: &dyn Directory,
        _infos: &SegmentInfos,
    ) -> SearchResult<MergeSpecification> {
        Ok(MergeSpecification::default())
    }

    fn find_merges_for_optimize(
        &self,
        _dir: &dyn Directory,
        _infos: &SegmentInfos,
        _max_segments: usize,
    ) -> SearchResult<MergeSpecification> {
        Ok(MergeSpecification::default())
    }

    fn use_compound_file(&self, _infos: &SegmentInfos, _new_segment: &SegmentInfo) -> bool {
        false
    }
}

const DEFAULT_MERGE_FACTOR: usize = 10;
/// Sizes within 0.75 of a level's top are treated as the same level.
const LEVEL_LOG_SPAN: f64 = 0.75;

/// Shared skeleton of the logarithmic-ladder policies: segments are
/// bucketed by the log of their size and `merge_factor` same-level
/// neighbors merge into one segment a level up.
fn find_log_merges(
    sizes: &[u64],
    infos: &SegmentInfos,
    merge_factor: usize,
    min_size: u64,
    max_size: u64,
) -> MergeSpecification {
    let mut spec = MergeSpecification::default();
    let count = sizes.len();
    let factor_log = (merge_factor as f64).ln();
    let levels: Vec<f64> = sizes
        .iter()
        .map(|&size| (size.max(1).max(min_size) as f64).ln() / factor_log)
        .collect();
    let level_floor = (min_size.max(1) as f64).ln() / factor_log;

    let mut start = 0;
    while start < count {
        let mut max_level = levels[start];
        for &level in &levels[start..] {
            max_level = max_level.max(level);
        }
        let level_bottom = if max_level <= level_floor {
            -1.0
        } else {
            (max_level - LEVEL_LOG_SPAN).max(level_floor)
        };
        let mut upto = count - 1;
        while upto > start && levels[upto] < level_bottom {
            upto -= 1;
        }
        let mut lo = start;
        while lo + merge_factor <= upto + 1 {
            let hi = lo + merge_factor;
            let oversized = sizes[lo..hi].iter().any(|&s| s >= max_size);
            if !oversized {
                spec.merges
                    .push(OneMerge::new(infos.segments[lo..hi].to_vec()));
            }
            lo = hi;
        }
        start = upto + 1;
    }
    spec
}

fn optimize_merges(
    infos: &SegmentInfos,
    merge_factor: usize,
    max_segments: usize,
) -> MergeSpecification {
    let mut spec = MergeSpecification::default();
    let count = infos.len();
    // a single segment still gets rewritten when optimize must expunge
    // its deletions
    let needs_merge = count > max_segments
        || (count == 1 && max_segments == 1 && infos.segments[0].has_deletions());
    if !needs_merge {
        return spec;
    }
    if count <= merge_factor.max(2) {
        // one final merge of everything that remains
        spec.merges.push(OneMerge::new(infos.segments.clone()));
    } else {
        // peel off full-width merges from the front; the writer re-asks
        // until the count settles under the target
        let mut lo = 0;
        while lo + merge_factor <= count {
            spec.merges
                .push(OneMerge::new(infos.segments[lo..lo + merge_factor].to_vec()));
            lo += merge_factor;
        }
    }
    spec
}

/// Levels segments by byte size.
#[derive(Debug)]
pub struct LogByteSizeMergePolicy {
    pub merge_factor: usize,
    pub min_merge_mb: f64,
    pub max_merge_mb: f64,
    pub no_compound_file: bool,
}

impl Default for LogByteSizeMergePolicy {
    fn default() -> Self {
        Self {
            merge_factor: DEFAULT_MERGE_FACTOR,
            min_merge_mb: 1.6,
            max_merge_mb: 2048.0,
            no_compound_file: false,
        }
    }
}

fn segment_byte_size(dir: &dyn Directory, info: &SegmentInfo) -> u64 {
    info.files()
        .iter()
        .map(|f| dir.file_length(f).unwrap_or(0))
        .sum()
}

impl MergePolicy for LogByteSizeMergePolicy {
    fn find_merges(
        &self,
        dir: &dyn Directory,
        infos: &SegmentInfos,
    ) -> SearchResult<MergeSpecification> {
        let sizes: Vec<u64> = infos
            .segments
            .iter()
            .map(|info| segment_byte_size(dir, info))
            .collect();
        Ok(find_log_merges(
            &sizes,
            infos,
            self.merge_factor,
            (self.min_merge_mb * 1024.0 * 1024.0) as u64,
            (self.max_merge_mb * 1024.0 * 1024.0) as u64,
        ))
    }

    fn find_merges_for_optimize(
        &self,
        _dir: &dyn Directory,
        infos: &SegmentInfos,
        max_segments: usize,
    ) -> SearchResult<MergeSpecification> {
        Ok(optimize_merges(infos, self.merge_factor, max_segments))
    }

    fn use_compound_file(&self, _infos: &SegmentInfos, _new_segment: &SegmentInfo) -> bool {
        !self.no_compound_file
    }
}

/// Levels segments by document count.
#[derive(Debug)]
pub struct LogDocMergePolicy {
    pub merge_factor: usize,
    pub min_merge_docs: u32,
    pub max_merge_docs: u32,
    pub no_compound_file: bool,
}

impl Default for LogDocMergePolicy {
    fn default() -> Self {
        Self {
            merge_factor: DEFAULT_MERGE_FACTOR,
            min_merge_docs: 1000,
            max_merge_docs: u32::MAX,
            no_compound_file: false,
        }
    }
}

impl MergePolicy for LogDocMergePolicy {
    fn find_merges(
        &self,
        _dir: &dyn Directory,
        infos: &SegmentInfos,
    ) -> SearchResult<MergeSpecification> {
        let sizes: Vec<u64> = infos
            .segments
            .iter()
            .map(|info| info.num_docs() as u64)
            .collect();
        Ok(find_log_merges(
            &sizes,
            infos,
            self.merge_factor,
            self.min_merge_docs as u64,
            self.max_merge_docs as u64,
        ))
    }

    fn find_merges_for_optimize(
        &self,
        _dir: &dyn Directory,
        infos: &SegmentInfos,
        max_segments: usize,
    ) -> SearchResult<MergeSpecification> {
        Ok(optimize_merges(infos, self.merge_factor, max_segments))
    }

    fn use_compound_file(&self, _infos: &SegmentInfos, _new_segment: &SegmentInfo) -> bool {
        !self.no_compound_file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::RamDirectory;

    fn infos_with_docs(doc_counts: &[u32]) -> SegmentInfos {
        let mut infos = SegmentInfos::new();
        for &docs in doc_counts {
            let name = infos.next_segment_name();
            infos.segments.push(SegmentInfo::new(&name, docs, false));
        }
        infos
    }

    #[test]
    fn doc_policy_merges_equal_level_runs() {
        let policy = LogDocMergePolicy {
            merge_factor: 3,
            min_merge_docs: 10,
            ..Default::default()
        };
        let dir = RamDirectory::new();
        let infos = infos_with_docs(&[5, 5, 5, 5, 5, 5]);
        let spec = policy.find_merges(dir.as_ref(), &infos).unwrap();
        assert_eq!(spec.merges.len(), 2);
        assert_eq!(spec.merges[0].segment_names(), vec!["_0", "_1", "_2"]);
        assert_eq!(spec.merges[1].segment_names(), vec!["_3", "_4", "_5"]);
    }

    #[test]
    fn incomplete_run_is_left_alone() {
        let policy = LogDocMergePolicy {
            merge_factor: 10,
            min_merge_docs: 10,
            ..Default::default()
        };
        let dir = RamDirectory::new();
        let infos = infos_with_docs(&[5, 5, 5]);
        let spec = policy.find_merges(dir.as_ref(), &infos).unwrap();
        assert!(spec.is_empty());
    }

    #[test]
    fn oversized_segments_excluded() {
        let policy = LogDocMergePolicy {
            merge_factor: 2,
            min_merge_docs: 10,
            max_merge_docs: 100,
            ..Default::default()
        };
        let dir = RamDirectory::new();
        let infos = infos_with_docs(&[500, 400, 5, 5]);
        let spec = policy.find_merges(dir.as_ref(), &infos).unwrap();
        // the two big ones stay, the two small ones merge
        assert_eq!(spec.merges.len(), 1);
        assert_eq!(spec.merges[0].segment_names(), vec!["_2", "_3"]);
    }

    #[test]
    fn optimize_collapses_to_one() {
        let policy = LogDocMergePolicy::default();
        let dir = RamDirectory::new();
        let infos = infos_with_docs(&[10, 10, 10]);
        let spec = policy
            .find_merges_for_optimize(dir.as_ref(), &infos, 1)
            .unwrap();
        assert_eq!(spec.merges.len(), 1);
        assert_eq!(spec.merges[0].segments.len(), 3);

        let one = infos_with_docs(&[10]);
        let spec = policy
            .find_merges_for_optimize(dir.as_ref(), &one, 1)
            .unwrap();
        assert!(spec.is_empty());
    }

    #[test]
    fn abort_flag_surfaces_as_error() {
        let merge = OneMerge::new(vec![SegmentInfo::new("_0", 1, false)]);
        assert!(merge.check_aborted().is_ok());
        merge.abort();
        assert!(matches!(
            merge.check_aborted(),
            Err(SearchError::MergeAborted(_))
        ));
    }

    #[test]
    fn watch_after_done_resolves_immediately() {
        let merge = OneMerge::new(vec![SegmentInfo::new("_0", 1, false)]);
        merge.set_done(Ok("_5".to_string()));
        let rx = merge.watch();
        assert_eq!(rx.recv().unwrap().unwrap(), "_5");
    }
}
