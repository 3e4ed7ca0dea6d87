use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver, Sender};
use log::error;

use crate::error::SearchResult;
use crate::index::merge_policy::OneMerge;

/// Hands registered merges to a scheduler and executes them. Implemented
/// by the writer's internals; schedulers stay ignorant of index state.
pub trait MergeSource: Send + Sync {
    /// Pops the next registered merge, if any.
    fn next_merge(&self) -> Option<Arc<OneMerge>>;

    /// Runs one merge to completion, splicing the result into the
    /// manifest. Errors are recorded on the merge by the source.
    fn run_merge(&self, merge: Arc<OneMerge>) -> SearchResult<()>;
}

pub trait MergeScheduler: Send + Sync {
    /// Drains the source's pending merges. May return before the merges
    /// finish if execution is concurrent.
    fn merge(&self, source: Arc<dyn MergeSource>) -> SearchResult<()>;

    /// Blocks until every merge this scheduler started has unwound.
    fn close(&self) -> SearchResult<()>;
}

/// Runs merges inline on the calling thread; errors surface directly.
#[derive(Debug, Default)]
pub struct SerialMergeScheduler;

impl MergeScheduler for SerialMergeScheduler {
    fn merge(&self, source: Arc<dyn MergeSource>) -> SearchResult<()> {
        while let Some(merge) = source.next_merge() {
            source.run_merge(merge)?;
        }
        Ok(())
    }

    fn close(&self) -> SearchResult<()> {
        Ok(())
    }
}

pub const DEFAULT_MAX_MERGE_COUNT: usize = 3;

type MergeJob = (Arc<OneMerge>, Arc<dyn MergeSource>);

struct WorkerPool {
    sender: Sender<MergeJob>,
    handles: Vec<JoinHandle<()>>,
}

/// Runs merges on a pool of `max_merge_count` background workers fed
/// through a bounded channel; a full pipeline blocks the submitter, so no
/// more merges run or queue than the bound allows.
pub struct ConcurrentMergeScheduler {
    max_merge_count: usize,
    pool: Mutex<Option<WorkerPool>>,
    thread_seq: AtomicUsize,
}

impl ConcurrentMergeScheduler {
    pub fn new(max_merge_count: usize) -> Self {
        Self {
            max_merge_count: max_merge_count.max(1),
            pool: Mutex::new(None),
            thread_seq: AtomicUsize::new(0),
        }
    }

    fn worker_loop(receiver: Receiver<MergeJob>) {
        for (merge, source) in receiver.iter() {
            if let Err(err) = source.run_merge(Arc::clone(&merge)) {
                // background failures are recorded on the merge and
                // surfaced to the next foreground call that looks
                error!("merge of {:?} failed: {err}", merge.segment_names());
            }
        }
    }

    fn ensure_pool(&self) -> SearchResult<Sender<MergeJob>> {
        let mut pool = self.pool.lock().unwrap();
        if let Some(pool) = pool.as_ref() {
            return Ok(pool.sender.clone());
        }
        let (sender, receiver) = crossbeam::channel::bounded::<MergeJob>(self.max_merge_count);
        let mut handles = Vec::with_capacity(self.max_merge_count);
        for _ in 0..self.max_merge_count {
            let receiver = receiver.clone();
            let id = self.thread_seq.fetch_add(1, Ordering::Relaxed);
            handles.push(
                thread::Builder::new()
                    .name(format!("merge-worker-{id}"))
                    .spawn(move || Self::worker_loop(receiver))?,
            );
        }
        let sender_out = sender.clone();
        *pool = Some(WorkerPool { sender, handles });
        Ok(sender_out)
    }
}

impl Default for ConcurrentMergeScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MERGE_COUNT)
    }
}

impl MergeScheduler for ConcurrentMergeScheduler {
    fn merge(&self, source: Arc<dyn MergeSource>) -> SearchResult<()> {
        let sender = self.ensure_pool()?;
        while let Some(merge) = source.next_merge() {
            if sender.send((merge, Arc::clone(&source))).is_err() {
                // workers already shut down; nothing can run this merge
                merge_dropped(&source);
                break;
            }
        }
        Ok(())
    }

    /// Stops the workers after they drain the queue and joins them. A
    /// later `merge` call spins the pool up again.
    fn close(&self) -> SearchResult<()> {
        let pool = self.pool.lock().unwrap().take();
        if let Some(pool) = pool {
            drop(pool.sender);
            for handle in pool.handles {
                if handle.join().is_err() {
                    error!("merge worker panicked");
                }
            }
        }
        Ok(())
    }
}

fn merge_dropped(source: &Arc<dyn MergeSource>) {
    // drain whatever is still registered so the writer does not wait on
    // merges nobody will run
    while let Some(merge) = source.next_merge() {
        merge.abort();
        let _ = source.run_merge(merge);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::merge_policy::OneMerge;
    use crate::index::segment_infos::SegmentInfo;
    use std::collections::VecDeque;
    use std::time::Duration;

    struct CountingSource {
        pending: Mutex<VecDeque<Arc<OneMerge>>>,
        ran: Mutex<Vec<Vec<String>>>,
        peak: Mutex<usize>,
        running: Mutex<usize>,
    }

    impl CountingSource {
        fn with_merges(count: usize) -> Arc<Self> {
            let pending = (0..count)
                .map(|i| {
                    Arc::new(OneMerge::new(vec![SegmentInfo::new(
                        &format!("_{i:x}"),
                        1,
                        false,
                    )]))
                })
                .collect();
            Arc::new(Self {
                pending: Mutex::new(pending),
                ran: Mutex::new(Vec::new()),
                peak: Mutex::new(0),
                running: Mutex::new(0),
            })
        }
    }

    impl MergeSource for CountingSource {
        fn next_merge(&self) -> Option<Arc<OneMerge>> {
            self.pending.lock().unwrap().pop_front()
        }

        fn run_merge(&self, merge: Arc<OneMerge>) -> SearchResult<()> {
            {
                let mut running = self.running.lock().unwrap();
                *running += 1;
                let mut peak = self.peak.lock().unwrap();
                *peak = (*peak).max(*running);
            }
            thread::sleep(Duration::from_millis(20));
            self.ran.lock().unwrap().push(merge.segment_names());
            *self.running.lock().unwrap() -= 1;
            merge.set_done(Ok(merge.segments[0].name.clone()));
            Ok(())
        }
    }

    #[test]
    fn serial_runs_everything_inline() {
        let source = CountingSource::with_merges(3);
        SerialMergeScheduler
            .merge(Arc::clone(&source) as Arc<dyn MergeSource>)
            .unwrap();
        assert_eq!(source.ran.lock().unwrap().len(), 3);
    }

    #[test]
    fn concurrent_bounds_parallelism_and_drains() {
        let scheduler = ConcurrentMergeScheduler::new(2);
        let source = CountingSource::with_merges(6);
        scheduler
            .merge(Arc::clone(&source) as Arc<dyn MergeSource>)
            .unwrap();
        scheduler.close().unwrap();
        assert_eq!(source.ran.lock().unwrap().len(), 6);
        assert!(*source.peak.lock().unwrap() <= 2);
    }

    #[test]
    fn watch_resolves_when_merge_completes() {
        let scheduler = ConcurrentMergeScheduler::new(1);
        let source = CountingSource::with_merges(1);
        let merge = source.pending.lock().unwrap().front().unwrap().clone();
        let rx = merge.watch();
        scheduler
            .merge(Arc::clone(&source) as Arc<dyn MergeSource>)
            .unwrap();
        assert_eq!(rx.recv().unwrap().unwrap(), "_0");
        scheduler.close().unwrap();
    }

    #[test]
    fn close_then_merge_restarts_the_pool() {
        let scheduler = ConcurrentMergeScheduler::new(1);
        let source = CountingSource::with_merges(1);
        scheduler
            .merge(Arc::clone(&source) as Arc<dyn MergeSource>)
            .unwrap();
        scheduler.close().unwrap();

        let source = CountingSource::with_merges(2);
        scheduler
            .merge(Arc::clone(&source) as Arc<dyn MergeSource>)
            .unwrap();
        scheduler.close().unwrap();
        assert_eq!(source.ran.lock().unwrap().len(), 2);
    }
}
