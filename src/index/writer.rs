use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use hashbrown::{HashMap, HashSet};
use log::{debug, info, warn};

use crate::codec::compound::write_compound_file;
use crate::codec::{self, segment_file_name};
use crate::config::{IndexWriterConfig, OpenMode};
use crate::directory::{DirectoryRc, LockGuard, WRITE_LOCK_NAME};
use crate::document::{Document, Term};
use crate::error::{SearchError, SearchResult};
use crate::index::deleter::IndexFileDeleter;
use crate::index::doc_writer::DocWriter;
use crate::index::merge_policy::OneMerge;
use crate::index::merge_scheduler::MergeSource;
use crate::index::merger::merge_segments;
use crate::index::reader::{IndexReader, SegmentReader};
use crate::index::segment_infos::{SegmentInfo, SegmentInfos};
use crate::search::query::Query;

/// The single mutator of a directory. Holds `write.lock` for its
/// lifetime; buffers documents and deletes in RAM; flushes immutable
/// segments; coordinates the merge policy, scheduler and deletion policy.
pub struct IndexWriter {
    inner: Arc<WriterInner>,
}

pub(crate) struct WriterInner {
    dir: DirectoryRc,
    config: IndexWriterConfig,
    doc_writer: DocWriter,
    state: Mutex<WriterState>,
    merge_cond: Condvar,
    closed: AtomicBool,
}

struct WriterState {
    infos: SegmentInfos,
    rollback_infos: SegmentInfos,
    deleter: IndexFileDeleter,
    write_lock: Option<LockGuard>,
    /// Buffered delete terms with the buffered-doc watermark they arrived
    /// at: within the next flushed segment they only hit docs below it.
    delete_terms: HashMap<Term, u32>,
    delete_queries: Vec<(Query, u32)>,
    pending_merges: VecDeque<Arc<OneMerge>>,
    running_merges: Vec<Arc<OneMerge>>,
    /// Segments currently claimed by a registered merge.
    merging: HashSet<String>,
    /// Pooled leaf readers for near-real-time reopen.
    pool: Vec<Arc<SegmentReader>>,
    /// Anything to publish since the last commit.
    changed: bool,
}

impl IndexWriter {
    pub fn open(dir: DirectoryRc, config: IndexWriterConfig) -> SearchResult<IndexWriter> {
        let write_lock = dir.obtain_lock(WRITE_LOCK_NAME, config.write_lock_timeout_ms)?;

        let existing = SegmentInfos::read_current(dir.as_ref());
        let infos = match (config.open_mode, existing) {
            (OpenMode::Append, Err(err)) => return Err(err),
            (OpenMode::Append, Ok(infos)) => infos,
            (OpenMode::CreateOrAppend, Ok(infos)) => infos,
            (OpenMode::CreateOrAppend, Err(SearchError::FileNotFound(_))) => SegmentInfos::new(),
            (OpenMode::CreateOrAppend, Err(err)) => return Err(err),
            (OpenMode::Create, existing) => {
                // truncate, but keep the generation moving forward so the
                // next commit never collides with an old manifest
                let mut fresh = SegmentInfos::new();
                if let Ok(old) = existing {
                    fresh.generation = old.generation;
                    fresh.version = old.version;
                }
                fresh
            }
        };

        let deleter = IndexFileDeleter::new(
            Arc::clone(&dir),
            Arc::clone(&config.deletion_policy),
            &infos,
        )?;
        info!(
            "writer opened on {:?}: generation {}, {} segments",
            dir,
            infos.generation,
            infos.len()
        );
        let doc_writer = DocWriter::new(
            Arc::clone(&config.analyzer),
            Arc::clone(&config.similarity),
            config.max_thread_states,
        );
        Ok(IndexWriter {
            inner: Arc::new(WriterInner {
                dir,
                doc_writer,
                state: Mutex::new(WriterState {
                    rollback_infos: infos.clone(),
                    infos,
                    deleter,
                    write_lock: Some(write_lock),
                    delete_terms: HashMap::new(),
                    delete_queries: Vec::new(),
                    pending_merges: VecDeque::new(),
                    running_merges: Vec::new(),
                    merging: HashSet::new(),
                    pool: Vec::new(),
                    changed: config.open_mode == OpenMode::Create,
                }),
                merge_cond: Condvar::new(),
                closed: AtomicBool::new(false),
                config,
            }),
        })
    }

    pub fn config(&self) -> &IndexWriterConfig {
        &self.inner.config
    }

    pub fn directory(&self) -> &DirectoryRc {
        &self.inner.dir
    }

    fn check_open(&self) -> SearchResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(SearchError::AlreadyClosed("IndexWriter"))
        } else {
            Ok(())
        }
    }

    /// Buffers one document; returns once the writer owns it. Triggers a
    /// flush when a buffering watermark is crossed.
    pub fn add_document(&self, doc: &Document) -> SearchResult<()> {
        self.check_open()?;
        self.inner.doc_writer.add_document(doc)?;
        self.flush_if_needed()
    }

    /// Buffered delete of every document containing `term`.
    pub fn delete_documents_by_term(&self, term: Term) -> SearchResult<()> {
        self.check_open()?;
        let watermark = self.inner.doc_writer.num_buffered_docs();
        let over_limit = {
            let mut state = self.inner.state.lock().unwrap();
            state.delete_terms.insert(term, watermark);
            match self.inner.config.max_buffered_delete_terms {
                Some(limit) => state.delete_terms.len() as u32 >= limit,
                None => false,
            }
        };
        if over_limit {
            self.flush()?;
        }
        Ok(())
    }

    pub fn delete_documents_by_terms(&self, terms: Vec<Term>) -> SearchResult<()> {
        for term in terms {
            self.delete_documents_by_term(term)?;
        }
        Ok(())
    }

    pub fn delete_documents_by_query(&self, query: Query) -> SearchResult<()> {
        self.check_open()?;
        let watermark = self.inner.doc_writer.num_buffered_docs();
        let mut state = self.inner.state.lock().unwrap();
        state.delete_queries.push((query, watermark));
        Ok(())
    }

    /// Buffered delete-then-add; the pair becomes visible atomically at
    /// the next commit.
    pub fn update_document(&self, term: Term, doc: &Document) -> SearchResult<()> {
        self.check_open()?;
        let watermark = self.inner.doc_writer.num_buffered_docs();
        {
            let mut state = self.inner.state.lock().unwrap();
            state.delete_terms.insert(term, watermark);
        }
        self.inner.doc_writer.add_document(doc)?;
        self.flush_if_needed()
    }

    /// Drops every buffered and committed document at the next commit.
    pub fn delete_all(&self) -> SearchResult<()> {
        self.check_open()?;
        self.inner.doc_writer.abort();
        let mut state = self.inner.state.lock().unwrap();
        state.delete_terms.clear();
        state.delete_queries.clear();
        state.infos.segments.clear();
        state.changed = true;
        let infos = state.infos.clone();
        state.deleter.checkpoint(&infos, false)?;
        Ok(())
    }

    pub fn num_buffered_docs(&self) -> u32 {
        self.inner.doc_writer.num_buffered_docs()
    }

    pub fn max_doc(&self) -> u32 {
        let state = self.inner.state.lock().unwrap();
        state.infos.total_doc_count() + self.inner.doc_writer.num_buffered_docs()
    }

    pub fn num_docs(&self) -> u32 {
        let state = self.inner.state.lock().unwrap();
        let committed: u32 = state.infos.segments.iter().map(|s| s.num_docs()).sum();
        committed + self.inner.doc_writer.num_buffered_docs()
    }

    pub fn has_deletions(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        state.infos.segments.iter().any(|s| s.has_deletions())
            || !state.delete_terms.is_empty()
            || !state.delete_queries.is_empty()
    }

    pub fn segment_count(&self) -> usize {
        self.inner.state.lock().unwrap().infos.len()
    }

    fn flush_if_needed(&self) -> SearchResult<()> {
        let doc_writer = &self.inner.doc_writer;
        let by_docs = self
            .inner
            .config
            .max_buffered_docs
            .map(|limit| doc_writer.num_buffered_docs() >= limit)
            .unwrap_or(false);
        let by_ram = self
            .inner
            .config
            .ram_buffer_bytes()
            .map(|limit| doc_writer.ram_used() >= limit)
            .unwrap_or(false);
        if by_docs || by_ram {
            debug!(
                "flush triggered: docs={} ram={}",
                doc_writer.num_buffered_docs(),
                doc_writer.ram_used()
            );
            self.flush()?;
        }
        Ok(())
    }

    /// Flushes buffered docs and deletes into the index (without
    /// committing a manifest), then kicks the merge policy.
    pub fn flush(&self) -> SearchResult<()> {
        self.check_open()?;
        let flushed = {
            let mut state = self.inner.state.lock().unwrap();
            self.inner.flush_locked(&mut state)?
        };
        if flushed {
            self.maybe_merge()?;
        }
        Ok(())
    }

    /// Asks the merge policy for work and hands registered merges to the
    /// scheduler.
    pub fn maybe_merge(&self) -> SearchResult<()> {
        self.check_open()?;
        let registered = {
            let mut state = self.inner.state.lock().unwrap();
            let spec = self
                .inner
                .config
                .merge_policy
                .find_merges(self.inner.dir.as_ref(), &state.infos)?;
            self.inner.register_merges(&mut state, spec.merges)
        };
        if registered {
            self.inner
                .config
                .merge_scheduler
                .merge(Arc::clone(&self.inner) as Arc<dyn MergeSource>)?;
        }
        Ok(())
    }

    /// Synchronously merges until at most `max_segments` remain.
    pub fn optimize(&self, max_segments: usize) -> SearchResult<()> {
        self.check_open()?;
        let max_segments = max_segments.max(1);
        self.flush()?;
        loop {
            self.wait_for_merges();
            let (registered, watchers) = {
                let mut state = self.inner.state.lock().unwrap();
                let spec = self.inner.config.merge_policy.find_merges_for_optimize(
                    self.inner.dir.as_ref(),
                    &state.infos,
                    max_segments,
                )?;
                if spec.is_empty() {
                    return Ok(());
                }
                let merges: Vec<Arc<OneMerge>> =
                    spec.merges.into_iter().map(Arc::new).collect();
                let watchers: Vec<_> = merges.iter().map(|m| m.watch()).collect();
                (self.inner.register_merges_arc(&mut state, merges), watchers)
            };
            if !registered {
                // every proposed merge was already claimed or stale
                return Ok(());
            }
            self.inner
                .config
                .merge_scheduler
                .merge(Arc::clone(&self.inner) as Arc<dyn MergeSource>)?;
            for watcher in watchers {
                match watcher.recv() {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => return Err(err),
                    // sender dropped: the merge was skipped at registration
                    Err(_) => {}
                }
            }
        }
    }

    fn wait_for_merges(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while !state.running_merges.is_empty() || !state.pending_merges.is_empty() {
            state = self.inner.merge_cond.wait(state).unwrap();
        }
    }

    /// Flushes everything pending and durably publishes a new commit
    /// point. Readers opened after this returns see the new state.
    pub fn commit(&self) -> SearchResult<()> {
        self.commit_with(Vec::new())
    }

    pub fn commit_with(&self, user_data: Vec<(String, String)>) -> SearchResult<()> {
        self.check_open()?;
        let flushed = {
            let mut state = self.inner.state.lock().unwrap();
            self.inner.flush_locked(&mut state)?
        };
        {
            let mut state = self.inner.state.lock().unwrap();
            let state = &mut *state;
            if !state.changed && user_data.is_empty() && state.infos.generation > 0 {
                return Ok(());
            }
            if !user_data.is_empty() {
                state.infos.user_data = user_data;
            }
            // durability: every referenced file is synced before the
            // manifest points at it
            let files = state.infos.files(false);
            self.inner.dir.sync(&files)?;
            state.infos.prepare_commit(self.inner.dir.as_ref())?;
            if let Err(err) = state.infos.finish_commit(self.inner.dir.as_ref()) {
                state.infos.rollback_commit(self.inner.dir.as_ref());
                return Err(err);
            }
            state.deleter.checkpoint(&state.infos, true)?;
            state.rollback_infos = state.infos.clone();
            state.changed = false;
            info!(
                "committed generation {} ({} segments)",
                state.infos.generation,
                state.infos.len()
            );
        }
        if flushed {
            self.maybe_merge()?;
        }
        Ok(())
    }

    /// Discards all uncommitted changes and closes the writer; the
    /// directory returns to the last committed state.
    pub fn rollback(&self) -> SearchResult<()> {
        self.check_open()?;
        self.inner.abort_merges();
        self.inner.doc_writer.abort();
        {
            let mut state = self.inner.state.lock().unwrap();
            let state = &mut *state;
            state.delete_terms.clear();
            state.delete_queries.clear();
            state.infos = state.rollback_infos.clone();
            state.deleter.checkpoint(&state.infos, false)?;
            state.deleter.release_checkpoint();
            state.write_lock = None;
            state.pool.clear();
        }
        self.inner.closed.store(true, Ordering::Release);
        info!("writer rolled back and closed");
        Ok(())
    }

    /// Commits and shuts down. With `wait_for_merges` false, in-progress
    /// merges are aborted instead of awaited.
    pub fn close(&self, wait_for_merges: bool) -> SearchResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.commit()?;
        if wait_for_merges {
            self.wait_for_merges();
        } else {
            self.inner.abort_merges();
        }
        self.inner.config.merge_scheduler.close()?;
        // merges may have spliced new segments since the commit
        self.commit()?;
        {
            let mut state = self.inner.state.lock().unwrap();
            state.deleter.release_checkpoint();
            state.write_lock = None;
            state.pool.clear();
        }
        self.inner.closed.store(true, Ordering::Release);
        info!("writer closed");
        Ok(())
    }

    /// Near-real-time reader: sees buffered-but-uncommitted state. Files
    /// it references are pinned until the reader closes.
    pub fn get_reader(&self) -> SearchResult<IndexReader> {
        self.check_open()?;
        let mut state = self.inner.state.lock().unwrap();
        self.inner.flush_locked(&mut state)?;
        let infos = state.infos.clone();
        let pinned = infos.files(false);
        state.deleter.inc_ref_all(&pinned);
        let reuse = state.pool.clone();
        drop(state);

        let inner = Arc::clone(&self.inner);
        let reader = IndexReader::from_infos(
            Arc::clone(&self.inner.dir),
            infos,
            true,
            self.inner.config.reader_terms_index_divisor,
            reuse,
            Some(Box::new(move || {
                let mut state = inner.state.lock().unwrap();
                state.deleter.dec_ref_all(&pinned);
                state.deleter.retry_deferred();
            })),
        )?;
        if self.inner.config.reader_pooling {
            let mut state = self.inner.state.lock().unwrap();
            state.pool = reader.leaves().to_vec();
        }
        Ok(reader)
    }

    /// Appends every segment of the given directories, copying their
    /// files under fresh local names, then lets the merge policy take
    /// over.
    pub fn add_indexes(&self, dirs: &[DirectoryRc]) -> SearchResult<()> {
        self.check_open()?;
        {
            let mut state = self.inner.state.lock().unwrap();
            for source in dirs {
                let foreign = SegmentInfos::read_current(source.as_ref())?;
                for segment in &foreign.segments {
                    let new_name = state.infos.next_segment_name();
                    let mut copied = segment.clone();
                    copied.name = new_name;
                    for (from, to) in segment.files().iter().zip(copied.files()) {
                        let mut input = source.open_input(from)?;
                        let mut out = self.inner.dir.create_output(&to)?;
                        let mut remaining = input.len() as usize;
                        let mut buf = [0u8; 16 * 1024];
                        while remaining > 0 {
                            let chunk = remaining.min(buf.len());
                            input.read_bytes(&mut buf[..chunk])?;
                            out.write_bytes(&buf[..chunk])?;
                            remaining -= chunk;
                        }
                        out.close()?;
                    }
                    debug!("imported segment {} as {}", segment.name, copied.name);
                    state.infos.segments.push(copied);
                }
            }
            state.changed = true;
            let infos = state.infos.clone();
            state.deleter.checkpoint(&infos, false)?;
        }
        self.maybe_merge()
    }
}

impl WriterInner {
    /// Flush under the state lock: write the pending segment, apply
    /// buffered deletes, and checkpoint the deleter. Returns whether a
    /// new segment appeared.
    fn flush_locked(&self, state: &mut WriterState) -> SearchResult<bool> {
        let has_docs = self.doc_writer.num_buffered_docs() > 0;
        let has_deletes = !state.delete_terms.is_empty() || !state.delete_queries.is_empty();
        if !has_docs && !has_deletes {
            return Ok(false);
        }
        let existing_count = state.infos.len();

        let mut flushed_new = false;
        if has_docs {
            let name = state.infos.next_segment_name();
            let flushed = match self.doc_writer.flush(
                self.dir.as_ref(),
                &name,
                self.config.term_index_interval,
            ) {
                Ok(flushed) => flushed,
                Err(err) => {
                    self.remove_segment_files(&name);
                    return Err(err);
                }
            };
            if let Some(flushed) = flushed {
                let mut info = flushed.info;
                // in-RAM deletes fold into the new segment before it is
                // published
                if has_deletes {
                    if let Err(err) =
                        self.apply_deletes_to_new_segment(state, &mut info)
                    {
                        self.remove_segment_files(&name);
                        return Err(err);
                    }
                }
                if self.config.merge_policy.use_compound_file(&state.infos, &info) {
                    if let Err(err) = self.build_compound(&mut info) {
                        self.remove_segment_files(&name);
                        return Err(err);
                    }
                }
                state.infos.segments.push(info);
                flushed_new = true;
            }
        }

        if has_deletes {
            self.apply_deletes_to_existing(state, existing_count)?;
        }
        state.delete_terms.clear();
        state.delete_queries.clear();
        state.changed = true;
        let infos = state.infos.clone();
        state.deleter.checkpoint(&infos, false)?;
        Ok(flushed_new)
    }

    fn build_compound(&self, info: &mut SegmentInfo) -> SearchResult<()> {
        let members = info.base_files();
        let compound = segment_file_name(&info.name, codec::COMPOUND_EXT);
        write_compound_file(self.dir.as_ref(), &members, &compound)?;
        for member in members {
            if let Err(err) = self.dir.delete_file(&member) {
                warn!("could not remove compound member {member}: {err}");
            }
        }
        info.use_compound = true;
        Ok(())
    }

    /// Deletes buffered against not-yet-flushed docs honor the watermark:
    /// a delete only affects docs that were buffered before it arrived.
    fn apply_deletes_to_new_segment(
        &self,
        state: &WriterState,
        info: &mut SegmentInfo,
    ) -> SearchResult<()> {
        let reader = SegmentReader::open(Arc::clone(&self.dir), info, 1)?;
        for (term, &watermark) in &state.delete_terms {
            if let Some(mut docs) = reader.term_docs(term)? {
                while docs.next()? {
                    if (docs.doc() as u32) < watermark {
                        reader.delete_document(docs.doc())?;
                    }
                }
            }
        }
        for (query, watermark) in &state.delete_queries {
            for doc in crate::search::searcher::docs_matching(query, &reader)? {
                if (doc as u32) < *watermark {
                    reader.delete_document(doc)?;
                }
            }
        }
        if reader.has_pending_changes() {
            *info = reader.commit_pending()?;
        }
        Ok(())
    }

    /// Deletes against already-flushed segments hit every matching doc.
    fn apply_deletes_to_existing(
        &self,
        state: &mut WriterState,
        segment_count: usize,
    ) -> SearchResult<()> {
        for i in 0..segment_count {
            let info = state.infos.segments[i].clone();
            if info.num_docs() == 0 {
                continue;
            }
            let reader = SegmentReader::open(Arc::clone(&self.dir), &info, 1)?;
            for term in state.delete_terms.keys() {
                reader.delete_documents(term)?;
            }
            for (query, _) in &state.delete_queries {
                for doc in crate::search::searcher::docs_matching(query, &reader)? {
                    reader.delete_document(doc)?;
                }
            }
            if reader.has_pending_changes() {
                state.infos.segments[i] = reader.commit_pending()?;
            }
        }
        Ok(())
    }

    fn remove_segment_files(&self, name: &str) {
        for ext in codec::COMPOUND_MEMBER_EXTS {
            let file = segment_file_name(name, ext);
            if self.dir.file_exists(&file) {
                let _ = self.dir.delete_file(&file);
            }
        }
        let compound = segment_file_name(name, codec::COMPOUND_EXT);
        if self.dir.file_exists(&compound) {
            let _ = self.dir.delete_file(&compound);
        }
    }

    /// Registers merges whose segments are live and unclaimed. Returns
    /// whether anything was registered.
    fn register_merges(&self, state: &mut WriterState, merges: Vec<OneMerge>) -> bool {
        self.register_merges_arc(state, merges.into_iter().map(Arc::new).collect())
    }

    fn register_merges_arc(&self, state: &mut WriterState, merges: Vec<Arc<OneMerge>>) -> bool {
        let mut registered = false;
        for merge in merges {
            let names = merge.segment_names();
            let all_live = names
                .iter()
                .all(|name| state.infos.segments.iter().any(|s| &s.name == name));
            let unclaimed = names.iter().all(|name| !state.merging.contains(name));
            if !all_live || !unclaimed {
                continue;
            }
            for name in names {
                state.merging.insert(name);
            }
            state.pending_merges.push_back(merge);
            registered = true;
        }
        registered
    }

    fn unregister(&self, state: &mut WriterState, merge: &OneMerge) {
        for name in merge.segment_names() {
            state.merging.remove(&name);
        }
    }

    fn abort_merges(&self) {
        let mut state = self.state.lock().unwrap();
        for merge in state.pending_merges.drain(..).collect::<Vec<_>>() {
            merge.abort();
            merge.set_done(Err("merge aborted".to_string()));
            self.unregister(&mut state, &merge);
        }
        // running merges notice at their next checkpoint
        for merge in &state.running_merges {
            merge.abort();
        }
        while !state.running_merges.is_empty() {
            state = self.merge_cond.wait(state).unwrap();
        }
    }

    /// Executes one merge end to end: read inputs at their current
    /// deletion generation, write the output segment, splice it into the
    /// manifest at the position of the first input. Returns the new
    /// segment's name, empty when every input doc was deleted.
    fn do_merge(&self, merge: &Arc<OneMerge>, name: &str) -> SearchResult<String> {
        let inputs: Vec<SegmentInfo> = {
            let state = self.state.lock().unwrap();
            merge
                .segment_names()
                .iter()
                .filter_map(|n| {
                    state
                        .infos
                        .segments
                        .iter()
                        .find(|s| &s.name == n)
                        .cloned()
                })
                .collect()
        };
        let mut readers = Vec::with_capacity(inputs.len());
        for input in &inputs {
            readers.push(Arc::new(SegmentReader::open(
                Arc::clone(&self.dir),
                input,
                1,
            )?));
        }
        let result = merge_segments(
            self.dir.as_ref(),
            name,
            &readers,
            self.config.term_index_interval,
            Some(merge),
        )?;
        drop(readers);

        let mut info = result.info;
        let empty_output = info.doc_count == 0;
        if !empty_output {
            let use_compound = {
                let state = self.state.lock().unwrap();
                self.config
                    .merge_policy
                    .use_compound_file(&state.infos, &info)
            };
            if use_compound {
                self.build_compound(&mut info)?;
            }
        } else {
            // all input docs were deleted: the inputs vanish and nothing
            // replaces them
            self.remove_segment_files(name);
        }

        let mut state = self.state.lock().unwrap();
        let names: HashSet<String> = merge.segment_names().into_iter().collect();
        let position = state
            .infos
            .segments
            .iter()
            .position(|s| names.contains(&s.name))
            .unwrap_or(state.infos.segments.len());
        state.infos.segments.retain(|s| !names.contains(&s.name));
        if !empty_output {
            state.infos.segments.insert(position, info);
        }
        state.changed = true;
        let infos = state.infos.clone();
        state.deleter.checkpoint(&infos, false)?;
        Ok(if empty_output {
            String::new()
        } else {
            name.to_string()
        })
    }
}

impl MergeSource for WriterInner {
    fn next_merge(&self) -> Option<Arc<OneMerge>> {
        let mut state = self.state.lock().unwrap();
        let merge = state.pending_merges.pop_front()?;
        state.running_merges.push(Arc::clone(&merge));
        Some(merge)
    }

    fn run_merge(&self, merge: Arc<OneMerge>) -> SearchResult<()> {
        merge.check_aborted().map_err(|err| {
            self.conclude_merge(&merge, Err(err.to_string()));
            err
        })?;
        let name = {
            let mut state = self.state.lock().unwrap();
            state.infos.next_segment_name()
        };
        let result = self.do_merge(&merge, &name);
        match result {
            Ok(merged_name) => {
                self.conclude_merge(&merge, Ok(merged_name));
                Ok(())
            }
            Err(err) => {
                self.remove_segment_files(&name);
                self.conclude_merge(&merge, Err(err.to_string()));
                Err(err)
            }
        }
    }
}

impl WriterInner {
    fn conclude_merge(&self, merge: &Arc<OneMerge>, outcome: Result<String, String>) {
        let mut state = self.state.lock().unwrap();
        self.unregister(&mut state, merge);
        state
            .running_merges
            .retain(|running| !Arc::ptr_eq(running, merge));
        merge.set_done(outcome);
        drop(state);
        self.merge_cond.notify_all();
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        if !self.inner.closed.load(Ordering::Acquire) && Arc::strong_count(&self.inner) == 1 {
            if let Err(err) = self.close(true) {
                warn!("close on drop failed: {err}");
            }
        }
    }
}

impl Clone for IndexWriter {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::WhitespaceAnalyzer;
    use crate::directory::RamDirectory;
    use crate::document::Field;
    use crate::index::deletion_policy::ExpirationTimeDeletionPolicy;
    use crate::index::merge_policy::{LogDocMergePolicy, NoMergePolicy};
    use crate::index::merge_scheduler::SerialMergeScheduler;
    use crate::index::reader::IndexReader;
    use crate::search::searcher::Searcher;
    use crate::search::query::Query;
    use crate::document::Term;
    use std::thread;
    use std::time::Duration;

    fn config() -> IndexWriterConfig {
        IndexWriterConfig::new(Arc::new(WhitespaceAnalyzer))
            .merge_scheduler(Arc::new(SerialMergeScheduler))
    }

    fn body_doc(text: &str) -> Document {
        let mut doc = Document::new();
        doc.add(Field::text("content", text));
        doc
    }

    #[test]
    fn index_then_search_basic() {
        let dir: DirectoryRc = RamDirectory::new();
        let writer = IndexWriter::open(Arc::clone(&dir), config()).unwrap();
        for text in ["a b", "a c", "b c"] {
            writer.add_document(&body_doc(text)).unwrap();
        }
        writer.commit().unwrap();

        let reader = IndexReader::open(Arc::clone(&dir)).unwrap();
        let searcher = Searcher::new(reader);
        let hits = searcher
            .search(&Query::term(Term::new("content", "a")), 10)
            .unwrap();
        assert_eq!(hits.total_hits, 2);
        let mut docs: Vec<_> = hits.score_docs.iter().map(|sd| sd.doc).collect();
        docs.sort_unstable();
        assert_eq!(docs, vec![0, 1]);
        for hit in &hits.score_docs {
            assert!(hit.score > 0.0);
        }
        let empty = searcher
            .search(&Query::term(Term::new("content", "z")), 10)
            .unwrap();
        assert_eq!(empty.total_hits, 0);
        writer.close(true).unwrap();
    }

    #[test]
    fn update_replaces_at_commit() {
        let dir: DirectoryRc = RamDirectory::new();
        let writer = IndexWriter::open(Arc::clone(&dir), config()).unwrap();
        let mut doc = Document::new();
        doc.add(Field::keyword("id", "1"));
        doc.add(Field::text("body", "old"));
        writer.add_document(&doc).unwrap();
        writer.commit().unwrap();

        let mut replacement = Document::new();
        replacement.add(Field::keyword("id", "1"));
        replacement.add(Field::text("body", "new"));
        writer
            .update_document(Term::new("id", "1"), &replacement)
            .unwrap();
        writer.commit().unwrap();

        let reader = IndexReader::open(Arc::clone(&dir)).unwrap();
        assert_eq!(reader.num_docs(), 1);
        let searcher = Searcher::new(reader);
        assert_eq!(
            searcher
                .search(&Query::term(Term::new("body", "old")), 10)
                .unwrap()
                .total_hits,
            0
        );
        assert_eq!(
            searcher
                .search(&Query::term(Term::new("body", "new")), 10)
                .unwrap()
                .total_hits,
            1
        );
        writer.close(true).unwrap();
    }

    #[test]
    fn add_indexes_then_optimize_preserves_order() {
        let sources: Vec<DirectoryRc> = (0..2).map(|_| RamDirectory::new() as DirectoryRc).collect();
        for (which, source) in sources.iter().enumerate() {
            let writer = IndexWriter::open(
                Arc::clone(source),
                config().merge_policy(Arc::new(NoMergePolicy)),
            )
            .unwrap();
            for i in 0..100u32 {
                let id = which as u32 * 100 + i;
                let mut doc = Document::new();
                doc.add(Field::int("id", id as i64));
                writer.add_document(&doc).unwrap();
            }
            writer.close(true).unwrap();
        }

        let dir: DirectoryRc = RamDirectory::new();
        let writer = IndexWriter::open(Arc::clone(&dir), config()).unwrap();
        writer.add_indexes(&sources).unwrap();
        writer.optimize(1).unwrap();
        writer.commit().unwrap();
        assert_eq!(writer.segment_count(), 1);

        let reader = IndexReader::open(Arc::clone(&dir)).unwrap();
        assert_eq!(reader.num_docs(), 200);
        for doc_id in 0..200 {
            let doc = reader.document(doc_id).unwrap();
            assert_eq!(doc.get("id").unwrap().value.as_int(), Some(doc_id as i64));
        }
        writer.close(true).unwrap();
    }

    #[test]
    fn expiration_policy_reclaims_old_commits() {
        let dir: DirectoryRc = RamDirectory::new();
        let writer = IndexWriter::open(
            Arc::clone(&dir),
            config().deletion_policy(Arc::new(ExpirationTimeDeletionPolicy::new(200))),
        )
        .unwrap();
        writer.add_document(&body_doc("first")).unwrap();
        writer.commit().unwrap();
        assert!(dir.file_exists("segments_1"));

        thread::sleep(Duration::from_millis(300));
        writer.add_document(&body_doc("second")).unwrap();
        writer.commit().unwrap();

        assert!(!dir.file_exists("segments_1"));
        assert!(dir.file_exists("segments_2"));
        assert!(matches!(
            SegmentInfos::read_generation(dir.as_ref(), 1),
            Err(SearchError::FileNotFound(_))
        ));
        writer.close(true).unwrap();
    }

    #[test]
    fn manifest_without_gen_pointer_recovers() {
        let dir: DirectoryRc = RamDirectory::new();
        let writer = IndexWriter::open(Arc::clone(&dir), config()).unwrap();
        writer.add_document(&body_doc("durable data")).unwrap();
        writer.close(true).unwrap();

        // crash simulation: the next manifest is renamed into place but
        // the pointer file never gets rewritten
        let mut infos = SegmentInfos::read_current(dir.as_ref()).unwrap();
        let generation = infos.generation;
        infos.prepare_commit(dir.as_ref()).unwrap();
        dir.rename(
            &format!("pending_segments_{:x}", generation + 1),
            &format!("segments_{:x}", generation + 1),
        )
        .unwrap();

        let reader = IndexReader::open(Arc::clone(&dir)).unwrap();
        assert_eq!(reader.segment_infos().generation, generation + 1);
        let searcher = Searcher::new(reader);
        assert_eq!(
            searcher
                .search(&Query::term(Term::new("content", "durable")), 10)
                .unwrap()
                .total_hits,
            1
        );
    }

    #[test]
    fn rollback_restores_last_commit() {
        let dir: DirectoryRc = RamDirectory::new();
        let writer = IndexWriter::open(Arc::clone(&dir), config()).unwrap();
        writer.add_document(&body_doc("kept")).unwrap();
        writer.commit().unwrap();

        writer.add_document(&body_doc("discarded")).unwrap();
        writer.flush().unwrap();
        writer
            .delete_documents_by_term(Term::new("content", "kept"))
            .unwrap();
        writer.rollback().unwrap();

        assert!(matches!(
            writer.add_document(&body_doc("after close")),
            Err(SearchError::AlreadyClosed(_))
        ));
        let reader = IndexReader::open(Arc::clone(&dir)).unwrap();
        assert_eq!(reader.num_docs(), 1);
        let searcher = Searcher::new(reader);
        assert_eq!(
            searcher
                .search(&Query::term(Term::new("content", "kept")), 10)
                .unwrap()
                .total_hits,
            1
        );
        assert_eq!(
            searcher
                .search(&Query::term(Term::new("content", "discarded")), 10)
                .unwrap()
                .total_hits,
            0
        );
    }

    #[test]
    fn near_real_time_reader_sees_buffered_docs() {
        let dir: DirectoryRc = RamDirectory::new();
        let writer = IndexWriter::open(Arc::clone(&dir), config()).unwrap();
        writer.add_document(&body_doc("uncommitted words")).unwrap();

        let reader = writer.get_reader().unwrap();
        assert_eq!(reader.num_docs(), 1);
        let searcher = Searcher::new(reader.clone());
        assert_eq!(
            searcher
                .search(&Query::term(Term::new("content", "uncommitted")), 10)
                .unwrap()
                .total_hits,
            1
        );
        reader.close().unwrap();

        // nothing was committed: a plain reader cannot open yet
        assert!(IndexReader::open(Arc::clone(&dir)).is_err());
        writer.close(true).unwrap();
    }

    #[test]
    fn buffered_docs_flush_into_multiple_segments_and_merge() {
        let dir: DirectoryRc = RamDirectory::new();
        let policy = LogDocMergePolicy {
            merge_factor: 10,
            min_merge_docs: 100,
            no_compound_file: false,
            ..Default::default()
        };
        let writer = IndexWriter::open(
            Arc::clone(&dir),
            config()
                .merge_policy(Arc::new(policy))
                .max_buffered_docs(Some(2))
                .unwrap(),
        )
        .unwrap();
        for i in 0..20 {
            writer.add_document(&body_doc(&format!("term{i} shared"))).unwrap();
        }
        writer.commit().unwrap();
        assert!(writer.segment_count() < 10);
        assert_eq!(writer.num_docs(), 20);

        let reader = IndexReader::open(Arc::clone(&dir)).unwrap();
        assert_eq!(reader.num_docs(), 20);
        assert_eq!(reader.doc_freq(&Term::new("content", "shared")).unwrap(), 20);
        writer.close(true).unwrap();
    }

    #[test]
    fn fully_deleted_segment_pruned_by_merge_not_commit() {
        let dir: DirectoryRc = RamDirectory::new();
        let writer = IndexWriter::open(Arc::clone(&dir), config()).unwrap();
        writer.add_document(&body_doc("doomed")).unwrap();
        writer.commit().unwrap();
        writer
            .delete_documents_by_term(Term::new("content", "doomed"))
            .unwrap();
        writer.commit().unwrap();
        // the empty segment is still listed after the commit
        assert_eq!(writer.segment_count(), 1);
        assert_eq!(writer.num_docs(), 0);

        writer.optimize(1).unwrap();
        assert_eq!(writer.segment_count(), 0);
        writer.close(true).unwrap();
    }

    #[test]
    fn delete_all_empties_index_at_commit() {
        let dir: DirectoryRc = RamDirectory::new();
        let writer = IndexWriter::open(Arc::clone(&dir), config()).unwrap();
        writer.add_document(&body_doc("one")).unwrap();
        writer.commit().unwrap();
        writer.add_document(&body_doc("two")).unwrap();
        writer.delete_all().unwrap();
        writer.commit().unwrap();

        let reader = IndexReader::open(Arc::clone(&dir)).unwrap();
        assert_eq!(reader.num_docs(), 0);
        writer.close(true).unwrap();
    }

    #[test]
    fn second_writer_fails_on_lock() {
        let dir: DirectoryRc = RamDirectory::new();
        let writer = IndexWriter::open(Arc::clone(&dir), config()).unwrap();
        let second = IndexWriter::open(
            Arc::clone(&dir),
            config().write_lock_timeout_ms(50),
        );
        assert!(matches!(second, Err(SearchError::LockObtainFailed(_))));
        writer.close(true).unwrap();
        IndexWriter::open(Arc::clone(&dir), config()).unwrap().close(true).unwrap();
    }

    #[test]
    fn commit_user_data_round_trips() {
        let dir: DirectoryRc = RamDirectory::new();
        let writer = IndexWriter::open(Arc::clone(&dir), config()).unwrap();
        writer.add_document(&body_doc("tagged")).unwrap();
        writer
            .commit_with(vec![("checkpoint".to_string(), "42".to_string())])
            .unwrap();
        writer.close(true).unwrap();

        let reader = IndexReader::open(Arc::clone(&dir)).unwrap();
        assert_eq!(
            reader.segment_infos().user_data,
            vec![("checkpoint".to_string(), "42".to_string())]
        );
    }

    #[test]
    fn reopen_shares_unchanged_segments() {
        let dir: DirectoryRc = RamDirectory::new();
        let writer = IndexWriter::open(
            Arc::clone(&dir),
            config().merge_policy(Arc::new(NoMergePolicy)),
        )
        .unwrap();
        writer.add_document(&body_doc("stable")).unwrap();
        writer.commit().unwrap();

        let reader = IndexReader::open(Arc::clone(&dir)).unwrap();
        let same = reader.reopen().unwrap();
        assert_eq!(same.version(), reader.version());

        writer.add_document(&body_doc("fresh")).unwrap();
        writer.commit().unwrap();
        let reopened = reader.reopen().unwrap();
        assert_eq!(reopened.num_docs(), 2);
        // the unchanged first segment is the same leaf instance
        assert!(Arc::ptr_eq(&reader.leaves()[0], &reopened.leaves()[0]));
        assert_eq!(reader.num_docs(), 1);
        writer.close(true).unwrap();
    }
}
