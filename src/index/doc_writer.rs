use std::collections::BinaryHeap;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use hashbrown::hash_map::RawEntryMut;
use hashbrown::HashMap;
use log::{debug, info};

use crate::analysis::Analyzer;
use crate::codec::field_infos::FieldInfos;
use crate::codec::norms::write_norms;
use crate::codec::postings::PostingsWriter;
use crate::codec::stored::StoredFieldsWriter;
use crate::codec::terms::TermInfosWriter;
use crate::codec::vectors::{TermVectorEntry, TermVectorsWriter};
use crate::codec::{self, segment_file_name};
use crate::directory::Directory;
use crate::document::{Document, Field};
use crate::error::SearchResult;
use crate::search::similarity::Similarity;
use crate::util::{BytePool, DocId, PoolSlice};

/// Key of the per-slot posting hash: field number plus term bytes held in
/// the slot's byte pool. The hash is computed over the bytes themselves
/// and memoized, so rehashing never touches the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct TermKey {
    hash: u64,
    field: u32,
    slice: PoolSlice,
}

impl Hash for TermKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

fn term_hash(builder: &impl BuildHasher, field: u32, bytes: &[u8]) -> u64 {
    let mut hasher = builder.build_hasher();
    hasher.write_u32(field);
    hasher.write(bytes);
    hasher.finish()
}

/// Buffered postings of one term in one slot, in a field-agnostic staging
/// encoding: doc entries as `delta<<1|1` / `delta<<1`+freq, positions as
/// deltas each followed by a payload length. The flush translates this
/// into the field's final on-disk form.
#[derive(Default)]
struct Posting {
    last_doc: DocId,
    doc_freq: u32,
    docs: Vec<u8>,
    prox: Vec<u8>,
}

fn push_vint(buf: &mut Vec<u8>, mut v: u32) {
    while v & !0x7f != 0 {
        buf.push((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

fn read_vint(buf: &[u8], pos: &mut usize) -> u32 {
    let mut b = buf[*pos];
    *pos += 1;
    let mut value = (b & 0x7f) as u32;
    let mut shift = 7;
    while b & 0x80 != 0 {
        b = buf[*pos];
        *pos += 1;
        value |= ((b & 0x7f) as u32) << shift;
        shift += 7;
    }
    value
}

/// Per-document stored/vector/norm state staged until flush.
struct BufferedDoc {
    doc_id: DocId,
    stored: Vec<(u32, Field)>,
    vectors: Vec<(u32, bool, bool, Vec<TermVectorEntry>)>,
    norms: Vec<(u32, u8)>,
}

/// One slot of the thread-state pool: private byte pool, posting hash and
/// document buffer. Slots are handed out whole, so no per-posting locking
/// exists anywhere on the add path.
struct ThreadState {
    pool: BytePool,
    postings: HashMap<TermKey, Posting>,
    docs: Vec<BufferedDoc>,
    bytes_used: usize,
}

impl ThreadState {
    fn new() -> Self {
        Self {
            pool: BytePool::new(),
            postings: HashMap::new(),
            docs: Vec::new(),
            bytes_used: 0,
        }
    }

    fn reset(&mut self) {
        self.pool.reset();
        self.postings.clear();
        self.docs.clear();
        self.bytes_used = 0;
    }
}

/// Result of inverting one document locally, before it is folded into a
/// slot. A tokenizer failure discards this and nothing else.
struct InvertedDoc {
    /// (field, term text) -> (freq, staged prox bytes)
    terms: HashMap<(u32, String), LocalPosting>,
    buffered: BufferedDoc,
}

#[derive(Default)]
struct LocalPosting {
    freq: u32,
    prox: Vec<u8>,
    last_position: u32,
}

struct PoolState {
    idle: Vec<ThreadState>,
    allocated: usize,
    leased: usize,
    flushing: bool,
}

/// The in-RAM indexing pipeline: concurrent `add_document` calls invert
/// into pooled thread states; `flush` quiesces the pool, k-way merges the
/// per-slot term hashes and writes a new segment through the codec.
pub struct DocWriter {
    analyzer: Arc<dyn Analyzer>,
    similarity: Arc<dyn Similarity>,
    max_thread_states: usize,
    pool: Mutex<PoolState>,
    pool_cond: Condvar,
    field_infos: Mutex<FieldInfos>,
    doc_count: AtomicU32,
    ram_used: AtomicUsize,
}

impl DocWriter {
    pub fn new(
        analyzer: Arc<dyn Analyzer>,
        similarity: Arc<dyn Similarity>,
        max_thread_states: usize,
    ) -> Self {
        Self {
            analyzer,
            similarity,
            max_thread_states: max_thread_states.max(1),
            pool: Mutex::new(PoolState {
                idle: Vec::new(),
                allocated: 0,
                leased: 0,
                flushing: false,
            }),
            pool_cond: Condvar::new(),
            field_infos: Mutex::new(FieldInfos::new()),
            doc_count: AtomicU32::new(0),
            ram_used: AtomicUsize::new(0),
        }
    }

    pub fn num_buffered_docs(&self) -> u32 {
        self.doc_count.load(Ordering::Acquire)
    }

    pub fn ram_used(&self) -> usize {
        self.ram_used.load(Ordering::Acquire)
    }

    fn acquire_state(&self) -> ThreadState {
        let mut pool = self.pool.lock().unwrap();
        loop {
            if !pool.flushing {
                if let Some(state) = pool.idle.pop() {
                    pool.leased += 1;
                    return state;
                }
                if pool.allocated < self.max_thread_states {
                    pool.allocated += 1;
                    pool.leased += 1;
                    return ThreadState::new();
                }
            }
            pool = self.pool_cond.wait(pool).unwrap();
        }
    }

    fn release_state(&self, state: ThreadState) {
        let mut pool = self.pool.lock().unwrap();
        pool.idle.push(state);
        pool.leased -= 1;
        self.pool_cond.notify_all();
    }

    /// Buffers one document and returns its id within the pending segment.
    pub fn add_document(&self, doc: &Document) -> SearchResult<DocId> {
        let inverted = self.invert(doc)?;
        let mut state = self.acquire_state();
        let doc_id = self.doc_count.fetch_add(1, Ordering::AcqRel) as DocId;
        let before = state.bytes_used;
        self.fold(&mut state, inverted, doc_id);
        let grown = state.bytes_used - before;
        self.ram_used.fetch_add(grown, Ordering::AcqRel);
        self.release_state(state);
        Ok(doc_id)
    }

    /// Field-by-field inversion into a local posting map. Nothing shared
    /// is touched until this succeeds, so a failing document leaves the
    /// buffered state exactly as it was.
    fn invert(&self, doc: &Document) -> SearchResult<InvertedDoc> {
        let mut terms: HashMap<(u32, String), LocalPosting> = HashMap::new();
        let mut buffered = BufferedDoc {
            doc_id: 0,
            stored: Vec::new(),
            vectors: Vec::new(),
            norms: Vec::new(),
        };
        // field state persists across same-named instances in this doc
        struct FieldState {
            position: i64,
            offset: u32,
            length: u32,
            boost: f32,
            vector: Option<HashMap<String, TermVectorEntry>>,
        }
        let mut field_states: HashMap<u32, FieldState> = HashMap::new();
        let mut field_order: Vec<u32> = Vec::new();

        for field in &doc.fields {
            let number = {
                let mut infos = self.field_infos.lock().unwrap();
                infos.add(&field.name, &field.options)
            };
            if field.options.stored {
                buffered.stored.push((number, field.clone()));
            }
            if !field.options.indexed {
                continue;
            }
            let text = match field.value.index_text() {
                Some(text) => text,
                None => continue,
            };
            let state = field_states.entry(number).or_insert_with(|| {
                field_order.push(number);
                FieldState {
                    position: -1,
                    offset: 0,
                    length: 0,
                    boost: doc.boost,
                    vector: field
                        .options
                        .store_term_vector
                        .then(HashMap::new),
                }
            });
            state.boost *= field.boost;
            if state.length > 0 {
                state.position += self.analyzer.position_increment_gap(&field.name) as i64;
            }

            let mut saw_payload = false;
            if field.options.tokenized {
                let mut stream = self.analyzer.token_stream(&field.name, &text);
                while stream.increment_token() {
                    let token = stream.token();
                    // increment 0 stacks the token on the previous position
                    state.position += token.position_increment as i64;
                    let position = state.position.max(0) as u32;
                    let start = state.offset + token.start_offset;
                    let end = state.offset + token.end_offset;
                    saw_payload |= token.payload.is_some();
                    add_term_occurrence(
                        &mut terms,
                        number,
                        &token.text,
                        position,
                        token.payload.as_deref(),
                    );
                    if let Some(vector) = &mut state.vector {
                        add_vector_occurrence(vector, &token.text, position, (start, end));
                    }
                    state.length += 1;
                }
            } else {
                state.position += 1;
                let position = state.position as u32;
                add_term_occurrence(&mut terms, number, &text, position, None);
                if let Some(vector) = &mut state.vector {
                    add_vector_occurrence(vector, &text, position, (0, text.len() as u32));
                }
                state.length += 1;
            }
            state.offset += text.len() as u32;
            if saw_payload {
                self.field_infos.lock().unwrap().set_store_payloads(number);
            }
        }

        // norms and vectors are per field, in first-seen order
        let infos = self.field_infos.lock().unwrap();
        for number in field_order {
            let state = field_states.remove(&number).unwrap();
            let info = infos.by_number(number).unwrap();
            if info.has_norms() {
                let norm = self.similarity.length_norm(&info.name, state.length) * state.boost;
                buffered
                    .norms
                    .push((number, crate::search::similarity::encode_norm(norm)));
            }
            if let Some(vector) = state.vector {
                let mut entries: Vec<TermVectorEntry> = vector.into_values().collect();
                entries.sort_by(|a, b| a.term.cmp(&b.term));
                buffered.vectors.push((
                    number,
                    info.vector_positions,
                    info.vector_offsets,
                    entries,
                ));
            }
        }
        buffered.vectors.sort_by_key(|(number, ..)| *number);
        Ok(InvertedDoc { terms, buffered })
    }

    /// Folds a successfully inverted document into a slot's posting hash.
    fn fold(&self, state: &mut ThreadState, inverted: InvertedDoc, doc_id: DocId) {
        let ThreadState {
            pool,
            postings,
            docs,
            bytes_used,
        } = state;
        for ((field, term), local) in inverted.terms {
            let bytes = term.as_bytes();
            let hash = term_hash(postings.hasher(), field, bytes);
            let entry = postings
                .raw_entry_mut()
                .from_hash(hash, |key| {
                    key.hash == hash && key.field == field && pool.get(key.slice) == bytes
                });
            let posting = match entry {
                RawEntryMut::Occupied(occupied) => occupied.into_mut(),
                RawEntryMut::Vacant(vacant) => {
                    let slice = pool.append(bytes);
                    *bytes_used += bytes.len() + std::mem::size_of::<Posting>();
                    let (_, posting) = vacant.insert_hashed_nocheck(
                        hash,
                        TermKey { hash, field, slice },
                        Posting::default(),
                    );
                    posting
                }
            };
            let delta = (doc_id - posting.last_doc) as u32;
            let before = posting.docs.len() + posting.prox.len();
            if local.freq == 1 {
                push_vint(&mut posting.docs, delta << 1 | 1);
            } else {
                push_vint(&mut posting.docs, delta << 1);
                push_vint(&mut posting.docs, local.freq);
            }
            posting.prox.extend_from_slice(&local.prox);
            posting.last_doc = doc_id;
            posting.doc_freq += 1;
            *bytes_used += posting.docs.len() + posting.prox.len() - before;
        }
        let mut buffered = inverted.buffered;
        buffered.doc_id = doc_id;
        *bytes_used += buffered
            .stored
            .iter()
            .map(|(_, f)| f.name.len() + 16)
            .sum::<usize>()
            + 64;
        docs.push(buffered);
    }

    /// Quiesces the pool and runs `body` over every slot. Slot state is
    /// reset only when `body` succeeds, so a failed flush can retry.
    fn with_quiesced_pool<T>(
        &self,
        body: impl FnOnce(&mut [ThreadState]) -> SearchResult<T>,
    ) -> SearchResult<T> {
        let mut states = {
            let mut pool = self.pool.lock().unwrap();
            while pool.flushing {
                pool = self.pool_cond.wait(pool).unwrap();
            }
            pool.flushing = true;
            while pool.leased > 0 {
                pool = self.pool_cond.wait(pool).unwrap();
            }
            std::mem::take(&mut pool.idle)
        };
        let result = body(&mut states);
        if result.is_ok() {
            for state in &mut states {
                state.reset();
            }
            self.doc_count.store(0, Ordering::Release);
            self.ram_used.store(0, Ordering::Release);
        }
        let mut pool = self.pool.lock().unwrap();
        pool.idle = states;
        pool.flushing = false;
        self.pool_cond.notify_all();
        drop(pool);
        result
    }

    /// Discards every buffered document.
    pub fn abort(&self) {
        let _ = self.with_quiesced_pool(|_| Ok(()));
    }

    /// Writes the buffered documents as segment `name`. Returns `None`
    /// without touching the directory when nothing is buffered. The doc
    /// count is read only after the pool has quiesced, so late adds either
    /// make this flush or wait for the next one.
    pub fn flush(
        &self,
        dir: &dyn Directory,
        name: &str,
        term_index_interval: u32,
    ) -> SearchResult<Option<FlushedSegment>> {
        self.with_quiesced_pool(|states| {
            let doc_count = self.doc_count.load(Ordering::Acquire);
            if doc_count == 0 {
                return Ok(None);
            }
            info!("flushing {doc_count} buffered docs as segment {name}");
            let field_infos = Arc::new(self.field_infos.lock().unwrap().clone());
            write_segment(dir, name, term_index_interval, doc_count, states, &field_infos)
                .map(Some)
        })
    }
}

fn add_term_occurrence(
    terms: &mut HashMap<(u32, String), LocalPosting>,
    field: u32,
    text: &str,
    position: u32,
    payload: Option<&[u8]>,
) {
    let key = (field, text.to_string());
    let posting = terms.entry(key).or_default();
    push_vint(&mut posting.prox, position - posting.last_position);
    posting.last_position = position;
    let payload = payload.unwrap_or(&[]);
    push_vint(&mut posting.prox, payload.len() as u32);
    posting.prox.extend_from_slice(payload);
    posting.freq += 1;
}

fn add_vector_occurrence(
    vector: &mut HashMap<String, TermVectorEntry>,
    text: &str,
    position: u32,
    offset: (u32, u32),
) {
    let entry = vector.entry(text.to_string()).or_insert_with(|| TermVectorEntry {
        term: text.to_string(),
        freq: 0,
        positions: Vec::new(),
        offsets: Vec::new(),
    });
    entry.freq += 1;
    entry.positions.push(position);
    entry.offsets.push(offset);
}

/// What a flush produces: the descriptor plus the final field table, which
/// the writer needs for delete-by-term application.
pub struct FlushedSegment {
    pub info: crate::index::segment_infos::SegmentInfo,
    pub field_infos: Arc<FieldInfos>,
}

/// A slot's term list sorted for the k-way merge.
struct SlotCursor<'a> {
    entries: Vec<(&'a TermKey, &'a Posting)>,
    pos: usize,
    slot: usize,
    field_infos: &'a FieldInfos,
    pool: &'a BytePool,
}

impl<'a> SlotCursor<'a> {
    fn current(&self) -> Option<(&'a TermKey, &'a Posting)> {
        self.entries.get(self.pos).copied()
    }
}

struct HeapEntry<'a> {
    field_name: &'a str,
    bytes: &'a [u8],
    slot: usize,
}

impl PartialEq for HeapEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.field_name == other.field_name && self.bytes == other.bytes && self.slot == other.slot
    }
}
impl Eq for HeapEntry<'_> {}
impl PartialOrd for HeapEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry<'_> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; reverse for ascending term order
        (other.field_name, other.bytes, other.slot).cmp(&(self.field_name, self.bytes, self.slot))
    }
}

fn write_segment(
    dir: &dyn Directory,
    name: &str,
    term_index_interval: u32,
    doc_count: u32,
    states: &[ThreadState],
    field_infos: &Arc<FieldInfos>,
) -> SearchResult<FlushedSegment> {
    field_infos.write(dir, &segment_file_name(name, codec::FIELD_INFOS_EXT))?;

    // term dictionary and postings, k-way merged across slots
    {
        let tis = dir.create_output(&segment_file_name(name, codec::TERM_DICT_EXT))?;
        let tii = dir.create_output(&segment_file_name(name, codec::TERM_INDEX_EXT))?;
        let mut dict = TermInfosWriter::new(tis, tii, Arc::clone(field_infos), term_index_interval)?;
        let freq = dir.create_output(&segment_file_name(name, codec::FREQ_EXT))?;
        let prox = dir.create_output(&segment_file_name(name, codec::PROX_EXT))?;
        let mut postings_writer = PostingsWriter::new(freq, prox);

        let mut cursors: Vec<SlotCursor> = states
            .iter()
            .enumerate()
            .map(|(slot, state)| {
                let mut entries: Vec<(&TermKey, &Posting)> = state.postings.iter().collect();
                entries.sort_by(|(a, _), (b, _)| {
                    let a_name = field_infos.name_of(a.field).unwrap_or("");
                    let b_name = field_infos.name_of(b.field).unwrap_or("");
                    a_name
                        .cmp(b_name)
                        .then_with(|| state.pool.get(a.slice).cmp(state.pool.get(b.slice)))
                });
                SlotCursor {
                    entries,
                    pos: 0,
                    slot,
                    field_infos: field_infos.as_ref(),
                    pool: &state.pool,
                }
            })
            .collect();

        let mut heap = BinaryHeap::new();
        for cursor in &cursors {
            if let Some((key, _)) = cursor.current() {
                heap.push(HeapEntry {
                    field_name: cursor.field_infos.name_of(key.field).unwrap_or(""),
                    bytes: cursor.pool.get(key.slice),
                    slot: cursor.slot,
                });
            }
        }

        let mut current_field: Option<u32> = None;
        while let Some(top) = heap.pop() {
            let field_name = top.field_name;
            let bytes = top.bytes;
            // gather every slot sitting on this exact term
            let mut participants = vec![top.slot];
            while let Some(next) = heap.peek() {
                if next.field_name == field_name && next.bytes == bytes {
                    participants.push(heap.pop().unwrap().slot);
                } else {
                    break;
                }
            }
            let field_number = field_infos.number_of(field_name).unwrap();
            let info = field_infos.by_number(field_number).unwrap();
            if current_field != Some(field_number) {
                postings_writer.start_field(info.omit_term_freq_and_positions, info.store_payloads);
                current_field = Some(field_number);
            }
            postings_writer.start_term();

            // decode each participating slot's staged buffer; doc ranges
            // interleave across slots, so merge by doc id
            let mut entries: Vec<(DocId, u32, Vec<(u32, Vec<u8>)>)> = Vec::new();
            for &slot in &participants {
                let (_, posting) = cursors[slot].current().unwrap();
                decode_staged(posting, &mut entries);
            }
            entries.sort_by_key(|(doc, _, _)| *doc);
            for (doc, freq, positions) in &entries {
                postings_writer.add_doc(*doc, *freq)?;
                for (position, payload) in positions {
                    let payload = (!payload.is_empty()).then_some(payload.as_slice());
                    postings_writer.add_position(*position, payload)?;
                }
            }
            let term_info = postings_writer.finish_term()?;
            dict.add(field_number, bytes, &term_info)?;

            // advance participants and refill the heap
            for slot in participants {
                cursors[slot].pos += 1;
                if let Some((key, _)) = cursors[slot].current() {
                    heap.push(HeapEntry {
                        field_name: cursors[slot].field_infos.name_of(key.field).unwrap_or(""),
                        bytes: cursors[slot].pool.get(key.slice),
                        slot,
                    });
                }
            }
        }
        postings_writer.close()?;
        dict.close()?;
    }

    // stored fields, vectors and norms walk the buffered docs in id order
    let mut all_docs: Vec<&BufferedDoc> = states.iter().flat_map(|s| s.docs.iter()).collect();
    all_docs.sort_by_key(|d| d.doc_id);
    debug_assert_eq!(all_docs.len() as u32, doc_count);

    {
        let fdx = dir.create_output(&segment_file_name(name, codec::STORED_INDEX_EXT))?;
        let fdt = dir.create_output(&segment_file_name(name, codec::STORED_DATA_EXT))?;
        let mut stored = StoredFieldsWriter::new(fdx, fdt);
        for doc in &all_docs {
            let fields: Vec<(u32, &Field)> =
                doc.stored.iter().map(|(n, f)| (*n, f)).collect();
            stored.add_document(&fields)?;
        }
        stored.close()?;
    }

    let has_vectors = field_infos.has_vectors();
    if has_vectors {
        let tvx = dir.create_output(&segment_file_name(name, codec::VECTORS_INDEX_EXT))?;
        let tvd = dir.create_output(&segment_file_name(name, codec::VECTORS_DOCS_EXT))?;
        let tvf = dir.create_output(&segment_file_name(name, codec::VECTORS_FIELDS_EXT))?;
        let mut vectors = TermVectorsWriter::new(tvx, tvd, tvf);
        for doc in &all_docs {
            vectors.add_document(&doc.vectors)?;
        }
        vectors.close()?;
    }

    let has_norms = field_infos.has_norms();
    if has_norms {
        let neutral = crate::search::similarity::encode_norm(1.0);
        let mut arrays: HashMap<u32, Vec<u8>> = HashMap::new();
        for info in field_infos.iter() {
            if info.has_norms() {
                arrays.insert(info.number, vec![neutral; doc_count as usize]);
            }
        }
        for doc in &all_docs {
            for (field, norm) in &doc.norms {
                if let Some(bytes) = arrays.get_mut(field) {
                    bytes[doc.doc_id as usize] = *norm;
                }
            }
        }
        write_norms(
            dir,
            &segment_file_name(name, codec::NORMS_EXT),
            field_infos,
            &arrays,
            doc_count,
        )?;
    }

    let mut info = crate::index::segment_infos::SegmentInfo::new(name, doc_count, false);
    info.has_norms = has_norms;
    info.has_vectors = has_vectors;
    info.diagnostics
        .push(("source".to_string(), "flush".to_string()));
    debug!("segment {name} flushed with {doc_count} docs");
    Ok(FlushedSegment {
        info,
        field_infos: Arc::clone(field_infos),
    })
}

/// Expands one slot's staged posting into (doc, freq, [(position, payload)]).
fn decode_staged(posting: &Posting, out: &mut Vec<(DocId, u32, Vec<(u32, Vec<u8>)>)>) {
    let mut doc_pos = 0usize;
    let mut prox_pos = 0usize;
    let mut doc: DocId = 0;
    for _ in 0..posting.doc_freq {
        let code = read_vint(&posting.docs, &mut doc_pos);
        doc += (code >> 1) as DocId;
        let freq = if code & 1 != 0 {
            1
        } else {
            read_vint(&posting.docs, &mut doc_pos)
        };
        let mut positions = Vec::with_capacity(freq as usize);
        let mut position = 0u32;
        for _ in 0..freq {
            position += read_vint(&posting.prox, &mut prox_pos);
            let payload_len = read_vint(&posting.prox, &mut prox_pos) as usize;
            let payload = posting.prox[prox_pos..prox_pos + payload_len].to_vec();
            prox_pos += payload_len;
            positions.push((position, payload));
        }
        out.push((doc, freq, positions));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::WhitespaceAnalyzer;
    use crate::directory::RamDirectory;
    use crate::document::Term;
    use crate::index::reader::SegmentReader;
    use crate::search::similarity::DefaultSimilarity;
    use std::sync::Arc;

    fn doc_writer() -> DocWriter {
        DocWriter::new(
            Arc::new(WhitespaceAnalyzer),
            Arc::new(DefaultSimilarity::default()),
            4,
        )
    }

    fn flush_and_open(writer: &DocWriter, dir: &Arc<RamDirectory>) -> SegmentReader {
        let flushed = writer
            .flush(dir.as_ref(), "_0", 16)
            .unwrap()
            .expect("segment expected");
        SegmentReader::open(dir.clone() as crate::directory::DirectoryRc, &flushed.info, 1).unwrap()
    }

    #[test]
    fn empty_flush_creates_nothing() {
        let writer = doc_writer();
        let dir = RamDirectory::new();
        assert!(writer.flush(dir.as_ref(), "_0", 16).unwrap().is_none());
        assert!(dir.list_all().unwrap().is_empty());
    }

    #[test]
    fn single_doc_segment_round_trip() {
        let writer = doc_writer();
        let dir = RamDirectory::new();
        let mut doc = Document::new();
        doc.add(Field::text("content", "quick brown quick"));
        writer.add_document(&doc).unwrap();
        assert_eq!(writer.num_buffered_docs(), 1);
        assert!(writer.ram_used() > 0);

        let reader = flush_and_open(&writer, &dir);
        assert_eq!(reader.max_doc(), 1);
        assert_eq!(writer.num_buffered_docs(), 0);

        let mut docs = reader
            .term_docs(&Term::new("content", "quick"))
            .unwrap()
            .unwrap();
        assert!(docs.next().unwrap());
        assert_eq!((docs.doc(), docs.freq()), (0, 2));
        assert!(!docs.next().unwrap());

        let mut positions = reader
            .term_positions(&Term::new("content", "quick"))
            .unwrap()
            .unwrap();
        assert!(positions.next().unwrap());
        assert_eq!(positions.positions(), &[0, 2]);

        let stored = reader.document(0).unwrap();
        assert_eq!(
            stored.get("content").unwrap().value.as_text(),
            Some("quick brown quick")
        );
    }

    #[test]
    fn terms_come_back_sorted_across_fields() {
        let writer = doc_writer();
        let dir = RamDirectory::new();
        for (a, b) in [("zebra yak", "alpha"), ("yak cat", "beta")] {
            let mut doc = Document::new();
            doc.add(Field::text("body", a));
            doc.add(Field::text("author", b));
            writer.add_document(&doc).unwrap();
        }
        let reader = flush_and_open(&writer, &dir);
        let mut cursor = reader.terms();
        let mut seen = Vec::new();
        while cursor.next().unwrap() {
            let term = cursor.term().unwrap();
            seen.push(format!("{}:{}", term.field, term.text));
        }
        assert_eq!(
            seen,
            vec!["author:alpha", "author:beta", "body:cat", "body:yak", "body:zebra"]
        );
        assert_eq!(reader.doc_freq(&Term::new("body", "yak")).unwrap(), 2);
    }

    #[test]
    fn omit_tf_field_has_no_positions_file_entries() {
        let writer = doc_writer();
        let dir = RamDirectory::new();
        let mut doc = Document::new();
        doc.add(Field::int("id", 7));
        writer.add_document(&doc).unwrap();
        let flushed = writer.flush(dir.as_ref(), "_0", 16).unwrap().unwrap();
        assert_eq!(dir.file_length("_0.prx").unwrap(), 0);
        // all fields omit norms: no .nrm file at all
        assert!(!flushed.info.has_norms);
        assert!(!dir.file_exists("_0.nrm"));
    }

    #[test]
    fn vectors_written_when_requested() {
        let writer = doc_writer();
        let dir = RamDirectory::new();
        let mut doc = Document::new();
        doc.add(Field::text("body", "red green red").with_term_vector(true, true));
        writer.add_document(&doc).unwrap();
        let reader = flush_and_open(&writer, &dir);
        let vector = reader.term_vector(0, "body").unwrap().unwrap();
        assert_eq!(vector.terms.len(), 2);
        assert_eq!(vector.terms[1].term, "red");
        assert_eq!(vector.terms[1].positions, vec![0, 2]);
        assert_eq!(vector.terms[1].offsets, vec![(0, 3), (10, 13)]);
    }

    #[test]
    fn concurrent_adds_assign_dense_ids() {
        let writer = Arc::new(doc_writer());
        let dir = RamDirectory::new();
        let mut handles = Vec::new();
        for t in 0..4 {
            let writer = Arc::clone(&writer);
            handles.push(std::thread::spawn(move || {
                for i in 0..25 {
                    let mut doc = Document::new();
                    doc.add(Field::text("body", &format!("word{t} shared t{t}i{i}")));
                    writer.add_document(&doc).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(writer.num_buffered_docs(), 100);
        let reader = flush_and_open(&writer, &dir);
        assert_eq!(reader.max_doc(), 100);
        // every doc has the shared term exactly once
        let mut docs = reader
            .term_docs(&Term::new("body", "shared"))
            .unwrap()
            .unwrap();
        let mut count = 0;
        let mut last = -1;
        while docs.next().unwrap() {
            assert!(docs.doc() > last);
            last = docs.doc();
            count += 1;
        }
        assert_eq!(count, 100);
    }
}
