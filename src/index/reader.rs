use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use hashbrown::HashMap;
use log::debug;

use crate::codec::compound::CompoundFileReader;
use crate::codec::field_infos::FieldInfos;
use crate::codec::norms::{write_norms, NormsReader};
use crate::codec::postings::{SegmentTermDocs, SegmentTermPositions};
use crate::codec::stored::{FieldSelector, LoadAll, StoredField, StoredFieldsReader};
use crate::codec::terms::{TermEnum, TermInfo, TermInfosReader};
use crate::codec::vectors::{TermVector, TermVectorsReader};
use crate::codec::{self, segment_file_name};
use crate::directory::{DirectoryRc, IndexInput, LockGuard, WRITE_LOCK_NAME};
use crate::document::{Document, Term};
use crate::error::{SearchError, SearchResult};
use crate::index::deleter::IndexFileDeleter;
use crate::index::deletion_policy::{DeletionPolicy, KeepOnlyLastCommit};
use crate::index::segment_infos::{SegmentInfo, SegmentInfos};
use crate::util::{BitVector, DocId};

/// The immutable, shareable part of an open segment: every file handle and
/// decoded table that does not change across reader clones.
pub(crate) struct SegmentCore {
    pub dir: DirectoryRc,
    pub files: DirectoryRc,
    pub name: String,
    pub max_doc: u32,
    pub field_infos: Arc<FieldInfos>,
    pub terms: TermInfosReader,
    pub freq: IndexInput,
    pub prox: IndexInput,
    pub stored: StoredFieldsReader,
    pub vectors: Option<TermVectorsReader>,
    pub field_cache: crate::search::field_cache::FieldCache,
}

struct NormsState {
    base: Option<NormsReader>,
    /// Copy-on-write per-field replacements from `set_norm`.
    overrides: HashMap<u32, Arc<Vec<u8>>>,
}

/// Point-in-time view of one segment. Clones share the [`SegmentCore`] but
/// own their deletion bitmap and norm overlays, so a writable clone never
/// disturbs the reader it was cloned from.
pub struct SegmentReader {
    core: Arc<SegmentCore>,
    info: RwLock<SegmentInfo>,
    deleted: RwLock<Option<Arc<BitVector>>>,
    norms: RwLock<NormsState>,
    pending_deletes: AtomicBool,
    pending_norms: AtomicBool,
}

impl SegmentReader {
    pub fn open(
        dir: DirectoryRc,
        info: &SegmentInfo,
        terms_index_divisor: i32,
    ) -> SearchResult<SegmentReader> {
        let files: DirectoryRc = if info.use_compound {
            CompoundFileReader::open(
                dir.as_ref(),
                &segment_file_name(&info.name, codec::COMPOUND_EXT),
            )?
        } else {
            Arc::clone(&dir)
        };

        let mut fnm = files.open_input(&segment_file_name(&info.name, codec::FIELD_INFOS_EXT))?;
        let field_infos = FieldInfos::read(&mut fnm)?;

        let tis = files.open_input(&segment_file_name(&info.name, codec::TERM_DICT_EXT))?;
        let tii = files.open_input(&segment_file_name(&info.name, codec::TERM_INDEX_EXT))?;
        let terms = TermInfosReader::open(tis, tii, Arc::clone(&field_infos), terms_index_divisor)?;

        let freq = files.open_input(&segment_file_name(&info.name, codec::FREQ_EXT))?;
        let prox = files.open_input(&segment_file_name(&info.name, codec::PROX_EXT))?;

        let fdx = files.open_input(&segment_file_name(&info.name, codec::STORED_INDEX_EXT))?;
        let fdt = files.open_input(&segment_file_name(&info.name, codec::STORED_DATA_EXT))?;
        let stored = StoredFieldsReader::open(fdx, fdt, info.doc_count)?;

        let vectors = if field_infos.has_vectors() {
            let tvx = files.open_input(&segment_file_name(&info.name, codec::VECTORS_INDEX_EXT))?;
            let tvd = files.open_input(&segment_file_name(&info.name, codec::VECTORS_DOCS_EXT))?;
            let tvf =
                files.open_input(&segment_file_name(&info.name, codec::VECTORS_FIELDS_EXT))?;
            Some(TermVectorsReader::open(tvx, tvd, tvf, info.doc_count)?)
        } else {
            None
        };

        // norm overlays and deletion bitmaps are generational and live
        // outside the compound bundle
        let norms_base = if let Some(overlay) = info.norms_overlay_name() {
            let input = dir.open_input(&overlay)?;
            Some(NormsReader::open(input, &field_infos, info.doc_count)?)
        } else if field_infos.has_norms() {
            let input = files.open_input(&segment_file_name(&info.name, codec::NORMS_EXT))?;
            Some(NormsReader::open(input, &field_infos, info.doc_count)?)
        } else {
            None
        };

        let deleted = match info.del_file_name() {
            Some(name) => {
                let bits = BitVector::read(dir.as_ref(), &name)?;
                if bits.size() != info.doc_count {
                    return Err(SearchError::corrupt(format!(
                        "deletion bitmap {name} sized {} for {} docs",
                        bits.size(),
                        info.doc_count
                    )));
                }
                Some(Arc::new(bits))
            }
            None => None,
        };

        Ok(SegmentReader {
            core: Arc::new(SegmentCore {
                dir,
                files,
                name: info.name.clone(),
                max_doc: info.doc_count,
                field_infos,
                terms,
                freq,
                prox,
                stored,
                vectors,
                field_cache: crate::search::field_cache::FieldCache::new(),
            }),
            info: RwLock::new(info.clone()),
            deleted: RwLock::new(deleted),
            norms: RwLock::new(NormsState {
                base: norms_base,
                overrides: HashMap::new(),
            }),
            pending_deletes: AtomicBool::new(false),
            pending_norms: AtomicBool::new(false),
        })
    }

    /// A writable copy sharing the core; deletions and norms are
    /// copy-on-write from this point.
    pub fn clone_reader(&self) -> SegmentReader {
        SegmentReader {
            core: Arc::clone(&self.core),
            info: RwLock::new(self.segment_info()),
            deleted: RwLock::new(self.deleted.read().unwrap().clone()),
            norms: RwLock::new(NormsState {
                base: None,
                overrides: self.norms.read().unwrap().overrides.clone(),
            }),
            pending_deletes: AtomicBool::new(false),
            pending_norms: AtomicBool::new(false),
        }
    }

    pub fn segment_name(&self) -> &str {
        &self.core.name
    }

    pub fn segment_info(&self) -> SegmentInfo {
        self.info.read().unwrap().clone()
    }

    pub fn field_infos(&self) -> &Arc<FieldInfos> {
        &self.core.field_infos
    }

    /// Per-segment value cache; lives as long as the segment core.
    pub fn field_cache(&self) -> &crate::search::field_cache::FieldCache {
        &self.core.field_cache
    }

    pub fn max_doc(&self) -> u32 {
        self.core.max_doc
    }

    pub fn num_docs(&self) -> u32 {
        let deleted = self
            .deleted
            .read()
            .unwrap()
            .as_ref()
            .map(|d| d.count())
            .unwrap_or(0);
        self.core.max_doc - deleted
    }

    pub fn has_deletions(&self) -> bool {
        self.deleted.read().unwrap().is_some()
    }

    pub fn is_deleted(&self, doc: DocId) -> bool {
        self.deleted
            .read()
            .unwrap()
            .as_ref()
            .map(|d| d.get(doc))
            .unwrap_or(false)
    }

    fn deletion_snapshot(&self) -> Option<Arc<BitVector>> {
        self.deleted.read().unwrap().clone()
    }

    pub fn doc_freq(&self, term: &Term) -> SearchResult<u32> {
        self.core.terms.doc_freq(term)
    }

    pub fn term_info(&self, term: &Term) -> SearchResult<Option<TermInfo>> {
        self.core.terms.get(term)
    }

    pub fn terms(&self) -> TermEnum {
        self.core.terms.terms()
    }

    pub fn terms_from(&self, term: &Term) -> SearchResult<TermEnum> {
        self.core.terms.terms_from(term)
    }

    fn field_omits_tf(&self, field: &str) -> bool {
        self.core
            .field_infos
            .by_name(field)
            .map(|i| i.omit_term_freq_and_positions)
            .unwrap_or(false)
    }

    pub fn term_docs(&self, term: &Term) -> SearchResult<Option<SegmentTermDocs>> {
        let info = match self.core.terms.get(term)? {
            Some(info) => info,
            None => return Ok(None),
        };
        self.docs_for(info, self.field_omits_tf(&term.field))
            .map(Some)
    }

    pub(crate) fn docs_for(
        &self,
        info: TermInfo,
        omit_tf: bool,
    ) -> SearchResult<SegmentTermDocs> {
        SegmentTermDocs::new(
            self.core.freq.clone(),
            info,
            omit_tf,
            self.core.terms.skip_interval,
            self.deletion_snapshot(),
        )
    }

    pub fn term_positions(&self, term: &Term) -> SearchResult<Option<SegmentTermPositions>> {
        let info = match self.core.terms.get(term)? {
            Some(info) => info,
            None => return Ok(None),
        };
        let field_info = self.core.field_infos.by_name(&term.field);
        self.positions_for(
            info,
            field_info.map(|i| i.omit_term_freq_and_positions).unwrap_or(false),
            field_info.map(|i| i.store_payloads).unwrap_or(false),
        )
        .map(Some)
    }

    pub(crate) fn positions_for(
        &self,
        info: TermInfo,
        omit_tf: bool,
        store_payloads: bool,
    ) -> SearchResult<SegmentTermPositions> {
        SegmentTermPositions::new(
            self.core.freq.clone(),
            self.core.prox.clone(),
            info,
            omit_tf,
            store_payloads,
            self.core.terms.skip_interval,
            self.deletion_snapshot(),
        )
    }

    pub(crate) fn raw_stored_document(&self, doc: DocId) -> SearchResult<Vec<u8>> {
        self.core.stored.raw_document(doc)
    }

    pub fn document(&self, doc: DocId) -> SearchResult<Document> {
        if self.is_deleted(doc) {
            return Err(SearchError::IllegalArgument(format!(
                "doc {doc} is deleted"
            )));
        }
        self.core.stored.load_document(doc, &self.core.field_infos)
    }

    pub fn document_with_selector(
        &self,
        doc: DocId,
        selector: &dyn FieldSelector,
    ) -> SearchResult<Vec<StoredField>> {
        self.core
            .stored
            .document(doc, &self.core.field_infos, selector)
    }

    pub fn term_vector(&self, doc: DocId, field: &str) -> SearchResult<Option<TermVector>> {
        match &self.core.vectors {
            Some(vectors) => vectors.vector(doc, field, &self.core.field_infos),
            None => Ok(None),
        }
    }

    pub fn term_vectors(&self, doc: DocId) -> SearchResult<Vec<TermVector>> {
        match &self.core.vectors {
            Some(vectors) => vectors.document_vectors(doc, &self.core.field_infos),
            None => Ok(Vec::new()),
        }
    }

    /// Norm bytes for a field, `None` when the field omits norms.
    pub fn norms(&self, field: &str) -> SearchResult<Option<Arc<Vec<u8>>>> {
        let number = match self.core.field_infos.number_of(field) {
            Some(number) => number,
            None => return Ok(None),
        };
        let norms = self.norms.read().unwrap();
        if let Some(bytes) = norms.overrides.get(&number) {
            return Ok(Some(Arc::clone(bytes)));
        }
        if let Some(base) = &norms.base {
            return base.norms(number);
        }
        drop(norms);
        // clones drop the base reader handle; fall back to the file the
        // original opened
        let info = self.segment_info();
        let reader = self.open_norms_reader(&info)?;
        match reader {
            Some(reader) => reader.norms(number),
            None => Ok(None),
        }
    }

    fn open_norms_reader(&self, info: &SegmentInfo) -> SearchResult<Option<NormsReader>> {
        if let Some(overlay) = info.norms_overlay_name() {
            let input = self.core.dir.open_input(&overlay)?;
            return Ok(Some(NormsReader::open(
                input,
                &self.core.field_infos,
                info.doc_count,
            )?));
        }
        if self.core.field_infos.has_norms() {
            let input = self
                .core
                .files
                .open_input(&segment_file_name(&self.core.name, codec::NORMS_EXT))?;
            return Ok(Some(NormsReader::open(
                input,
                &self.core.field_infos,
                info.doc_count,
            )?));
        }
        Ok(None)
    }

    /// Marks one document deleted (copy-on-write). Returns false when the
    /// doc was already deleted.
    pub fn delete_document(&self, doc: DocId) -> SearchResult<bool> {
        if doc < 0 || doc as u32 >= self.core.max_doc {
            return Err(SearchError::IllegalArgument(format!(
                "doc {doc} out of bounds (max_doc {})",
                self.core.max_doc
            )));
        }
        let mut deleted = self.deleted.write().unwrap();
        let bits = deleted.get_or_insert_with(|| Arc::new(BitVector::new(self.core.max_doc)));
        if bits.get(doc) {
            return Ok(false);
        }
        Arc::make_mut(bits).set(doc);
        self.pending_deletes.store(true, Ordering::Release);
        Ok(true)
    }

    /// Deletes every document containing `term`; returns how many fell.
    pub fn delete_documents(&self, term: &Term) -> SearchResult<usize> {
        let mut count = 0;
        if let Some(mut docs) = self.term_docs(term)? {
            while docs.next()? {
                if self.delete_document(docs.doc())? {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    pub fn undelete_all(&self) -> SearchResult<()> {
        *self.deleted.write().unwrap() = None;
        self.pending_deletes.store(true, Ordering::Release);
        Ok(())
    }

    /// Replaces one norm byte (copy-on-write on the field's array).
    pub fn set_norm(&self, doc: DocId, field: &str, value: u8) -> SearchResult<()> {
        let number = self.core.field_infos.number_of(field).ok_or_else(|| {
            SearchError::IllegalArgument(format!("unknown field {field}"))
        })?;
        let current = self
            .norms(field)?
            .ok_or_else(|| SearchError::IllegalArgument(format!("field {field} omits norms")))?;
        if doc < 0 || doc as usize >= current.len() {
            return Err(SearchError::IllegalArgument(format!("doc {doc} out of bounds")));
        }
        let mut bytes = (*current).clone();
        bytes[doc as usize] = value;
        self.norms
            .write()
            .unwrap()
            .overrides
            .insert(number, Arc::new(bytes));
        self.pending_norms.store(true, Ordering::Release);
        Ok(())
    }

    pub fn has_pending_changes(&self) -> bool {
        self.pending_deletes.load(Ordering::Acquire) || self.pending_norms.load(Ordering::Acquire)
    }

    /// Persists pending deletion/norm changes as new generation files and
    /// returns the updated descriptor.
    pub fn commit_pending(&self) -> SearchResult<SegmentInfo> {
        let mut info = self.segment_info();
        if self.pending_deletes.swap(false, Ordering::AcqRel) {
            let deleted = self.deleted.read().unwrap().clone();
            match deleted {
                Some(bits) if bits.count() > 0 => {
                    let gen = info.next_del_gen();
                    let name = codec::generation_file_name(&info.name, codec::DELETES_EXT, gen);
                    bits.write(self.core.dir.as_ref(), &name)?;
                    info.del_gen = Some(gen);
                    info.del_count = bits.count();
                }
                _ => {
                    info.del_gen = None;
                    info.del_count = 0;
                }
            }
        }
        if self.pending_norms.swap(false, Ordering::AcqRel) {
            let gen = info.next_norm_gen();
            let name = codec::generation_file_name(&info.name, codec::NORMS_EXT, gen);
            let mut arrays: HashMap<u32, Vec<u8>> = HashMap::new();
            for field_info in self.core.field_infos.iter() {
                if !field_info.has_norms() {
                    continue;
                }
                let bytes = self
                    .norms(&field_info.name)?
                    .map(|a| (*a).clone())
                    .unwrap_or_else(|| {
                        vec![
                            crate::search::similarity::encode_norm(1.0);
                            self.core.max_doc as usize
                        ]
                    });
                arrays.insert(field_info.number, bytes);
            }
            write_norms(
                self.core.dir.as_ref(),
                &name,
                &self.core.field_infos,
                &arrays,
                self.core.max_doc,
            )?;
            info.norm_gen = Some(gen);
        }
        *self.info.write().unwrap() = info.clone();
        Ok(info)
    }
}

/// Composite point-in-time reader over a commit (or a writer's uncommitted
/// state, for near-real-time readers). Leaves are shared across `reopen`
/// generations by reference count.
pub struct IndexReader {
    inner: Arc<ReaderInner>,
}

struct ReaderInner {
    dir: DirectoryRc,
    infos: SegmentInfos,
    leaves: Vec<Arc<SegmentReader>>,
    doc_bases: Vec<DocId>,
    read_only: bool,
    terms_index_divisor: i32,
    ref_count: AtomicU32,
    closed: AtomicBool,
    write_lock: Mutex<Option<LockGuard>>,
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Clone for IndexReader {
    fn clone(&self) -> Self {
        self.inner.ref_count.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl IndexReader {
    /// Opens a read-only reader on the current commit.
    pub fn open(dir: DirectoryRc) -> SearchResult<IndexReader> {
        Self::open_with(dir, true, 1)
    }

    /// Opens a writable reader: deletions and norm updates are allowed and
    /// commit via `flush`/`close`.
    pub fn open_writable(dir: DirectoryRc) -> SearchResult<IndexReader> {
        Self::open_with(dir, false, 1)
    }

    pub fn open_with(
        dir: DirectoryRc,
        read_only: bool,
        terms_index_divisor: i32,
    ) -> SearchResult<IndexReader> {
        let infos = SegmentInfos::read_current(dir.as_ref())?;
        Self::from_infos(dir, infos, read_only, terms_index_divisor, Vec::new(), None)
    }

    pub(crate) fn from_infos(
        dir: DirectoryRc,
        infos: SegmentInfos,
        read_only: bool,
        terms_index_divisor: i32,
        reuse: Vec<Arc<SegmentReader>>,
        on_close: Option<Box<dyn FnOnce() + Send>>,
    ) -> SearchResult<IndexReader> {
        let mut leaves = Vec::with_capacity(infos.len());
        let mut doc_bases = Vec::with_capacity(infos.len());
        let mut base = 0;
        for info in &infos.segments {
            let leaf = reuse
                .iter()
                .find(|leaf| {
                    let current = leaf.segment_info();
                    current.name == info.name
                        && current.del_gen == info.del_gen
                        && current.norm_gen == info.norm_gen
                })
                .map(Arc::clone);
            let leaf = match leaf {
                Some(leaf) => leaf,
                None => Arc::new(SegmentReader::open(
                    Arc::clone(&dir),
                    info,
                    terms_index_divisor,
                )?),
            };
            doc_bases.push(base);
            base += leaf.max_doc() as DocId;
            leaves.push(leaf);
        }
        Ok(IndexReader {
            inner: Arc::new(ReaderInner {
                dir,
                infos,
                leaves,
                doc_bases,
                read_only,
                terms_index_divisor,
                ref_count: AtomicU32::new(1),
                closed: AtomicBool::new(false),
                write_lock: Mutex::new(None),
                on_close: Mutex::new(on_close),
            }),
        })
    }

    fn check_open(&self) -> SearchResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(SearchError::AlreadyClosed("IndexReader"))
        } else {
            Ok(())
        }
    }

    fn check_writable(&self) -> SearchResult<()> {
        self.check_open()?;
        if self.inner.read_only {
            Err(SearchError::UnsupportedOperation(
                "reader was opened read-only",
            ))
        } else {
            Ok(())
        }
    }

    pub fn directory(&self) -> &DirectoryRc {
        &self.inner.dir
    }

    pub fn segment_infos(&self) -> &SegmentInfos {
        &self.inner.infos
    }

    pub fn version(&self) -> u64 {
        self.inner.infos.version
    }

    pub fn leaves(&self) -> &[Arc<SegmentReader>] {
        &self.inner.leaves
    }

    pub fn doc_bases(&self) -> &[DocId] {
        &self.inner.doc_bases
    }

    pub fn max_doc(&self) -> u32 {
        self.inner.leaves.iter().map(|l| l.max_doc()).sum()
    }

    pub fn num_docs(&self) -> u32 {
        self.inner.leaves.iter().map(|l| l.num_docs()).sum()
    }

    pub fn has_deletions(&self) -> bool {
        self.inner.leaves.iter().any(|l| l.has_deletions())
    }

    /// (leaf index, local doc) for a composite doc id.
    fn route(&self, doc: DocId) -> SearchResult<(usize, DocId)> {
        if doc < 0 || doc as u32 >= self.max_doc() {
            return Err(SearchError::IllegalArgument(format!(
                "doc {doc} out of bounds (max_doc {})",
                self.max_doc()
            )));
        }
        let mut leaf = 0;
        for (i, &base) in self.inner.doc_bases.iter().enumerate() {
            if doc >= base {
                leaf = i;
            } else {
                break;
            }
        }
        Ok((leaf, doc - self.inner.doc_bases[leaf]))
    }

    pub fn is_deleted(&self, doc: DocId) -> bool {
        match self.route(doc) {
            Ok((leaf, local)) => self.inner.leaves[leaf].is_deleted(local),
            Err(_) => false,
        }
    }

    pub fn document(&self, doc: DocId) -> SearchResult<Document> {
        self.check_open()?;
        let (leaf, local) = self.route(doc)?;
        self.inner.leaves[leaf].document(local)
    }

    pub fn document_with_selector(
        &self,
        doc: DocId,
        selector: &dyn FieldSelector,
    ) -> SearchResult<Vec<StoredField>> {
        self.check_open()?;
        let (leaf, local) = self.route(doc)?;
        self.inner.leaves[leaf].document_with_selector(local, selector)
    }

    pub fn term_vector(&self, doc: DocId, field: &str) -> SearchResult<Option<TermVector>> {
        self.check_open()?;
        let (leaf, local) = self.route(doc)?;
        self.inner.leaves[leaf].term_vector(local, field)
    }

    pub fn doc_freq(&self, term: &Term) -> SearchResult<u32> {
        self.check_open()?;
        let mut total = 0;
        for leaf in &self.inner.leaves {
            total += leaf.doc_freq(term)?;
        }
        Ok(total)
    }

    /// Composite norms: leaf arrays concatenated in doc-base order.
    pub fn norms(&self, field: &str) -> SearchResult<Option<Vec<u8>>> {
        self.check_open()?;
        let mut any = false;
        let mut bytes = Vec::with_capacity(self.max_doc() as usize);
        let neutral = crate::search::similarity::encode_norm(1.0);
        for leaf in &self.inner.leaves {
            match leaf.norms(field)? {
                Some(leaf_bytes) => {
                    any = true;
                    bytes.extend_from_slice(&leaf_bytes);
                }
                None => bytes.extend(std::iter::repeat(neutral).take(leaf.max_doc() as usize)),
            }
        }
        Ok(any.then_some(bytes))
    }

    /// Sequential cursor over all matching docs across leaves, yielding
    /// composite doc ids.
    pub fn term_docs(&self, term: &Term) -> SearchResult<MultiTermDocs> {
        self.check_open()?;
        let mut cursors = Vec::with_capacity(self.inner.leaves.len());
        for leaf in &self.inner.leaves {
            cursors.push(leaf.term_docs(term)?);
        }
        Ok(MultiTermDocs {
            cursors,
            doc_bases: self.inner.doc_bases.clone(),
            current: 0,
        })
    }

    pub fn term_positions(&self, term: &Term) -> SearchResult<MultiTermPositions> {
        self.check_open()?;
        let mut cursors = Vec::with_capacity(self.inner.leaves.len());
        for leaf in &self.inner.leaves {
            cursors.push(leaf.term_positions(term)?);
        }
        Ok(MultiTermPositions {
            cursors,
            doc_bases: self.inner.doc_bases.clone(),
            current: 0,
        })
    }

    /// Merged term enumeration across every leaf, in dictionary order,
    /// starting from `from` when given.
    pub fn terms(&self, from: Option<&Term>) -> SearchResult<MultiTermEnum> {
        self.check_open()?;
        MultiTermEnum::new(&self.inner.leaves, from)
    }

    fn acquire_write_lock(&self) -> SearchResult<()> {
        let mut lock = self.inner.write_lock.lock().unwrap();
        if lock.is_some() {
            return Ok(());
        }
        let guard = self
            .inner
            .dir
            .obtain_lock(WRITE_LOCK_NAME, crate::config::DEFAULT_WRITE_LOCK_TIMEOUT_MS)?;
        // the index must not have moved since this reader's snapshot
        let current = SegmentInfos::read_current(self.inner.dir.as_ref())?;
        if current.generation != self.inner.infos.generation {
            drop(guard);
            return Err(SearchError::StaleReader(format!(
                "index moved to generation {} past this reader's {}",
                current.generation, self.inner.infos.generation
            )));
        }
        *lock = Some(guard);
        Ok(())
    }

    pub fn delete_document(&self, doc: DocId) -> SearchResult<bool> {
        self.check_writable()?;
        self.acquire_write_lock()?;
        let (leaf, local) = self.route(doc)?;
        self.inner.leaves[leaf].delete_document(local)
    }

    pub fn delete_documents(&self, term: &Term) -> SearchResult<usize> {
        self.check_writable()?;
        self.acquire_write_lock()?;
        let mut count = 0;
        for leaf in &self.inner.leaves {
            count += leaf.delete_documents(term)?;
        }
        Ok(count)
    }

    pub fn undelete_all(&self) -> SearchResult<()> {
        self.check_writable()?;
        self.acquire_write_lock()?;
        for leaf in &self.inner.leaves {
            leaf.undelete_all()?;
        }
        Ok(())
    }

    pub fn set_norm(&self, doc: DocId, field: &str, value: u8) -> SearchResult<()> {
        self.check_writable()?;
        self.acquire_write_lock()?;
        let (leaf, local) = self.route(doc)?;
        self.inner.leaves[leaf].set_norm(local, field, value)
    }

    /// Commits pending reader-side changes as new generation files plus a
    /// new manifest.
    pub fn flush(&self) -> SearchResult<()> {
        self.flush_with_policy(&(Arc::new(KeepOnlyLastCommit) as Arc<dyn DeletionPolicy>))
    }

    pub fn flush_with_policy(&self, policy: &Arc<dyn DeletionPolicy>) -> SearchResult<()> {
        self.check_writable()?;
        if !self.inner.leaves.iter().any(|l| l.has_pending_changes()) {
            return Ok(());
        }
        self.acquire_write_lock()?;
        let mut infos = self.inner.infos.clone();
        for (i, leaf) in self.inner.leaves.iter().enumerate() {
            if leaf.has_pending_changes() {
                infos.segments[i] = leaf.commit_pending()?;
            }
        }
        infos.commit(self.inner.dir.as_ref())?;
        debug!(
            "reader committed generation {} of {:?}",
            infos.generation, self.inner.dir
        );
        let mut deleter =
            IndexFileDeleter::new(Arc::clone(&self.inner.dir), Arc::clone(policy), &infos)?;
        deleter.release_checkpoint();
        Ok(())
    }

    /// Returns `self` (same handle, another reference) when the index is
    /// unchanged; otherwise a new reader sharing every unchanged leaf.
    pub fn reopen(&self) -> SearchResult<IndexReader> {
        self.check_open()?;
        let current = SegmentInfos::read_current(self.inner.dir.as_ref())?;
        if current.version == self.inner.infos.version {
            return Ok(self.clone());
        }
        Self::from_infos(
            Arc::clone(&self.inner.dir),
            current,
            self.inner.read_only,
            self.inner.terms_index_divisor,
            self.inner.leaves.clone(),
            None,
        )
    }

    /// Writable-deletes copy: shares segment cores with this reader but
    /// owns private deletion/norm overlays.
    pub fn clone_writable(&self) -> SearchResult<IndexReader> {
        self.check_open()?;
        let leaves: Vec<Arc<SegmentReader>> = self
            .inner
            .leaves
            .iter()
            .map(|leaf| Arc::new(leaf.clone_reader()))
            .collect();
        let mut doc_bases = Vec::with_capacity(leaves.len());
        let mut base = 0;
        for leaf in &leaves {
            doc_bases.push(base);
            base += leaf.max_doc() as DocId;
        }
        Ok(IndexReader {
            inner: Arc::new(ReaderInner {
                dir: Arc::clone(&self.inner.dir),
                infos: self.inner.infos.clone(),
                leaves,
                doc_bases,
                read_only: false,
                terms_index_divisor: self.inner.terms_index_divisor,
                ref_count: AtomicU32::new(1),
                closed: AtomicBool::new(false),
                write_lock: Mutex::new(None),
                on_close: Mutex::new(None),
            }),
        })
    }

    pub fn inc_ref(&self) {
        self.inner.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn ref_count(&self) -> u32 {
        self.inner.ref_count.load(Ordering::Acquire)
    }

    /// Drops one reference; the last one closes the reader for real.
    pub fn close(&self) -> SearchResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.inner.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            if !self.inner.read_only {
                // pending changes commit on close, like a writer would
                if self.inner.leaves.iter().any(|l| l.has_pending_changes()) {
                    self.inner.ref_count.fetch_add(1, Ordering::AcqRel);
                    let result = self.flush();
                    self.inner.ref_count.fetch_sub(1, Ordering::AcqRel);
                    result?;
                }
            }
            self.inner.closed.store(true, Ordering::Release);
            *self.inner.write_lock.lock().unwrap() = None;
            if let Some(hook) = self.inner.on_close.lock().unwrap().take() {
                hook();
            }
        }
        Ok(())
    }
}

/// Deletion-filtered doc cursor across leaves with doc-base offsets.
pub struct MultiTermDocs {
    cursors: Vec<Option<SegmentTermDocs>>,
    doc_bases: Vec<DocId>,
    current: usize,
}

impl MultiTermDocs {
    pub fn next(&mut self) -> SearchResult<Option<(DocId, u32)>> {
        while self.current < self.cursors.len() {
            if let Some(cursor) = &mut self.cursors[self.current] {
                if cursor.next()? {
                    return Ok(Some((
                        self.doc_bases[self.current] + cursor.doc(),
                        cursor.freq(),
                    )));
                }
            }
            self.current += 1;
        }
        Ok(None)
    }
}

pub struct MultiTermPositions {
    cursors: Vec<Option<SegmentTermPositions>>,
    doc_bases: Vec<DocId>,
    current: usize,
}

impl MultiTermPositions {
    pub fn next(&mut self) -> SearchResult<Option<(DocId, u32)>> {
        while self.current < self.cursors.len() {
            if let Some(cursor) = &mut self.cursors[self.current] {
                if cursor.next()? {
                    return Ok(Some((
                        self.doc_bases[self.current] + cursor.doc(),
                        cursor.freq(),
                    )));
                }
            }
            self.current += 1;
        }
        Ok(None)
    }

    pub fn positions(&self) -> &[u32] {
        self.cursors[self.current]
            .as_ref()
            .map(|c| c.positions())
            .unwrap_or(&[])
    }
}

/// K-way merged term enumeration across leaves; equal terms collapse into
/// one entry with their doc freqs summed.
pub struct MultiTermEnum {
    cursors: Vec<TermEnum>,
    current: Option<(Term, u32)>,
}

impl MultiTermEnum {
    fn new(leaves: &[Arc<SegmentReader>], from: Option<&Term>) -> SearchResult<MultiTermEnum> {
        let mut cursors = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            let cursor = match from {
                Some(term) => leaf.terms_from(term)?,
                None => {
                    let mut cursor = leaf.terms();
                    cursor.next()?;
                    cursor
                }
            };
            cursors.push(cursor);
        }
        Ok(MultiTermEnum {
            cursors,
            current: None,
        })
    }

    /// Advances to the next distinct term across all leaves.
    pub fn next(&mut self) -> SearchResult<bool> {
        let mut smallest: Option<Term> = None;
        for cursor in &self.cursors {
            if let Some(term) = cursor.term() {
                smallest = match smallest {
                    Some(best) if best <= term => Some(best),
                    _ => Some(term),
                };
            }
        }
        let term = match smallest {
            Some(term) => term,
            None => {
                self.current = None;
                return Ok(false);
            }
        };
        let mut doc_freq = 0;
        for cursor in &mut self.cursors {
            if cursor.term().as_ref() == Some(&term) {
                doc_freq += cursor.doc_freq();
                cursor.next()?;
            }
        }
        self.current = Some((term, doc_freq));
        Ok(true)
    }

    pub fn term(&self) -> Option<&Term> {
        self.current.as_ref().map(|(term, _)| term)
    }

    pub fn doc_freq(&self) -> u32 {
        self.current.as_ref().map(|(_, df)| *df).unwrap_or(0)
    }
}
