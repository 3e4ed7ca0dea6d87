use std::sync::Arc;

use smallvec::SmallVec;

use crate::codec::skip::{SkipListReader, SkipListWriter, SKIP_INTERVAL};
use crate::codec::terms::TermInfo;
use crate::directory::{IndexInput, IndexOutput};
use crate::error::{SearchError, SearchResult};
use crate::util::{BitVector, DocId};

/// Streams one term's postings into `.frq`/`.prx`. Doc ids must arrive in
/// ascending order; positions in ascending order within each doc.
///
/// Freq encoding: `delta << 1 | 1` for freq 1, else `delta << 1` followed by
/// a vint freq. Fields that omit term frequencies write bare deltas.
/// Prox encoding: vint position delta; payload-storing fields follow every
/// delta with a vint payload length and the payload bytes.
pub struct PostingsWriter {
    freq: Box<dyn IndexOutput>,
    prox: Box<dyn IndexOutput>,
    skip: SkipListWriter,
    omit_tf: bool,
    store_payloads: bool,
    doc_freq: u32,
    last_doc: DocId,
    last_position: u32,
    freq_start: u64,
    prox_start: u64,
}

impl PostingsWriter {
    pub fn new(freq: Box<dyn IndexOutput>, prox: Box<dyn IndexOutput>) -> Self {
        Self {
            freq,
            prox,
            skip: SkipListWriter::new(),
            omit_tf: false,
            store_payloads: false,
            doc_freq: 0,
            last_doc: 0,
            last_position: 0,
            freq_start: 0,
            prox_start: 0,
        }
    }

    pub fn start_field(&mut self, omit_tf: bool, store_payloads: bool) {
        self.omit_tf = omit_tf;
        self.store_payloads = store_payloads && !omit_tf;
    }

    pub fn start_term(&mut self) {
        self.doc_freq = 0;
        self.last_doc = 0;
        self.freq_start = self.freq.file_pointer();
        self.prox_start = self.prox.file_pointer();
        self.skip.reset(self.freq_start, self.prox_start);
    }

    /// Adds one document entry. For non-omit-tf fields, exactly `freq`
    /// `add_position` calls must follow.
    pub fn add_doc(&mut self, doc: DocId, freq: u32) -> SearchResult<()> {
        if self.doc_freq > 0 && doc <= self.last_doc {
            return Err(SearchError::corrupt(format!(
                "docs out of order: {doc} after {}",
                self.last_doc
            )));
        }
        if self.doc_freq > 0 && self.doc_freq % SKIP_INTERVAL == 0 {
            self.skip.buffer_skip(
                self.last_doc,
                self.doc_freq,
                self.freq.file_pointer(),
                self.prox.file_pointer(),
            )?;
        }
        let delta = (doc - self.last_doc) as u32;
        if self.omit_tf {
            self.freq.write_vint(delta)?;
        } else if freq == 1 {
            self.freq.write_vint(delta << 1 | 1)?;
        } else {
            self.freq.write_vint(delta << 1)?;
            self.freq.write_vint(freq)?;
        }
        self.last_doc = doc;
        self.last_position = 0;
        self.doc_freq += 1;
        Ok(())
    }

    pub fn add_position(&mut self, position: u32, payload: Option<&[u8]>) -> SearchResult<()> {
        if self.omit_tf {
            return Ok(());
        }
        self.prox.write_vint(position - self.last_position)?;
        self.last_position = position;
        if self.store_payloads {
            let payload = payload.unwrap_or(&[]);
            self.prox.write_vint(payload.len() as u32)?;
            self.prox.write_bytes(payload)?;
        }
        Ok(())
    }

    /// Appends the skip block and returns the dictionary entry.
    pub fn finish_term(&mut self) -> SearchResult<TermInfo> {
        let skip_offset = if self.doc_freq >= SKIP_INTERVAL {
            self.skip.write_to(self.freq.as_mut(), self.doc_freq)?
        } else {
            self.freq_start
        };
        Ok(TermInfo {
            doc_freq: self.doc_freq,
            freq_pointer: self.freq_start,
            prox_pointer: self.prox_start,
            skip_offset,
        })
    }

    pub fn close(&mut self) -> SearchResult<()> {
        self.freq.close()?;
        self.prox.close()
    }
}

/// Cursor over one term's documents, deletion-filtered at read time.
pub struct SegmentTermDocs {
    freq: IndexInput,
    deleted: Option<Arc<BitVector>>,
    term_info: TermInfo,
    omit_tf: bool,
    skip_interval: u32,
    count: u32,
    doc: DocId,
    freq_value: u32,
    skip: Option<SkipListReader>,
}

impl SegmentTermDocs {
    pub fn new(
        mut freq: IndexInput,
        term_info: TermInfo,
        omit_tf: bool,
        skip_interval: u32,
        deleted: Option<Arc<BitVector>>,
    ) -> SearchResult<Self> {
        freq.seek(term_info.freq_pointer)?;
        Ok(Self {
            freq,
            deleted,
            term_info,
            omit_tf,
            skip_interval,
            count: 0,
            doc: 0,
            freq_value: 1,
            skip: None,
        })
    }

    pub fn doc(&self) -> DocId {
        self.doc
    }

    pub fn freq(&self) -> u32 {
        self.freq_value
    }

    pub fn doc_freq(&self) -> u32 {
        self.term_info.doc_freq
    }

    fn is_deleted(&self, doc: DocId) -> bool {
        self.deleted.as_ref().map(|d| d.get(doc)).unwrap_or(false)
    }

    fn read_one(&mut self) -> SearchResult<()> {
        let code = self.freq.read_vint()?;
        if self.omit_tf {
            self.doc += code as DocId;
            self.freq_value = 1;
        } else {
            self.doc += (code >> 1) as DocId;
            self.freq_value = if code & 1 != 0 {
                1
            } else {
                self.freq.read_vint()?
            };
        }
        self.count += 1;
        Ok(())
    }

    /// Advances to the next live document.
    pub fn next(&mut self) -> SearchResult<bool> {
        loop {
            if self.count >= self.term_info.doc_freq {
                return Ok(false);
            }
            self.read_one()?;
            if !self.is_deleted(self.doc) {
                return Ok(true);
            }
        }
    }

    /// First live doc `>= target`, using the skip pyramid for long jumps.
    pub fn advance(&mut self, target: DocId) -> SearchResult<bool> {
        if self.term_info.doc_freq >= self.skip_interval
            && target > self.doc + self.skip_interval as DocId
        {
            if self.skip.is_none() {
                let mut skip_input = self.freq.clone();
                skip_input.seek(self.term_info.skip_offset)?;
                self.skip = Some(SkipListReader::new(skip_input, self.term_info.doc_freq)?);
            }
            let skip = self.skip.as_mut().unwrap();
            if let Some((doc, freq_ptr, _prox_ptr, num_docs)) = skip.skip_to(
                target,
                self.term_info.freq_pointer,
                self.term_info.prox_pointer,
            )? {
                if num_docs > self.count {
                    self.freq.seek(freq_ptr)?;
                    self.doc = doc;
                    self.count = num_docs;
                }
            }
        }
        while self.doc < target || self.count == 0 || self.is_deleted(self.doc) {
            if !self.next()? {
                return Ok(false);
            }
            if self.doc >= target {
                return Ok(true);
            }
        }
        Ok(true)
    }
}

/// Cursor over one term's documents and positions. Positions for the
/// current document are decoded eagerly, payloads included.
pub struct SegmentTermPositions {
    freq: IndexInput,
    prox: IndexInput,
    deleted: Option<Arc<BitVector>>,
    term_info: TermInfo,
    omit_tf: bool,
    store_payloads: bool,
    skip_interval: u32,
    count: u32,
    doc: DocId,
    freq_value: u32,
    positions: SmallVec<[u32; 8]>,
    payloads: Vec<Option<Vec<u8>>>,
    next_position: usize,
    skip: Option<SkipListReader>,
}

impl SegmentTermPositions {
    pub fn new(
        mut freq: IndexInput,
        mut prox: IndexInput,
        term_info: TermInfo,
        omit_tf: bool,
        store_payloads: bool,
        skip_interval: u32,
        deleted: Option<Arc<BitVector>>,
    ) -> SearchResult<Self> {
        freq.seek(term_info.freq_pointer)?;
        prox.seek(term_info.prox_pointer)?;
        Ok(Self {
            freq,
            prox,
            deleted,
            term_info,
            omit_tf,
            store_payloads,
            skip_interval,
            count: 0,
            doc: 0,
            freq_value: 1,
            positions: SmallVec::new(),
            payloads: Vec::new(),
            next_position: 0,
            skip: None,
        })
    }

    pub fn doc(&self) -> DocId {
        self.doc
    }

    pub fn freq(&self) -> u32 {
        self.freq_value
    }

    pub fn positions(&self) -> &[u32] {
        &self.positions
    }

    /// Iterator-style access mirroring the docs cursor: each call returns
    /// the next position of the current document.
    pub fn next_position(&mut self) -> Option<u32> {
        let position = self.positions.get(self.next_position).copied();
        if position.is_some() {
            self.next_position += 1;
        }
        position
    }

    pub fn payload(&self) -> Option<&[u8]> {
        if self.next_position == 0 {
            return None;
        }
        self.payloads
            .get(self.next_position - 1)
            .and_then(|p| p.as_deref())
    }

    fn is_deleted(&self, doc: DocId) -> bool {
        self.deleted.as_ref().map(|d| d.get(doc)).unwrap_or(false)
    }

    fn read_one(&mut self) -> SearchResult<()> {
        let code = self.freq.read_vint()?;
        if self.omit_tf {
            self.doc += code as DocId;
            self.freq_value = 1;
        } else {
            self.doc += (code >> 1) as DocId;
            self.freq_value = if code & 1 != 0 {
                1
            } else {
                self.freq.read_vint()?
            };
        }
        self.positions.clear();
        self.payloads.clear();
        self.next_position = 0;
        if !self.omit_tf {
            let mut position = 0u32;
            for _ in 0..self.freq_value {
                position += self.prox.read_vint()?;
                self.positions.push(position);
                if self.store_payloads {
                    let len = self.prox.read_vint()? as usize;
                    if len > 0 {
                        self.payloads.push(Some(self.prox.read_vec(len)?));
                    } else {
                        self.payloads.push(None);
                    }
                }
            }
        }
        self.count += 1;
        Ok(())
    }

    pub fn next(&mut self) -> SearchResult<bool> {
        loop {
            if self.count >= self.term_info.doc_freq {
                return Ok(false);
            }
            self.read_one()?;
            if !self.is_deleted(self.doc) {
                return Ok(true);
            }
        }
    }

    pub fn advance(&mut self, target: DocId) -> SearchResult<bool> {
        if self.term_info.doc_freq >= self.skip_interval
            && target > self.doc + self.skip_interval as DocId
        {
            if self.skip.is_none() {
                let mut skip_input = self.freq.clone();
                skip_input.seek(self.term_info.skip_offset)?;
                self.skip = Some(SkipListReader::new(skip_input, self.term_info.doc_freq)?);
            }
            let skip = self.skip.as_mut().unwrap();
            if let Some((doc, freq_ptr, prox_ptr, num_docs)) = skip.skip_to(
                target,
                self.term_info.freq_pointer,
                self.term_info.prox_pointer,
            )? {
                if num_docs > self.count {
                    self.freq.seek(freq_ptr)?;
                    self.prox.seek(prox_ptr)?;
                    self.doc = doc;
                    self.count = num_docs;
                    self.positions.clear();
                    self.payloads.clear();
                }
            }
        }
        while self.doc < target || self.count == 0 || self.is_deleted(self.doc) {
            if !self.next()? {
                return Ok(false);
            }
            if self.doc >= target {
                return Ok(true);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Directory, RamDirectory};

    fn write_term(
        dir: &dyn Directory,
        docs: &[(DocId, Vec<u32>)],
        omit_tf: bool,
        payloads: bool,
    ) -> TermInfo {
        let freq = dir.create_output("_0.frq").unwrap();
        let prox = dir.create_output("_0.prx").unwrap();
        let mut writer = PostingsWriter::new(freq, prox);
        writer.start_field(omit_tf, payloads);
        writer.start_term();
        for (doc, positions) in docs {
            writer.add_doc(*doc, positions.len().max(1) as u32).unwrap();
            for (i, pos) in positions.iter().enumerate() {
                let payload = format!("p{i}");
                writer
                    .add_position(*pos, payloads.then(|| payload.as_bytes()).map(|b| &b[..]))
                    .unwrap();
            }
        }
        let info = writer.finish_term().unwrap();
        writer.close().unwrap();
        info
    }

    #[test]
    fn docs_and_freqs_round_trip() {
        let dir = RamDirectory::new();
        let postings: Vec<(DocId, Vec<u32>)> = vec![
            (0, vec![1]),
            (2, vec![1, 5, 9]),
            (7, vec![3]),
            (50, vec![2, 4]),
        ];
        let info = write_term(dir.as_ref(), &postings, false, false);
        assert_eq!(info.doc_freq, 4);

        let freq = dir.open_input("_0.frq").unwrap();
        let mut cursor =
            SegmentTermDocs::new(freq, info, false, SKIP_INTERVAL, None).unwrap();
        let mut seen = Vec::new();
        while cursor.next().unwrap() {
            seen.push((cursor.doc(), cursor.freq()));
        }
        assert_eq!(seen, vec![(0, 1), (2, 3), (7, 1), (50, 2)]);
    }

    #[test]
    fn positions_and_payloads_round_trip() {
        let dir = RamDirectory::new();
        let postings: Vec<(DocId, Vec<u32>)> = vec![(1, vec![0, 4]), (3, vec![7])];
        let info = write_term(dir.as_ref(), &postings, false, true);

        let freq = dir.open_input("_0.frq").unwrap();
        let prox = dir.open_input("_0.prx").unwrap();
        let mut cursor = SegmentTermPositions::new(
            freq,
            prox,
            info,
            false,
            true,
            SKIP_INTERVAL,
            None,
        )
        .unwrap();
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.positions(), &[0, 4]);
        assert_eq!(cursor.next_position(), Some(0));
        assert_eq!(cursor.payload(), Some(&b"p0"[..]));
        assert_eq!(cursor.next_position(), Some(4));
        assert_eq!(cursor.payload(), Some(&b"p1"[..]));
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.positions(), &[7]);
        assert!(!cursor.next().unwrap());
    }

    #[test]
    fn omit_tf_writes_bare_deltas() {
        let dir = RamDirectory::new();
        let postings: Vec<(DocId, Vec<u32>)> = vec![(0, vec![]), (3, vec![]), (9, vec![])];
        let info = write_term(dir.as_ref(), &postings, true, false);
        // no positions were written at all
        assert_eq!(dir.file_length("_0.prx").unwrap(), 0);

        let freq = dir.open_input("_0.frq").unwrap();
        let mut cursor = SegmentTermDocs::new(freq, info, true, SKIP_INTERVAL, None).unwrap();
        let mut seen = Vec::new();
        while cursor.next().unwrap() {
            assert_eq!(cursor.freq(), 1);
            seen.push(cursor.doc());
        }
        assert_eq!(seen, vec![0, 3, 9]);
    }

    #[test]
    fn deleted_docs_filtered() {
        let dir = RamDirectory::new();
        let postings: Vec<(DocId, Vec<u32>)> = (0..10).map(|d| (d, vec![0])).collect();
        let info = write_term(dir.as_ref(), &postings, false, false);
        let mut deleted = BitVector::new(10);
        deleted.set(0);
        deleted.set(5);

        let freq = dir.open_input("_0.frq").unwrap();
        let mut cursor =
            SegmentTermDocs::new(freq, info, false, SKIP_INTERVAL, Some(Arc::new(deleted)))
                .unwrap();
        let mut seen = Vec::new();
        while cursor.next().unwrap() {
            seen.push(cursor.doc());
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 6, 7, 8, 9]);
    }

    #[test]
    fn advance_uses_skips_across_large_lists() {
        let dir = RamDirectory::new();
        // every third doc, freq varies to stress the freq low-bit
        let postings: Vec<(DocId, Vec<u32>)> = (0..2000)
            .map(|i| (i * 3, (0..(i % 4 + 1)).map(|p| p as u32 * 2).collect()))
            .collect();
        let info = write_term(dir.as_ref(), &postings, false, false);

        let freq = dir.open_input("_0.frq").unwrap();
        let mut cursor =
            SegmentTermDocs::new(freq, info, false, SKIP_INTERVAL, None).unwrap();
        assert!(cursor.advance(2999).unwrap());
        assert_eq!(cursor.doc(), 3000);
        assert!(cursor.advance(3000).unwrap());
        assert_eq!(cursor.doc(), 3000);
        assert!(cursor.advance(5997).unwrap());
        assert_eq!(cursor.doc(), 5997);
        assert!(!cursor.advance(6000).unwrap());

        // positions survive a skip-seek
        let freq = dir.open_input("_0.frq").unwrap();
        let prox = dir.open_input("_0.prx").unwrap();
        let mut cursor = SegmentTermPositions::new(
            freq,
            prox,
            info,
            false,
            false,
            SKIP_INTERVAL,
            None,
        )
        .unwrap();
        assert!(cursor.advance(4500).unwrap());
        assert_eq!(cursor.doc(), 4500);
        let i = 1500u32;
        let expected: Vec<u32> = (0..(i % 4 + 1)).map(|p| p * 2).collect();
        assert_eq!(cursor.positions(), expected.as_slice());
    }
}
