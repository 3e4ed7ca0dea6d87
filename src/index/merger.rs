use std::collections::BinaryHeap;
use std::sync::Arc;

use hashbrown::HashMap;
use log::debug;

use crate::codec::field_infos::FieldInfos;
use crate::codec::norms::write_norms;
use crate::codec::postings::PostingsWriter;
use crate::codec::stored::StoredFieldsWriter;
use crate::codec::terms::{TermEnum, TermInfosWriter};
use crate::codec::vectors::TermVectorsWriter;
use crate::codec::{self, segment_file_name, ABORT_CHECK_INTERVAL};
use crate::directory::Directory;
use crate::document::{FieldOptions, Term};
use crate::error::SearchResult;
use crate::index::merge_policy::OneMerge;
use crate::index::reader::SegmentReader;
use crate::index::segment_infos::SegmentInfo;
use crate::util::DocId;

/// Counts abstract work units and polls the abort flag at the configured
/// interval, so a merge never runs long past a close or rollback.
struct AbortChecker<'a> {
    merge: Option<&'a OneMerge>,
    units: u64,
}

impl<'a> AbortChecker<'a> {
    fn new(merge: Option<&'a OneMerge>) -> Self {
        Self { merge, units: 0 }
    }

    fn tick(&mut self, units: u64) -> SearchResult<()> {
        self.units += units;
        if self.units >= ABORT_CHECK_INTERVAL {
            self.units = 0;
            if let Some(merge) = self.merge {
                merge.check_aborted()?;
            }
        }
        Ok(())
    }
}

pub struct MergeResult {
    pub info: SegmentInfo,
    pub field_infos: Arc<FieldInfos>,
}

/// Merges the given readers into segment `name`. Deleted documents are
/// dropped; surviving doc ids are remapped densely, preserving the input
/// order (reader order, then doc order within each reader).
pub fn merge_segments(
    dir: &dyn Directory,
    name: &str,
    readers: &[Arc<SegmentReader>],
    term_index_interval: u32,
    merge: Option<&OneMerge>,
) -> SearchResult<MergeResult> {
    let mut checker = AbortChecker::new(merge);
    if let Some(merge) = merge {
        merge.check_aborted()?;
    }

    // union of the input schemas; numbers may shift
    let mut merged_infos = FieldInfos::new();
    for reader in readers {
        for info in reader.field_infos().iter() {
            let number = merged_infos.add(
                &info.name,
                &FieldOptions {
                    indexed: info.is_indexed,
                    tokenized: false,
                    stored: false,
                    store_term_vector: info.store_term_vector,
                    vector_positions: info.vector_positions,
                    vector_offsets: info.vector_offsets,
                    omit_norms: info.omit_norms,
                    omit_term_freq_and_positions: info.omit_term_freq_and_positions,
                    compressed: false,
                },
            );
            if info.store_payloads {
                merged_infos.set_store_payloads(number);
            }
        }
    }
    let field_infos = Arc::new(merged_infos);
    field_infos.write(dir, &segment_file_name(name, codec::FIELD_INFOS_EXT))?;

    // old doc -> new doc, with deletions applied
    let mut doc_maps: Vec<Vec<Option<DocId>>> = Vec::with_capacity(readers.len());
    let mut next_doc: DocId = 0;
    for reader in readers {
        let mut map = Vec::with_capacity(reader.max_doc() as usize);
        for doc in 0..reader.max_doc() as DocId {
            if reader.is_deleted(doc) {
                map.push(None);
            } else {
                map.push(Some(next_doc));
                next_doc += 1;
            }
        }
        doc_maps.push(map);
    }
    let doc_count = next_doc as u32;

    merge_stored(dir, name, readers, &doc_maps, &field_infos, &mut checker)?;
    merge_postings(
        dir,
        name,
        readers,
        &doc_maps,
        &field_infos,
        term_index_interval,
        &mut checker,
    )?;

    let has_norms = field_infos.has_norms();
    if has_norms {
        merge_norms(dir, name, readers, &field_infos, doc_count)?;
    }
    let has_vectors = field_infos.has_vectors();
    if has_vectors {
        merge_vectors(dir, name, readers, &field_infos, &mut checker)?;
    }

    let mut info = SegmentInfo::new(name, doc_count, false);
    info.has_norms = has_norms;
    info.has_vectors = has_vectors;
    info.diagnostics
        .push(("source".to_string(), "merge".to_string()));
    info.diagnostics.push((
        "merged".to_string(),
        readers
            .iter()
            .map(|r| r.segment_name().to_string())
            .collect::<Vec<_>>()
            .join(","),
    ));
    debug!("merged {} readers into {name} ({doc_count} docs)", readers.len());
    Ok(MergeResult { info, field_infos })
}

fn merge_stored(
    dir: &dyn Directory,
    name: &str,
    readers: &[Arc<SegmentReader>],
    doc_maps: &[Vec<Option<DocId>>],
    field_infos: &Arc<FieldInfos>,
    checker: &mut AbortChecker<'_>,
) -> SearchResult<()> {
    let fdx = dir.create_output(&segment_file_name(name, codec::STORED_INDEX_EXT))?;
    let fdt = dir.create_output(&segment_file_name(name, codec::STORED_DATA_EXT))?;
    let mut writer = StoredFieldsWriter::new(fdx, fdt);
    for (reader, doc_map) in readers.iter().zip(doc_maps) {
        // identical numbering allows verbatim byte copies
        let matching = reader.field_infos().len() == field_infos.len()
            && reader
                .field_infos()
                .iter()
                .zip(field_infos.iter())
                .all(|(a, b)| a.name == b.name);
        for (doc, mapped) in doc_map.iter().enumerate() {
            if mapped.is_none() {
                continue;
            }
            checker.tick(1)?;
            if matching {
                let raw = reader.raw_stored_document(doc as DocId)?;
                writer.add_raw_document(&raw)?;
            } else {
                let document = reader.document(doc as DocId)?;
                let fields: Vec<(u32, &crate::document::Field)> = document
                    .fields
                    .iter()
                    .filter_map(|f| field_infos.number_of(&f.name).map(|n| (n, f)))
                    .collect();
                writer.add_document(&fields)?;
            }
        }
    }
    writer.close()
}

struct TermCursor {
    cursor: TermEnum,
    reader: usize,
}

struct HeapEntry {
    term: Term,
    reader: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.term == other.term && self.reader == other.reader
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // min-heap over (term, reader order)
        (&other.term, other.reader).cmp(&(&self.term, self.reader))
    }
}

fn merge_postings(
    dir: &dyn Directory,
    name: &str,
    readers: &[Arc<SegmentReader>],
    doc_maps: &[Vec<Option<DocId>>],
    field_infos: &Arc<FieldInfos>,
    term_index_interval: u32,
    checker: &mut AbortChecker<'_>,
) -> SearchResult<()> {
    let tis = dir.create_output(&segment_file_name(name, codec::TERM_DICT_EXT))?;
    let tii = dir.create_output(&segment_file_name(name, codec::TERM_INDEX_EXT))?;
    let mut dict = TermInfosWriter::new(tis, tii, Arc::clone(field_infos), term_index_interval)?;
    let freq = dir.create_output(&segment_file_name(name, codec::FREQ_EXT))?;
    let prox = dir.create_output(&segment_file_name(name, codec::PROX_EXT))?;
    let mut postings = PostingsWriter::new(freq, prox);

    let mut cursors: Vec<TermCursor> = Vec::with_capacity(readers.len());
    let mut heap = BinaryHeap::new();
    for (i, reader) in readers.iter().enumerate() {
        let mut cursor = reader.terms();
        if cursor.next()? {
            let term = cursor.term().unwrap();
            heap.push(HeapEntry { term, reader: i });
        }
        cursors.push(TermCursor { cursor, reader: i });
    }

    let mut current_field: Option<u32> = None;
    while let Some(top) = heap.pop() {
        let term = top.term;
        let mut participants = vec![top.reader];
        while let Some(next) = heap.peek() {
            if next.term == term {
                participants.push(heap.pop().unwrap().reader);
            } else {
                break;
            }
        }
        participants.sort_unstable();

        let field_number = field_infos.number_of(&term.field).unwrap();
        let info = field_infos.by_number(field_number).unwrap();
        if current_field != Some(field_number) {
            postings.start_field(info.omit_term_freq_and_positions, info.store_payloads);
            current_field = Some(field_number);
        }
        postings.start_term();
        for &reader_idx in &participants {
            let term_info = cursors[reader_idx].cursor.term_info().unwrap();
            let reader = &readers[reader_idx];
            let mut docs = reader.positions_for(
                term_info,
                info.omit_term_freq_and_positions,
                info.store_payloads,
            )?;
            let doc_map = &doc_maps[reader_idx];
            while docs.next()? {
                checker.tick(1)?;
                let mapped = match doc_map[docs.doc() as usize] {
                    Some(mapped) => mapped,
                    None => continue,
                };
                postings.add_doc(mapped, docs.freq())?;
                let entries: Vec<(u32, Option<Vec<u8>>)> = {
                    let mut out = Vec::with_capacity(docs.freq() as usize);
                    while let Some(position) = docs.next_position() {
                        out.push((position, docs.payload().map(|p| p.to_vec())));
                    }
                    out
                };
                for (position, payload) in entries {
                    postings.add_position(position, payload.as_deref())?;
                }
            }
        }
        let term_info = postings.finish_term()?;
        if term_info.doc_freq > 0 {
            dict.add(field_number, term.text.as_bytes(), &term_info)?;
        }

        for reader_idx in participants {
            if cursors[reader_idx].cursor.next()? {
                let term = cursors[reader_idx].cursor.term().unwrap();
                heap.push(HeapEntry {
                    term,
                    reader: cursors[reader_idx].reader,
                });
            }
        }
    }
    postings.close()?;
    dict.close()
}

fn merge_norms(
    dir: &dyn Directory,
    name: &str,
    readers: &[Arc<SegmentReader>],
    field_infos: &Arc<FieldInfos>,
    doc_count: u32,
) -> SearchResult<()> {
    let neutral = crate::search::similarity::encode_norm(1.0);
    let mut arrays: HashMap<u32, Vec<u8>> = HashMap::new();
    for info in field_infos.iter() {
        if !info.has_norms() {
            continue;
        }
        let mut bytes = Vec::with_capacity(doc_count as usize);
        for reader in readers {
            let leaf_norms = reader.norms(&info.name)?;
            for doc in 0..reader.max_doc() as DocId {
                if reader.is_deleted(doc) {
                    continue;
                }
                bytes.push(
                    leaf_norms
                        .as_ref()
                        .map(|n| n[doc as usize])
                        .unwrap_or(neutral),
                );
            }
        }
        arrays.insert(info.number, bytes);
    }
    write_norms(
        dir,
        &segment_file_name(name, codec::NORMS_EXT),
        field_infos,
        &arrays,
        doc_count,
    )
}

fn merge_vectors(
    dir: &dyn Directory,
    name: &str,
    readers: &[Arc<SegmentReader>],
    field_infos: &Arc<FieldInfos>,
    checker: &mut AbortChecker<'_>,
) -> SearchResult<()> {
    let tvx = dir.create_output(&segment_file_name(name, codec::VECTORS_INDEX_EXT))?;
    let tvd = dir.create_output(&segment_file_name(name, codec::VECTORS_DOCS_EXT))?;
    let tvf = dir.create_output(&segment_file_name(name, codec::VECTORS_FIELDS_EXT))?;
    let mut writer = TermVectorsWriter::new(tvx, tvd, tvf);
    for reader in readers {
        for doc in 0..reader.max_doc() as DocId {
            if reader.is_deleted(doc) {
                continue;
            }
            checker.tick(1)?;
            let vectors = reader.term_vectors(doc)?;
            let mut fields: Vec<(u32, bool, bool, Vec<crate::codec::vectors::TermVectorEntry>)> =
                vectors
                    .into_iter()
                    .filter_map(|vector| {
                        let info = field_infos.by_name(&vector.field)?;
                        Some((
                            info.number,
                            info.vector_positions,
                            info.vector_offsets,
                            vector.terms,
                        ))
                    })
                    .collect();
            fields.sort_by_key(|(number, ..)| *number);
            writer.add_document(&fields)?;
        }
    }
    writer.close()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::WhitespaceAnalyzer;
    use crate::directory::{DirectoryRc, RamDirectory};
    use crate::document::{Document, Field};
    use crate::index::doc_writer::DocWriter;
    use crate::search::similarity::DefaultSimilarity;

    fn write_segment(dir: &DirectoryRc, name: &str, texts: &[&str]) -> Arc<SegmentReader> {
        let writer = DocWriter::new(
            Arc::new(WhitespaceAnalyzer),
            Arc::new(DefaultSimilarity::default()),
            1,
        );
        for text in texts {
            let mut doc = Document::new();
            doc.add(Field::text("body", *text));
            writer.add_document(&doc).unwrap();
        }
        let flushed = writer.flush(dir.as_ref(), name, 16).unwrap().unwrap();
        Arc::new(SegmentReader::open(Arc::clone(dir), &flushed.info, 1).unwrap())
    }

    #[test]
    fn merge_preserves_doc_order_and_postings() {
        let dir: DirectoryRc = RamDirectory::new();
        let left = write_segment(&dir, "_0", &["apple pie", "banana split"]);
        let right = write_segment(&dir, "_1", &["apple crumble", "cherry pie"]);

        let result = merge_segments(dir.as_ref(), "_2", &[left, right], 16, None).unwrap();
        assert_eq!(result.info.doc_count, 4);

        let merged =
            SegmentReader::open(Arc::clone(&dir), &result.info, 1).unwrap();
        // doc order: left 0,1 then right 0,1
        assert_eq!(
            merged.document(0).unwrap().get("body").unwrap().value.as_text(),
            Some("apple pie")
        );
        assert_eq!(
            merged.document(3).unwrap().get("body").unwrap().value.as_text(),
            Some("cherry pie")
        );

        let mut docs = merged
            .term_docs(&Term::new("body", "apple"))
            .unwrap()
            .unwrap();
        let mut seen = Vec::new();
        while docs.next().unwrap() {
            seen.push(docs.doc());
        }
        assert_eq!(seen, vec![0, 2]);
        assert_eq!(merged.doc_freq(&Term::new("body", "pie")).unwrap(), 2);
    }

    #[test]
    fn deleted_docs_dropped_and_ids_remapped() {
        let dir: DirectoryRc = RamDirectory::new();
        let left = write_segment(&dir, "_0", &["one", "two", "three"]);
        left.delete_document(1).unwrap();
        let right = write_segment(&dir, "_1", &["four"]);

        let result = merge_segments(dir.as_ref(), "_2", &[left, right], 16, None).unwrap();
        assert_eq!(result.info.doc_count, 3);
        let merged = SegmentReader::open(Arc::clone(&dir), &result.info, 1).unwrap();
        assert_eq!(
            merged.document(1).unwrap().get("body").unwrap().value.as_text(),
            Some("three")
        );
        // the deleted doc's term is gone entirely
        assert!(merged
            .term_docs(&Term::new("body", "two"))
            .unwrap()
            .is_none());
        let mut docs = merged
            .term_docs(&Term::new("body", "four"))
            .unwrap()
            .unwrap();
        assert!(docs.next().unwrap());
        assert_eq!(docs.doc(), 2);
    }

    #[test]
    fn aborted_merge_stops() {
        let dir: DirectoryRc = RamDirectory::new();
        let texts: Vec<String> = (0..50).map(|i| format!("word{i} common")).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let left = write_segment(&dir, "_0", &refs);
        let merge = OneMerge::new(vec![left.segment_info()]);
        merge.abort();
        let result = merge_segments(dir.as_ref(), "_2", &[left], 16, Some(&merge));
        assert!(matches!(
            result,
            Err(crate::error::SearchError::MergeAborted(_))
        ));
    }
}
