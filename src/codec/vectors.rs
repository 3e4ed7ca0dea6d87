use crate::codec::field_infos::FieldInfos;
use crate::directory::{IndexInput, IndexOutput};
use crate::error::{SearchError, SearchResult};
use crate::util::DocId;

const FLAG_POSITIONS: u8 = 0x01;
const FLAG_OFFSETS: u8 = 0x02;

/// One field's term vector as handed back to callers: the distinct terms of
/// the field in this document, with frequencies and optional positions and
/// character offsets.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TermVector {
    pub field: String,
    pub terms: Vec<TermVectorEntry>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TermVectorEntry {
    pub term: String,
    pub freq: u32,
    pub positions: Vec<u32>,
    pub offsets: Vec<(u32, u32)>,
}

/// Writes `.tvx` (per-doc pointers), `.tvd` (per-doc field lists) and
/// `.tvf` (per-field term lists). One `add_document` call per doc in
/// doc-id order, vectors or not.
pub struct TermVectorsWriter {
    tvx: Box<dyn IndexOutput>,
    tvd: Box<dyn IndexOutput>,
    tvf: Box<dyn IndexOutput>,
}

impl TermVectorsWriter {
    pub fn new(
        tvx: Box<dyn IndexOutput>,
        tvd: Box<dyn IndexOutput>,
        tvf: Box<dyn IndexOutput>,
    ) -> Self {
        Self { tvx, tvd, tvf }
    }

    /// `fields` must be sorted by field number; each entry carries the
    /// field's terms sorted by text.
    pub fn add_document(
        &mut self,
        fields: &[(u32, bool, bool, Vec<TermVectorEntry>)],
    ) -> SearchResult<()> {
        self.tvx.write_u64(self.tvd.file_pointer())?;
        self.tvx.write_u64(self.tvf.file_pointer())?;

        self.tvd.write_vint(fields.len() as u32)?;
        let mut last_number = 0;
        let mut last_tvf = self.tvf.file_pointer();
        for (number, _, _, _) in fields {
            self.tvd.write_vint(number - last_number)?;
            last_number = *number;
        }
        for (_, with_positions, with_offsets, terms) in fields {
            let tvf_start = self.tvf.file_pointer();
            self.tvd.write_vlong(tvf_start - last_tvf)?;
            last_tvf = tvf_start;
            self.write_field(*with_positions, *with_offsets, terms)?;
        }
        Ok(())
    }

    fn write_field(
        &mut self,
        with_positions: bool,
        with_offsets: bool,
        terms: &[TermVectorEntry],
    ) -> SearchResult<()> {
        let mut flags = 0u8;
        if with_positions {
            flags |= FLAG_POSITIONS;
        }
        if with_offsets {
            flags |= FLAG_OFFSETS;
        }
        self.tvf.write_vint(terms.len() as u32)?;
        self.tvf.write_byte(flags)?;
        let mut last_term = Vec::new();
        for entry in terms {
            let text = entry.term.as_bytes();
            let prefix = last_term
                .iter()
                .zip(text.iter())
                .take_while(|(a, b)| a == b)
                .count();
            self.tvf.write_vint(prefix as u32)?;
            self.tvf.write_vint((text.len() - prefix) as u32)?;
            self.tvf.write_bytes(&text[prefix..])?;
            self.tvf.write_vint(entry.freq)?;
            if with_positions {
                let mut last = 0;
                for &position in &entry.positions {
                    self.tvf.write_vint(position - last)?;
                    last = position;
                }
            }
            if with_offsets {
                let mut last = 0;
                for &(start, end) in &entry.offsets {
                    self.tvf.write_vint(start - last)?;
                    self.tvf.write_vint(end - start)?;
                    last = start;
                }
            }
            last_term = text.to_vec();
        }
        Ok(())
    }

    pub fn close(&mut self) -> SearchResult<()> {
        self.tvx.close()?;
        self.tvd.close()?;
        self.tvf.close()
    }
}

/// Random-access reader over the term-vector files.
pub struct TermVectorsReader {
    tvx: IndexInput,
    tvd: IndexInput,
    tvf: IndexInput,
    max_doc: u32,
}

impl TermVectorsReader {
    pub fn open(
        tvx: IndexInput,
        tvd: IndexInput,
        tvf: IndexInput,
        max_doc: u32,
    ) -> SearchResult<Self> {
        let expected = max_doc as u64 * 16;
        if tvx.len() != expected {
            return Err(SearchError::corrupt(format!(
                "term vector index {} has length {}, expected {expected}",
                tvx.name(),
                tvx.len()
            )));
        }
        Ok(Self {
            tvx,
            tvd,
            tvf,
            max_doc,
        })
    }

    /// Every field vector of one document.
    pub fn document_vectors(
        &self,
        doc: DocId,
        field_infos: &FieldInfos,
    ) -> SearchResult<Vec<TermVector>> {
        if doc < 0 || doc as u32 >= self.max_doc {
            return Err(SearchError::IllegalArgument(format!(
                "doc {doc} out of bounds (max_doc {})",
                self.max_doc
            )));
        }
        let mut tvx = self.tvx.clone();
        tvx.seek(doc as u64 * 16)?;
        let tvd_pointer = tvx.read_u64()?;
        let mut tvf_pointer = tvx.read_u64()?;

        let mut tvd = self.tvd.clone();
        tvd.seek(tvd_pointer)?;
        let field_count = tvd.read_vint()? as usize;
        let mut numbers = Vec::with_capacity(field_count);
        let mut number = 0;
        for _ in 0..field_count {
            number += tvd.read_vint()?;
            numbers.push(number);
        }
        let mut vectors = Vec::with_capacity(field_count);
        for number in numbers {
            tvf_pointer += tvd.read_vlong()?;
            let field = field_infos
                .name_of(number)
                .ok_or_else(|| {
                    SearchError::corrupt(format!("term vector references unknown field {number}"))
                })?
                .to_string();
            vectors.push(self.read_field(tvf_pointer, field)?);
        }
        Ok(vectors)
    }

    /// A single field's vector, or `None` if the doc has no vector for it.
    pub fn vector(
        &self,
        doc: DocId,
        field: &str,
        field_infos: &FieldInfos,
    ) -> SearchResult<Option<TermVector>> {
        Ok(self
            .document_vectors(doc, field_infos)?
            .into_iter()
            .find(|v| v.field == field))
    }

    fn read_field(&self, pointer: u64, field: String) -> SearchResult<TermVector> {
        let mut tvf = self.tvf.clone();
        tvf.seek(pointer)?;
        let term_count = tvf.read_vint()? as usize;
        let flags = tvf.read_byte()?;
        let with_positions = flags & FLAG_POSITIONS != 0;
        let with_offsets = flags & FLAG_OFFSETS != 0;
        let mut terms = Vec::with_capacity(term_count);
        let mut last_term: Vec<u8> = Vec::new();
        for _ in 0..term_count {
            let prefix = tvf.read_vint()? as usize;
            let suffix_len = tvf.read_vint()? as usize;
            last_term.truncate(prefix);
            let suffix = tvf.read_vec(suffix_len)?;
            last_term.extend_from_slice(&suffix);
            let freq = tvf.read_vint()?;
            let mut positions = Vec::new();
            if with_positions {
                let mut position = 0;
                for _ in 0..freq {
                    position += tvf.read_vint()?;
                    positions.push(position);
                }
            }
            let mut offsets = Vec::new();
            if with_offsets {
                let mut start = 0;
                for _ in 0..freq {
                    start += tvf.read_vint()?;
                    let end = start + tvf.read_vint()?;
                    offsets.push((start, end));
                }
            }
            terms.push(TermVectorEntry {
                term: String::from_utf8_lossy(&last_term).into_owned(),
                freq,
                positions,
                offsets,
            });
        }
        Ok(TermVector { field, terms })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Directory, RamDirectory};
    use crate::document::FieldOptions;

    #[test]
    fn vectors_round_trip() {
        let dir = RamDirectory::new();
        let mut infos = FieldInfos::new();
        let opts = FieldOptions {
            indexed: true,
            tokenized: true,
            store_term_vector: true,
            vector_positions: true,
            vector_offsets: true,
            ..Default::default()
        };
        let body = infos.add("body", &opts);

        let mut writer = TermVectorsWriter::new(
            dir.create_output("_0.tvx").unwrap(),
            dir.create_output("_0.tvd").unwrap(),
            dir.create_output("_0.tvf").unwrap(),
        );
        let terms = vec![
            TermVectorEntry {
                term: "brown".to_string(),
                freq: 1,
                positions: vec![1],
                offsets: vec![(6, 11)],
            },
            TermVectorEntry {
                term: "quick".to_string(),
                freq: 2,
                positions: vec![0, 3],
                offsets: vec![(0, 5), (18, 23)],
            },
        ];
        writer
            .add_document(&[(body, true, true, terms.clone())])
            .unwrap();
        // doc 1 has no vectors
        writer.add_document(&[]).unwrap();
        writer.close().unwrap();

        let reader = TermVectorsReader::open(
            dir.open_input("_0.tvx").unwrap(),
            dir.open_input("_0.tvd").unwrap(),
            dir.open_input("_0.tvf").unwrap(),
            2,
        )
        .unwrap();
        let vector = reader.vector(0, "body", &infos).unwrap().unwrap();
        assert_eq!(vector.terms, terms);
        assert!(reader.vector(1, "body", &infos).unwrap().is_none());
        assert!(reader.vector(0, "title", &infos).unwrap().is_none());
    }
}
