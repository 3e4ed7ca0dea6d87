use std::cmp::Ordering;
use std::sync::Arc;

use crate::codec::field_infos::FieldInfos;
use crate::codec::skip::{MAX_SKIP_LEVELS, SKIP_INTERVAL};
use crate::directory::{IndexInput, IndexOutput};
use crate::document::Term;
use crate::error::{SearchError, SearchResult};

const FORMAT: i32 = -3;
// format + term count + index interval + skip interval + max skip levels
const HEADER_LEN: u64 = 4 + 8 + 4 + 4 + 4;
const TERM_COUNT_OFFSET: u64 = 4;

/// Location of one term's postings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TermInfo {
    pub doc_freq: u32,
    pub freq_pointer: u64,
    pub prox_pointer: u64,
    /// Absolute freq-file position of the term's skip data; meaningful only
    /// when `doc_freq` reaches the skip interval.
    pub skip_offset: u64,
}

/// Compares dictionary terms: field name first, then raw bytes.
fn compare_terms(
    field_infos: &FieldInfos,
    a_field: u32,
    a_text: &[u8],
    b_field: u32,
    b_text: &[u8],
) -> Ordering {
    if a_field == b_field {
        return a_text.cmp(b_text);
    }
    let a_name = field_infos.name_of(a_field).unwrap_or("");
    let b_name = field_infos.name_of(b_field).unwrap_or("");
    a_name.cmp(b_name).then_with(|| a_text.cmp(b_text))
}

fn shared_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

struct EntryWriter {
    out: Box<dyn IndexOutput>,
    last_text: Vec<u8>,
    last_info: TermInfo,
    count: u64,
}

impl EntryWriter {
    fn new(mut out: Box<dyn IndexOutput>, index_interval: u32) -> SearchResult<Self> {
        out.write_i32(FORMAT)?;
        out.write_u64(0)?; // patched on close
        out.write_u32(index_interval)?;
        out.write_u32(SKIP_INTERVAL)?;
        out.write_u32(MAX_SKIP_LEVELS as u32)?;
        Ok(Self {
            out,
            last_text: Vec::new(),
            last_info: TermInfo::default(),
            count: 0,
        })
    }

    fn write_entry(&mut self, field: u32, text: &[u8], info: &TermInfo) -> SearchResult<()> {
        let prefix = shared_prefix(&self.last_text, text);
        self.out.write_vint(prefix as u32)?;
        self.out.write_vint((text.len() - prefix) as u32)?;
        self.out.write_bytes(&text[prefix..])?;
        self.out.write_vint(field)?;
        self.out.write_vint(info.doc_freq)?;
        self.out
            .write_vlong(info.freq_pointer - self.last_info.freq_pointer)?;
        self.out
            .write_vlong(info.prox_pointer - self.last_info.prox_pointer)?;
        self.out
            .write_vlong(info.skip_offset.saturating_sub(info.freq_pointer))?;
        self.last_text = text.to_vec();
        self.last_info = *info;
        self.count += 1;
        Ok(())
    }

    fn close(&mut self) -> SearchResult<()> {
        self.out.seek(TERM_COUNT_OFFSET)?;
        self.out.write_u64(self.count)?;
        self.out.close()
    }
}

/// Writes the sorted term dictionary (`.tis`) and its sparse index
/// (`.tii`). Terms must arrive in strict (field name, bytes) order.
pub struct TermInfosWriter {
    field_infos: Arc<FieldInfos>,
    dict: EntryWriter,
    index: EntryWriter,
    index_interval: u32,
    last_field: Option<u32>,
    last_text: Vec<u8>,
    last_index_tis_pointer: u64,
}

impl TermInfosWriter {
    pub fn new(
        tis: Box<dyn IndexOutput>,
        tii: Box<dyn IndexOutput>,
        field_infos: Arc<FieldInfos>,
        index_interval: u32,
    ) -> SearchResult<Self> {
        Ok(Self {
            field_infos,
            dict: EntryWriter::new(tis, index_interval)?,
            index: EntryWriter::new(tii, index_interval)?,
            index_interval,
            last_field: None,
            last_text: Vec::new(),
            last_index_tis_pointer: HEADER_LEN,
        })
    }

    pub fn add(&mut self, field: u32, text: &[u8], info: &TermInfo) -> SearchResult<()> {
        if let Some(last_field) = self.last_field {
            let order = compare_terms(&self.field_infos, last_field, &self.last_text, field, text);
            if order != Ordering::Less {
                return Err(SearchError::corrupt(format!(
                    "terms out of order: {:?} then {:?}",
                    String::from_utf8_lossy(&self.last_text),
                    String::from_utf8_lossy(text)
                )));
            }
        }
        let ordinal = self.dict.count;
        self.dict.write_entry(field, text, info)?;
        if ordinal % self.index_interval as u64 == 0 {
            // the index names this term and points just past its entry, so
            // an enum seeded here decodes the following entry's deltas
            // against exactly the state it holds
            let tis_pointer = self.dict.out.file_pointer();
            self.index.write_entry(field, text, info)?;
            self.index
                .out
                .write_vlong(tis_pointer - self.last_index_tis_pointer)?;
            self.last_index_tis_pointer = tis_pointer;
        }
        self.last_field = Some(field);
        self.last_text = text.to_vec();
        Ok(())
    }

    pub fn close(&mut self) -> SearchResult<()> {
        self.dict.close()?;
        self.index.close()
    }
}

/// One in-memory `.tii` entry.
#[derive(Clone, Debug)]
struct IndexEntry {
    field: u32,
    text: Vec<u8>,
    info: TermInfo,
    /// `.tis` position just past this term's entry.
    tis_pointer: u64,
    /// Ordinal of this term in the dictionary.
    ordinal: u64,
}

/// Sequential cursor over the term dictionary in sorted order.
pub struct TermEnum {
    input: IndexInput,
    field_infos: Arc<FieldInfos>,
    term_count: u64,
    position: u64,
    valid: bool,
    field: u32,
    text: Vec<u8>,
    info: TermInfo,
}

impl TermEnum {
    fn at_start(input: IndexInput, field_infos: Arc<FieldInfos>, term_count: u64) -> Self {
        let mut input = input;
        let _ = input.seek(HEADER_LEN);
        Self {
            input,
            field_infos,
            term_count,
            position: 0,
            valid: false,
            field: 0,
            text: Vec::new(),
            info: TermInfo::default(),
        }
    }

    fn seeded(
        input: IndexInput,
        field_infos: Arc<FieldInfos>,
        term_count: u64,
        entry: &IndexEntry,
    ) -> SearchResult<Self> {
        let mut input = input;
        input.seek(entry.tis_pointer)?;
        Ok(Self {
            input,
            field_infos,
            term_count,
            position: entry.ordinal + 1,
            valid: true,
            field: entry.field,
            text: entry.text.clone(),
            info: entry.info,
        })
    }

    /// Advances to the next term. Returns false at the end of the
    /// dictionary.
    pub fn next(&mut self) -> SearchResult<bool> {
        if self.position >= self.term_count {
            self.valid = false;
            return Ok(false);
        }
        let prefix = self.input.read_vint()? as usize;
        let suffix_len = self.input.read_vint()? as usize;
        if prefix > self.text.len() {
            return Err(SearchError::corrupt(format!(
                "term prefix {prefix} longer than previous term in {}",
                self.input.name()
            )));
        }
        self.text.truncate(prefix);
        let mut suffix = vec![0u8; suffix_len];
        self.input.read_bytes(&mut suffix)?;
        self.text.extend_from_slice(&suffix);
        self.field = self.input.read_vint()?;
        let doc_freq = self.input.read_vint()?;
        let freq_pointer = self.info.freq_pointer + self.input.read_vlong()?;
        let prox_pointer = self.info.prox_pointer + self.input.read_vlong()?;
        let skip_delta = self.input.read_vlong()?;
        self.info = TermInfo {
            doc_freq,
            freq_pointer,
            prox_pointer,
            skip_offset: freq_pointer + skip_delta,
        };
        self.position += 1;
        self.valid = true;
        Ok(true)
    }

    pub fn term(&self) -> Option<Term> {
        if !self.valid {
            return None;
        }
        let field = self.field_infos.name_of(self.field)?.to_string();
        Some(Term {
            field,
            text: String::from_utf8_lossy(&self.text).into_owned(),
        })
    }

    pub fn term_info(&self) -> Option<TermInfo> {
        self.valid.then_some(self.info)
    }

    pub fn doc_freq(&self) -> u32 {
        self.info.doc_freq
    }

    pub(crate) fn raw_term(&self) -> Option<(u32, &[u8])> {
        self.valid.then_some((self.field, self.text.as_slice()))
    }
}

/// Reads `.tii` into memory and resolves terms to their postings via a
/// binary search plus a bounded dictionary scan.
pub struct TermInfosReader {
    tis: IndexInput,
    field_infos: Arc<FieldInfos>,
    index: Vec<IndexEntry>,
    term_count: u64,
    pub index_interval: u32,
    pub skip_interval: u32,
}

impl TermInfosReader {
    /// `index_divisor` subsamples the loaded index; `-1` loads none, at the
    /// cost of full scans from the dictionary start.
    pub fn open(
        tis: IndexInput,
        mut tii: IndexInput,
        field_infos: Arc<FieldInfos>,
        index_divisor: i32,
    ) -> SearchResult<Self> {
        let mut check = tis.clone();
        check.seek(0)?;
        let format = check.read_i32()?;
        if format != FORMAT {
            return Err(SearchError::corrupt(format!(
                "unknown term dictionary format {format} in {}",
                check.name()
            )));
        }
        let term_count = check.read_u64()?;
        let index_interval = check.read_u32()?;
        let skip_interval = check.read_u32()?;
        let _max_levels = check.read_u32()?;

        let mut index = Vec::new();
        if index_divisor != -1 {
            tii.seek(0)?;
            let tii_format = tii.read_i32()?;
            if tii_format != FORMAT {
                return Err(SearchError::corrupt(format!(
                    "unknown term index format {tii_format} in {}",
                    tii.name()
                )));
            }
            let index_count = tii.read_u64()?;
            tii.seek(HEADER_LEN)?;
            let mut text: Vec<u8> = Vec::new();
            let mut info = TermInfo::default();
            let mut tis_pointer = HEADER_LEN;
            for ordinal in 0..index_count {
                let prefix = tii.read_vint()? as usize;
                let suffix_len = tii.read_vint()? as usize;
                text.truncate(prefix);
                let mut suffix = vec![0u8; suffix_len];
                tii.read_bytes(&mut suffix)?;
                text.extend_from_slice(&suffix);
                let field = tii.read_vint()?;
                let doc_freq = tii.read_vint()?;
                let freq_pointer = info.freq_pointer + tii.read_vlong()?;
                let prox_pointer = info.prox_pointer + tii.read_vlong()?;
                let skip_delta = tii.read_vlong()?;
                info = TermInfo {
                    doc_freq,
                    freq_pointer,
                    prox_pointer,
                    skip_offset: freq_pointer + skip_delta,
                };
                tis_pointer += tii.read_vlong()?;
                if ordinal % index_divisor as u64 == 0 {
                    index.push(IndexEntry {
                        field,
                        text: text.clone(),
                        info,
                        tis_pointer,
                        ordinal: ordinal * index_interval as u64,
                    });
                }
            }
        }
        Ok(Self {
            tis,
            field_infos,
            index,
            term_count,
            index_interval,
            skip_interval,
        })
    }

    pub fn term_count(&self) -> u64 {
        self.term_count
    }

    /// Enum over every term, positioned before the first.
    pub fn terms(&self) -> TermEnum {
        TermEnum::at_start(
            self.tis.clone(),
            Arc::clone(&self.field_infos),
            self.term_count,
        )
    }

    /// Enum positioned on the first term `>= target`; the current term is
    /// already valid unless the dictionary is exhausted.
    pub fn terms_from(&self, target: &Term) -> SearchResult<TermEnum> {
        self.scan_from(target)
    }

    fn scan_from(&self, target: &Term) -> SearchResult<TermEnum> {
        let mut cursor = match self.floor_entry(target) {
            Some(entry) => TermEnum::seeded(
                self.tis.clone(),
                Arc::clone(&self.field_infos),
                self.term_count,
                entry,
            )?,
            None => {
                let mut cursor = TermEnum::at_start(
                    self.tis.clone(),
                    Arc::clone(&self.field_infos),
                    self.term_count,
                );
                if !cursor.next()? {
                    return Ok(cursor);
                }
                cursor
            }
        };
        loop {
            let ordering = match cursor.raw_term() {
                Some((field, text)) => self.compare_to_target(field, text, target),
                None => break,
            };
            if ordering != Ordering::Less {
                break;
            }
            if !cursor.next()? {
                break;
            }
        }
        Ok(cursor)
    }

    /// Exact lookup.
    pub fn get(&self, target: &Term) -> SearchResult<Option<TermInfo>> {
        let cursor = self.scan_from(target)?;
        match cursor.raw_term() {
            Some((field, text))
                if self.compare_to_target(field, text, target) == Ordering::Equal =>
            {
                Ok(cursor.term_info())
            }
            _ => Ok(None),
        }
    }

    pub fn doc_freq(&self, target: &Term) -> SearchResult<u32> {
        Ok(self.get(target)?.map(|info| info.doc_freq).unwrap_or(0))
    }

    fn compare_to_target(&self, field: u32, text: &[u8], target: &Term) -> Ordering {
        let name = self.field_infos.name_of(field).unwrap_or("");
        name.cmp(target.field.as_str())
            .then_with(|| text.cmp(target.text.as_bytes()))
    }

    /// Greatest index entry whose term is `<= target`.
    fn floor_entry(&self, target: &Term) -> Option<&IndexEntry> {
        if self.index.is_empty() {
            return None;
        }
        let mut lo = 0usize;
        let mut hi = self.index.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let entry = &self.index[mid];
            match self.compare_to_target(entry.field, &entry.text, target) {
                Ordering::Greater => hi = mid,
                _ => lo = mid + 1,
            }
        }
        if lo == 0 {
            None
        } else {
            Some(&self.index[lo - 1])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Directory, RamDirectory};
    use crate::document::FieldOptions;

    fn field_infos() -> Arc<FieldInfos> {
        let mut infos = FieldInfos::new();
        let indexed = FieldOptions {
            indexed: true,
            tokenized: true,
            ..Default::default()
        };
        infos.add("body", &indexed);
        infos.add("title", &indexed);
        Arc::new(infos)
    }

    fn write_terms(dir: &dyn Directory, terms: &[(u32, &str)], interval: u32) -> Arc<FieldInfos> {
        let infos = field_infos();
        let tis = dir.create_output("_0.tis").unwrap();
        let tii = dir.create_output("_0.tii").unwrap();
        let mut writer = TermInfosWriter::new(tis, tii, Arc::clone(&infos), interval).unwrap();
        for (ordinal, (field, text)) in terms.iter().enumerate() {
            let info = TermInfo {
                doc_freq: ordinal as u32 + 1,
                freq_pointer: ordinal as u64 * 7,
                prox_pointer: ordinal as u64 * 11,
                skip_offset: ordinal as u64 * 7 + 3,
            };
            writer.add(*field, text.as_bytes(), &info).unwrap();
        }
        writer.close().unwrap();
        infos
    }

    fn open_reader(dir: &dyn Directory, infos: Arc<FieldInfos>, divisor: i32) -> TermInfosReader {
        let tis = dir.open_input("_0.tis").unwrap();
        let tii = dir.open_input("_0.tii").unwrap();
        TermInfosReader::open(tis, tii, infos, divisor).unwrap()
    }

    #[test]
    fn enum_reproduces_order() {
        let dir = RamDirectory::new();
        // field 0 is "body", field 1 is "title": already name-ordered
        let terms = [(0u32, "apple"), (0, "apricot"), (0, "banana"), (1, "zebra")];
        let infos = write_terms(dir.as_ref(), &terms, 2);
        let reader = open_reader(dir.as_ref(), infos, 1);
        assert_eq!(reader.term_count(), 4);

        let mut cursor = reader.terms();
        let mut seen = Vec::new();
        while cursor.next().unwrap() {
            seen.push(cursor.term().unwrap());
        }
        assert_eq!(
            seen,
            vec![
                Term::new("body", "apple"),
                Term::new("body", "apricot"),
                Term::new("body", "banana"),
                Term::new("title", "zebra"),
            ]
        );
    }

    #[test]
    fn exact_and_missing_lookups() {
        let dir = RamDirectory::new();
        let terms: Vec<(u32, String)> = (0..500).map(|i| (0u32, format!("t{i:04}"))).collect();
        let refs: Vec<(u32, &str)> = terms.iter().map(|(f, t)| (*f, t.as_str())).collect();
        let infos = write_terms(dir.as_ref(), &refs, 16);
        let reader = open_reader(dir.as_ref(), infos, 1);

        let info = reader.get(&Term::new("body", "t0123")).unwrap().unwrap();
        assert_eq!(info.doc_freq, 124);
        assert_eq!(info.freq_pointer, 123 * 7);
        assert_eq!(info.prox_pointer, 123 * 11);
        assert_eq!(info.skip_offset, 123 * 7 + 3);

        assert!(reader.get(&Term::new("body", "t0123x")).unwrap().is_none());
        assert!(reader.get(&Term::new("none", "t0123")).unwrap().is_none());
        assert_eq!(reader.doc_freq(&Term::new("body", "t0499")).unwrap(), 500);
    }

    #[test]
    fn divisor_and_no_index_still_resolve() {
        let dir = RamDirectory::new();
        let terms: Vec<(u32, String)> = (0..200).map(|i| (0u32, format!("w{i:03}"))).collect();
        let refs: Vec<(u32, &str)> = terms.iter().map(|(f, t)| (*f, t.as_str())).collect();
        let infos = write_terms(dir.as_ref(), &refs, 8);

        for divisor in [2, 4, -1] {
            let reader = open_reader(dir.as_ref(), Arc::clone(&infos), divisor);
            let info = reader.get(&Term::new("body", "w150")).unwrap().unwrap();
            assert_eq!(info.doc_freq, 151);
        }
    }

    #[test]
    fn terms_from_positions_at_ceiling() {
        let dir = RamDirectory::new();
        let terms = [(0u32, "alpha"), (0, "gamma"), (0, "omega")];
        let infos = write_terms(dir.as_ref(), &terms, 128);
        let reader = open_reader(dir.as_ref(), infos, 1);

        let cursor = reader.terms_from(&Term::new("body", "beta")).unwrap();
        assert_eq!(cursor.term(), Some(Term::new("body", "gamma")));

        let cursor = reader.terms_from(&Term::new("body", "zzz")).unwrap();
        assert_eq!(cursor.term(), None);
    }

    #[test]
    fn out_of_order_terms_rejected() {
        let dir = RamDirectory::new();
        let infos = field_infos();
        let tis = dir.create_output("_0.tis").unwrap();
        let tii = dir.create_output("_0.tii").unwrap();
        let mut writer = TermInfosWriter::new(tis, tii, infos, 128).unwrap();
        writer
            .add(0, b"beta", &TermInfo::default())
            .unwrap();
        assert!(writer.add(0, b"alpha", &TermInfo::default()).is_err());
    }
}
