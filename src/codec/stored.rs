use bytes::Bytes;

use crate::codec::field_infos::FieldInfos;
use crate::directory::{IndexInput, IndexOutput};
use crate::document::{Document, Field, FieldOptions, FieldValue};
use crate::error::{SearchError, SearchResult};
use crate::util::DocId;

const FLAG_BINARY: u8 = 0x01;
const FLAG_COMPRESSED: u8 = 0x02;
const FLAG_INT: u8 = 0x04;
const FLAG_FLOAT: u8 = 0x08;

const ZSTD_LEVEL: i32 = 2;

/// Per-field stored-value load strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectorResult {
    /// Materialize the value now.
    Load,
    /// Keep a handle, read the bytes on first access.
    LazyLoad,
    /// Materialize and stop reading further fields of the doc.
    LoadAndBreak,
    /// Record only the value's byte size.
    Size,
    /// Record the size and stop.
    SizeAndBreak,
    /// Skip this field entirely.
    NoLoad,
}

pub trait FieldSelector: Send + Sync {
    fn accept(&self, field: &str) -> SelectorResult;
}

/// Loads every stored field.
pub struct LoadAll;

impl FieldSelector for LoadAll {
    fn accept(&self, _field: &str) -> SelectorResult {
        SelectorResult::Load
    }
}

/// Writes `.fdx` (one u64 pointer per document) and `.fdt` (the stored
/// field data).
pub struct StoredFieldsWriter {
    index: Box<dyn IndexOutput>,
    data: Box<dyn IndexOutput>,
    doc_count: u32,
}

impl StoredFieldsWriter {
    pub fn new(index: Box<dyn IndexOutput>, data: Box<dyn IndexOutput>) -> Self {
        Self {
            index,
            data,
            doc_count: 0,
        }
    }

    /// Appends one document's stored fields; must be called once per doc in
    /// doc-id order, including docs with no stored fields.
    pub fn add_document(&mut self, fields: &[(u32, &Field)]) -> SearchResult<()> {
        self.index.write_u64(self.data.file_pointer())?;
        self.data.write_vint(fields.len() as u32)?;
        for (number, field) in fields {
            self.data.write_vint(*number)?;
            let mut flags = 0u8;
            let raw: Vec<u8>;
            match &field.value {
                FieldValue::Text(text) => raw = text.as_bytes().to_vec(),
                FieldValue::Binary(bytes) => {
                    flags |= FLAG_BINARY;
                    raw = bytes.to_vec();
                }
                FieldValue::Int(v) => {
                    flags |= FLAG_INT;
                    raw = v.to_be_bytes().to_vec();
                }
                FieldValue::Float(v) => {
                    flags |= FLAG_FLOAT;
                    raw = v.to_bits().to_be_bytes().to_vec();
                }
            }
            let payload = if field.options.compressed {
                flags |= FLAG_COMPRESSED;
                zstd::stream::encode_all(raw.as_slice(), ZSTD_LEVEL)?
            } else {
                raw
            };
            self.data.write_byte(flags)?;
            self.data.write_vint(payload.len() as u32)?;
            self.data.write_bytes(&payload)?;
        }
        self.doc_count += 1;
        Ok(())
    }

    /// Appends a raw document copied verbatim from another segment.
    pub fn add_raw_document(&mut self, bytes: &[u8]) -> SearchResult<()> {
        self.index.write_u64(self.data.file_pointer())?;
        self.data.write_bytes(bytes)?;
        self.doc_count += 1;
        Ok(())
    }

    pub fn doc_count(&self) -> u32 {
        self.doc_count
    }

    pub fn close(&mut self) -> SearchResult<()> {
        self.index.close()?;
        self.data.close()
    }
}

/// Deferred stored value: a cheap handle into `.fdt`, decoded on demand.
#[derive(Clone)]
pub struct LazyValue {
    data: IndexInput,
    offset: u64,
    length: u32,
    flags: u8,
}

impl LazyValue {
    pub fn load(&self) -> SearchResult<FieldValue> {
        let mut input = self.data.clone();
        input.seek(self.offset)?;
        let payload = input.read_vec(self.length as usize)?;
        decode_value(self.flags, payload)
    }
}

fn decode_value(flags: u8, payload: Vec<u8>) -> SearchResult<FieldValue> {
    let raw = if flags & FLAG_COMPRESSED != 0 {
        zstd::stream::decode_all(payload.as_slice())?
    } else {
        payload
    };
    if flags & FLAG_INT != 0 {
        if raw.len() != 8 {
            return Err(SearchError::corrupt("stored int is not 8 bytes"));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&raw);
        return Ok(FieldValue::Int(i64::from_be_bytes(buf)));
    }
    if flags & FLAG_FLOAT != 0 {
        if raw.len() != 8 {
            return Err(SearchError::corrupt("stored float is not 8 bytes"));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&raw);
        return Ok(FieldValue::Float(f64::from_bits(u64::from_be_bytes(buf))));
    }
    if flags & FLAG_BINARY != 0 {
        return Ok(FieldValue::Binary(Bytes::from(raw)));
    }
    String::from_utf8(raw)
        .map(FieldValue::Text)
        .map_err(|_| SearchError::corrupt("stored text is not valid utf-8"))
}

/// One field materialized by the reader: eager, lazy, or size-only.
pub enum StoredField {
    Value(Field),
    Lazy { name: String, value: LazyValue },
    Size { name: String, size: u32 },
}

/// Random-access reader over `.fdx`/`.fdt`.
pub struct StoredFieldsReader {
    index: IndexInput,
    data: IndexInput,
    max_doc: u32,
}

impl StoredFieldsReader {
    pub fn open(index: IndexInput, data: IndexInput, max_doc: u32) -> SearchResult<Self> {
        let expected = max_doc as u64 * 8;
        if index.len() != expected {
            return Err(SearchError::corrupt(format!(
                "stored index {} has length {}, expected {expected}",
                index.name(),
                index.len()
            )));
        }
        Ok(Self {
            index,
            data,
            max_doc,
        })
    }

    /// Raw `.fdt` bytes of one document, for verbatim merge copies.
    pub fn raw_document(&self, doc: DocId) -> SearchResult<Vec<u8>> {
        let mut index = self.index.clone();
        index.seek(doc as u64 * 8)?;
        let start = index.read_u64()?;
        let end = if (doc as u32) + 1 < self.max_doc {
            index.read_u64()?
        } else {
            self.data.len()
        };
        let mut data = self.data.clone();
        data.seek(start)?;
        data.read_vec((end - start) as usize)
    }

    pub fn document(
        &self,
        doc: DocId,
        field_infos: &FieldInfos,
        selector: &dyn FieldSelector,
    ) -> SearchResult<Vec<StoredField>> {
        if doc < 0 || doc as u32 >= self.max_doc {
            return Err(SearchError::IllegalArgument(format!(
                "doc {doc} out of bounds (max_doc {})",
                self.max_doc
            )));
        }
        let mut index = self.index.clone();
        index.seek(doc as u64 * 8)?;
        let start = index.read_u64()?;
        let mut data = self.data.clone();
        data.seek(start)?;

        let field_count = data.read_vint()?;
        let mut fields = Vec::new();
        for _ in 0..field_count {
            let number = data.read_vint()?;
            let flags = data.read_byte()?;
            let length = data.read_vint()?;
            let name = field_infos
                .name_of(number)
                .ok_or_else(|| {
                    SearchError::corrupt(format!("stored field references unknown field {number}"))
                })?
                .to_string();
            let offset = data.position();
            let decision = selector.accept(&name);
            match decision {
                SelectorResult::NoLoad => {
                    data.seek(offset + length as u64)?;
                }
                SelectorResult::Load | SelectorResult::LoadAndBreak => {
                    let payload = data.read_vec(length as usize)?;
                    let value = decode_value(flags, payload)?;
                    fields.push(StoredField::Value(Field::new(
                        name,
                        value,
                        FieldOptions {
                            stored: true,
                            compressed: flags & FLAG_COMPRESSED != 0,
                            ..Default::default()
                        },
                    )));
                    if decision == SelectorResult::LoadAndBreak {
                        break;
                    }
                }
                SelectorResult::LazyLoad => {
                    fields.push(StoredField::Lazy {
                        name,
                        value: LazyValue {
                            data: self.data.clone(),
                            offset,
                            length,
                            flags,
                        },
                    });
                    data.seek(offset + length as u64)?;
                }
                SelectorResult::Size | SelectorResult::SizeAndBreak => {
                    fields.push(StoredField::Size { name, size: length });
                    data.seek(offset + length as u64)?;
                    if decision == SelectorResult::SizeAndBreak {
                        break;
                    }
                }
            }
        }
        Ok(fields)
    }

    /// Convenience: fully-loaded document.
    pub fn load_document(&self, doc: DocId, field_infos: &FieldInfos) -> SearchResult<Document> {
        let mut document = Document::new();
        for stored in self.document(doc, field_infos, &LoadAll)? {
            if let StoredField::Value(field) = stored {
                document.add(field);
            }
        }
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Directory, RamDirectory};

    fn build() -> (std::sync::Arc<RamDirectory>, FieldInfos) {
        let dir = RamDirectory::new();
        let mut infos = FieldInfos::new();
        let stored = FieldOptions {
            stored: true,
            ..Default::default()
        };
        let title = infos.add("title", &stored);
        let body = infos.add("body", &stored);
        let num = infos.add("num", &stored);

        let index = dir.create_output("_0.fdx").unwrap();
        let data = dir.create_output("_0.fdt").unwrap();
        let mut writer = StoredFieldsWriter::new(index, data);

        let title_field = Field::stored("title", "doc zero");
        let body_field = Field::stored("body", "lorem ipsum dolor").compressed();
        let num_field = Field::new(
            "num",
            FieldValue::Int(42),
            FieldOptions {
                stored: true,
                ..Default::default()
            },
        );
        writer
            .add_document(&[(title, &title_field), (body, &body_field), (num, &num_field)])
            .unwrap();

        let title2 = Field::stored("title", "doc one");
        writer.add_document(&[(title, &title2)]).unwrap();
        writer.close().unwrap();
        (dir, infos)
    }

    fn reader(dir: &RamDirectory) -> StoredFieldsReader {
        StoredFieldsReader::open(
            dir.open_input("_0.fdx").unwrap(),
            dir.open_input("_0.fdt").unwrap(),
            2,
        )
        .unwrap()
    }

    #[test]
    fn load_all_round_trip() {
        let (dir, infos) = build();
        let reader = reader(&dir);
        let doc = reader.load_document(0, &infos).unwrap();
        assert_eq!(doc.get("title").unwrap().value.as_text(), Some("doc zero"));
        assert_eq!(
            doc.get("body").unwrap().value.as_text(),
            Some("lorem ipsum dolor")
        );
        assert_eq!(doc.get("num").unwrap().value.as_int(), Some(42));

        let doc1 = reader.load_document(1, &infos).unwrap();
        assert_eq!(doc1.fields.len(), 1);
        assert_eq!(doc1.get("title").unwrap().value.as_text(), Some("doc one"));
    }

    #[test]
    fn lazy_and_size_selectors() {
        let (dir, infos) = build();
        let reader = reader(&dir);

        struct BodyLazy;
        impl FieldSelector for BodyLazy {
            fn accept(&self, field: &str) -> SelectorResult {
                match field {
                    "body" => SelectorResult::LazyLoad,
                    "num" => SelectorResult::Size,
                    _ => SelectorResult::Load,
                }
            }
        }
        let fields = reader.document(0, &infos, &BodyLazy).unwrap();
        assert_eq!(fields.len(), 3);
        match &fields[1] {
            StoredField::Lazy { name, value } => {
                assert_eq!(name, "body");
                assert_eq!(
                    value.load().unwrap(),
                    FieldValue::Text("lorem ipsum dolor".to_string())
                );
            }
            _ => panic!("expected lazy body"),
        }
        match &fields[2] {
            StoredField::Size { name, size } => {
                assert_eq!(name, "num");
                assert_eq!(*size, 8);
            }
            _ => panic!("expected size-only num"),
        }
    }

    #[test]
    fn load_and_break_stops_early() {
        let (dir, infos) = build();
        let reader = reader(&dir);

        struct TitleOnly;
        impl FieldSelector for TitleOnly {
            fn accept(&self, field: &str) -> SelectorResult {
                if field == "title" {
                    SelectorResult::LoadAndBreak
                } else {
                    SelectorResult::NoLoad
                }
            }
        }
        let fields = reader.document(0, &infos, &TitleOnly).unwrap();
        assert_eq!(fields.len(), 1);
    }

    #[test]
    fn raw_copy_matches() {
        let (dir, infos) = build();
        let reader = reader(&dir);
        let raw0 = reader.raw_document(0).unwrap();
        let raw1 = reader.raw_document(1).unwrap();

        let index = dir.create_output("_m.fdx").unwrap();
        let data = dir.create_output("_m.fdt").unwrap();
        let mut writer = StoredFieldsWriter::new(index, data);
        writer.add_raw_document(&raw1).unwrap();
        writer.add_raw_document(&raw0).unwrap();
        writer.close().unwrap();

        let merged = StoredFieldsReader::open(
            dir.open_input("_m.fdx").unwrap(),
            dir.open_input("_m.fdt").unwrap(),
            2,
        )
        .unwrap();
        let doc = merged.load_document(0, &infos).unwrap();
        assert_eq!(doc.get("title").unwrap().value.as_text(), Some("doc one"));
        let doc = merged.load_document(1, &infos).unwrap();
        assert_eq!(doc.get("num").unwrap().value.as_int(), Some(42));
    }
}
