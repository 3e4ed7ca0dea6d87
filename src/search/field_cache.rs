use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, OnceLock};

use hashbrown::HashMap;

use crate::document::{decode_f64_term, decode_i64_term, Term};
use crate::error::SearchResult;
use crate::index::reader::SegmentReader;
use crate::util::{BitVector, DocId};

/// How term text of a field is parsed into a primitive array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Parser {
    Int,
    Float,
    StringIndex,
}

/// Dense per-doc values for one (field, parser) pair.
pub enum CachedArray {
    /// Missing docs hold 0.
    Ints(Vec<i64>),
    /// Missing docs hold 0.0.
    Floats(Vec<f64>),
    /// `ords[doc]` indexes into the sorted `values`; -1 for missing docs.
    StringIndex { ords: Vec<i32>, values: Vec<String> },
}

struct CacheSlot {
    creation: Mutex<()>,
    value: OnceLock<Arc<CachedArray>>,
}

/// Per-leaf lazily built value cache. The first access scans the field's
/// postings and fills the array; later calls are lock-free. Entries die
/// with the segment core, which is the reader-finished notification in
/// this crate.
pub struct FieldCache {
    entries: Mutex<HashMap<(String, Parser), Arc<CacheSlot>>>,
}

impl FieldCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(
        &self,
        reader: &SegmentReader,
        field: &str,
        parser: Parser,
    ) -> SearchResult<Arc<CachedArray>> {
        let slot = {
            let mut entries = self.entries.lock().unwrap();
            Arc::clone(
                entries
                    .entry((field.to_string(), parser))
                    .or_insert_with(|| {
                        Arc::new(CacheSlot {
                            creation: Mutex::new(()),
                            value: OnceLock::new(),
                        })
                    }),
            )
        };
        if let Some(value) = slot.value.get() {
            return Ok(Arc::clone(value));
        }
        // concurrent builders of the same entry serialize here; losers
        // find the value present and return it
        let _creating = slot.creation.lock().unwrap();
        if let Some(value) = slot.value.get() {
            return Ok(Arc::clone(value));
        }
        let built = Arc::new(build_array(reader, field, parser)?);
        let _ = slot.value.set(Arc::clone(&built));
        Ok(built)
    }
}

impl Default for FieldCache {
    fn default() -> Self {
        Self::new()
    }
}

fn build_array(
    reader: &SegmentReader,
    field: &str,
    parser: Parser,
) -> SearchResult<CachedArray> {
    let max_doc = reader.max_doc() as usize;
    let mut ints = vec![0i64; max_doc];
    let mut floats = vec![0f64; max_doc];
    let mut ords = vec![-1i32; max_doc];
    let mut values: Vec<String> = Vec::new();

    let start = Term::new(field, "");
    let mut cursor = reader.terms_from(&start)?;
    while let Some(term) = cursor.term() {
        if term.field != field {
            break;
        }
        let ord = match parser {
            Parser::StringIndex => {
                values.push(term.text.clone());
                values.len() as i32 - 1
            }
            _ => -1,
        };
        let int_value = matches!(parser, Parser::Int)
            .then(|| decode_i64_term(&term.text))
            .flatten();
        let float_value = matches!(parser, Parser::Float)
            .then(|| decode_f64_term(&term.text))
            .flatten();
        if let Some(mut docs) = reader.term_docs(&term)? {
            while docs.next()? {
                let doc = docs.doc() as usize;
                match parser {
                    Parser::Int => {
                        if let Some(v) = int_value {
                            ints[doc] = v;
                        }
                    }
                    Parser::Float => {
                        if let Some(v) = float_value {
                            floats[doc] = v;
                        }
                    }
                    Parser::StringIndex => ords[doc] = ord,
                }
            }
        }
        if !cursor.next()? {
            break;
        }
    }
    Ok(match parser {
        Parser::Int => CachedArray::Ints(ints),
        Parser::Float => CachedArray::Floats(floats),
        Parser::StringIndex => CachedArray::StringIndex { ords, values },
    })
}

/// Non-scoring range filter over the cached arrays: after the one-time
/// build, membership is a constant-time comparison per doc.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldCacheRangeFilter {
    Int {
        field: String,
        lower: Option<i64>,
        upper: Option<i64>,
        include_lower: bool,
        include_upper: bool,
    },
    Float {
        field: String,
        lower: Option<f64>,
        upper: Option<f64>,
        include_lower: bool,
        include_upper: bool,
    },
    Str {
        field: String,
        lower: Option<String>,
        upper: Option<String>,
        include_lower: bool,
        include_upper: bool,
    },
}

impl Hash for FieldCacheRangeFilter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            FieldCacheRangeFilter::Int {
                field,
                lower,
                upper,
                include_lower,
                include_upper,
            } => {
                field.hash(state);
                lower.hash(state);
                upper.hash(state);
                include_lower.hash(state);
                include_upper.hash(state);
            }
            FieldCacheRangeFilter::Float {
                field,
                lower,
                upper,
                include_lower,
                include_upper,
            } => {
                field.hash(state);
                lower.map(f64::to_bits).hash(state);
                upper.map(f64::to_bits).hash(state);
                include_lower.hash(state);
                include_upper.hash(state);
            }
            FieldCacheRangeFilter::Str {
                field,
                lower,
                upper,
                include_lower,
                include_upper,
            } => {
                field.hash(state);
                lower.hash(state);
                upper.hash(state);
                include_lower.hash(state);
                include_upper.hash(state);
            }
        }
    }
}

fn in_range<T: PartialOrd>(
    value: &T,
    lower: &Option<T>,
    upper: &Option<T>,
    include_lower: bool,
    include_upper: bool,
) -> bool {
    if let Some(lower) = lower {
        if value < lower || (!include_lower && value == lower) {
            return false;
        }
    }
    if let Some(upper) = upper {
        if value > upper || (!include_upper && value == upper) {
            return false;
        }
    }
    true
}

impl FieldCacheRangeFilter {
    /// Matching docs of one leaf as a bitset. For the string variant,
    /// docs missing the field never match; numeric variants read missing
    /// docs as 0.
    pub fn doc_id_set(&self, reader: &SegmentReader) -> SearchResult<BitVector> {
        let mut bits = BitVector::new(reader.max_doc());
        match self {
            FieldCacheRangeFilter::Int {
                field,
                lower,
                upper,
                include_lower,
                include_upper,
            } => {
                let array = reader.field_cache().get(reader, field, Parser::Int)?;
                if let CachedArray::Ints(values) = array.as_ref() {
                    for (doc, value) in values.iter().enumerate() {
                        if in_range(value, lower, upper, *include_lower, *include_upper) {
                            bits.set(doc as DocId);
                        }
                    }
                }
            }
            FieldCacheRangeFilter::Float {
                field,
                lower,
                upper,
                include_lower,
                include_upper,
            } => {
                let array = reader.field_cache().get(reader, field, Parser::Float)?;
                if let CachedArray::Floats(values) = array.as_ref() {
                    for (doc, value) in values.iter().enumerate() {
                        if in_range(value, lower, upper, *include_lower, *include_upper) {
                            bits.set(doc as DocId);
                        }
                    }
                }
            }
            FieldCacheRangeFilter::Str {
                field,
                lower,
                upper,
                include_lower,
                include_upper,
            } => {
                let array = reader
                    .field_cache()
                    .get(reader, field, Parser::StringIndex)?;
                if let CachedArray::StringIndex { ords, values } = array.as_ref() {
                    // resolve the bounds to an ord window once
                    let lower_ord = match lower {
                        None => 0i32,
                        Some(bound) => match values.binary_search(bound) {
                            Ok(i) if *include_lower => i as i32,
                            Ok(i) => i as i32 + 1,
                            Err(i) => i as i32,
                        },
                    };
                    let upper_ord = match upper {
                        None => values.len() as i32 - 1,
                        Some(bound) => match values.binary_search(bound) {
                            Ok(i) if *include_upper => i as i32,
                            Ok(i) => i as i32 - 1,
                            Err(i) => i as i32 - 1,
                        },
                    };
                    for (doc, &ord) in ords.iter().enumerate() {
                        if ord >= lower_ord && ord <= upper_ord && ord >= 0 {
                            bits.set(doc as DocId);
                        }
                    }
                }
            }
        }
        Ok(bits)
    }
}
