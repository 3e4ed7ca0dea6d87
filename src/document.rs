use std::cmp::Ordering;

use bytes::Bytes;

/// A (field name, term text) pair. Terms order primarily by field name,
/// secondarily by byte-wise text, and the term dictionary is sorted in
/// exactly this order.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Term {
    pub field: String,
    pub text: String,
}

impl Term {
    pub fn new<F: Into<String>, T: Into<String>>(field: F, text: T) -> Self {
        Self {
            field: field.into(),
            text: text.into(),
        }
    }
}

impl Ord for Term {
    fn cmp(&self, other: &Self) -> Ordering {
        self.field
            .cmp(&other.field)
            .then_with(|| self.text.as_bytes().cmp(other.text.as_bytes()))
    }
}

impl PartialOrd for Term {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sortable text encoding for numeric terms: the sign bit is flipped so the
/// byte-wise term order matches the numeric order, then hex with fixed
/// width. Range queries over numeric fields reduce to term range scans.
pub fn encode_i64_term(value: i64) -> String {
    format!("{:016x}", (value as u64) ^ (1u64 << 63))
}

/// Inverse of [`encode_i64_term`]; `None` for malformed terms.
pub fn decode_i64_term(text: &str) -> Option<i64> {
    let raw = u64::from_str_radix(text, 16).ok()?;
    if text.len() != 16 {
        return None;
    }
    Some((raw ^ (1u64 << 63)) as i64)
}

pub fn encode_f64_term(value: f64) -> String {
    let bits = value.to_bits() as i64;
    let sortable = if bits < 0 { !bits } else { bits ^ i64::MIN };
    format!("{:016x}", sortable as u64)
}

/// Inverse of [`encode_f64_term`]; `None` for malformed terms.
pub fn decode_f64_term(text: &str) -> Option<f64> {
    if text.len() != 16 {
        return None;
    }
    let sortable = u64::from_str_radix(text, 16).ok()? as i64;
    let bits = if sortable < 0 {
        sortable ^ i64::MIN
    } else {
        !sortable
    };
    Some(f64::from_bits(bits as u64))
}

#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Text(String),
    Binary(Bytes),
    Int(i64),
    Float(f64),
}

impl FieldValue {
    /// The token source for indexing. Numeric values index their sortable
    /// encoding as a single term.
    pub fn index_text(&self) -> Option<String> {
        match self {
            FieldValue::Text(text) => Some(text.clone()),
            FieldValue::Int(v) => Some(encode_i64_term(*v)),
            FieldValue::Float(v) => Some(encode_f64_term(*v)),
            FieldValue::Binary(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

/// How a field participates in the index. The flags here are the union
/// recorded per field in the segment's field schema.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FieldOptions {
    pub indexed: bool,
    pub tokenized: bool,
    pub stored: bool,
    pub store_term_vector: bool,
    pub vector_positions: bool,
    pub vector_offsets: bool,
    pub omit_norms: bool,
    /// Index docs only: no term frequencies, no positions.
    pub omit_term_freq_and_positions: bool,
    /// Compress the stored value.
    pub compressed: bool,
}

#[derive(Clone, Debug)]
pub struct Field {
    pub name: String,
    pub value: FieldValue,
    pub options: FieldOptions,
    pub boost: f32,
}

impl Field {
    pub fn new<N: Into<String>>(name: N, value: FieldValue, options: FieldOptions) -> Self {
        Self {
            name: name.into(),
            value,
            options,
            boost: 1.0,
        }
    }

    /// Indexed, tokenized and stored: the common body-text field.
    pub fn text<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Self::new(
            name,
            FieldValue::Text(value.into()),
            FieldOptions {
                indexed: true,
                tokenized: true,
                stored: true,
                ..Default::default()
            },
        )
    }

    /// Indexed and tokenized but not stored.
    pub fn unstored_text<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Self::new(
            name,
            FieldValue::Text(value.into()),
            FieldOptions {
                indexed: true,
                tokenized: true,
                ..Default::default()
            },
        )
    }

    /// Indexed as a single untokenized term and stored; identifiers.
    pub fn keyword<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Self::new(
            name,
            FieldValue::Text(value.into()),
            FieldOptions {
                indexed: true,
                stored: true,
                omit_norms: true,
                ..Default::default()
            },
        )
    }

    /// Stored only, never indexed.
    pub fn stored<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Self::new(
            name,
            FieldValue::Text(value.into()),
            FieldOptions {
                stored: true,
                ..Default::default()
            },
        )
    }

    pub fn binary<N: Into<String>>(name: N, value: Bytes) -> Self {
        Self::new(
            name,
            FieldValue::Binary(value),
            FieldOptions {
                stored: true,
                ..Default::default()
            },
        )
    }

    pub fn int<N: Into<String>>(name: N, value: i64) -> Self {
        Self::new(
            name,
            FieldValue::Int(value),
            FieldOptions {
                indexed: true,
                stored: true,
                omit_norms: true,
                omit_term_freq_and_positions: true,
                ..Default::default()
            },
        )
    }

    pub fn with_term_vector(mut self, positions: bool, offsets: bool) -> Self {
        self.options.store_term_vector = true;
        self.options.vector_positions = positions;
        self.options.vector_offsets = offsets;
        self
    }

    pub fn with_boost(mut self, boost: f32) -> Self {
        self.boost = boost;
        self
    }

    pub fn compressed(mut self) -> Self {
        self.options.compressed = true;
        self
    }
}

/// An ordered list of fields. The same name may appear several times; all
/// occurrences are indexed and stored in order.
#[derive(Clone, Debug)]
pub struct Document {
    pub fields: Vec<Field>,
    pub boost: f32,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        Self {
            fields: Vec::new(),
            boost: 1.0,
        }
    }

    pub fn add(&mut self, field: Field) -> &mut Self {
        self.fields.push(field);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Field> {
        self.fields.iter().filter(move |f| f.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_order_is_field_then_text() {
        let mut terms = vec![
            Term::new("b", "a"),
            Term::new("a", "z"),
            Term::new("a", "a"),
        ];
        terms.sort();
        assert_eq!(terms[0], Term::new("a", "a"));
        assert_eq!(terms[1], Term::new("a", "z"));
        assert_eq!(terms[2], Term::new("b", "a"));
    }

    #[test]
    fn numeric_encoding_sorts() {
        let values = [i64::MIN, -5, -1, 0, 1, 42, i64::MAX];
        let encoded: Vec<String> = values.iter().map(|v| encode_i64_term(*v)).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn float_encoding_sorts() {
        let values = [f64::NEG_INFINITY, -2.5, -0.0, 0.0, 1.5, f64::INFINITY];
        let encoded: Vec<String> = values.iter().map(|v| encode_f64_term(*v)).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }
}
