mod bits;
mod pool;

pub use bits::BitVector;
pub use pool::{BytePool, PoolSlice};

/// Dense, 0-based document number, unique within one segment. A composite
/// reader addresses documents as `doc_base + doc`.
pub type DocId = i32;

/// Iterator sentinel: no further matching documents.
pub const NO_MORE_DOCS: DocId = i32::MAX;
