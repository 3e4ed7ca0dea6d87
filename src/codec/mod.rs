pub mod compound;
pub mod field_infos;
pub mod norms;
pub mod postings;
pub mod skip;
pub mod stored;
pub mod terms;
pub mod vectors;

/// Logical extensions of the files making up one segment.
pub const FIELD_INFOS_EXT: &str = "fnm";
pub const TERM_DICT_EXT: &str = "tis";
pub const TERM_INDEX_EXT: &str = "tii";
pub const FREQ_EXT: &str = "frq";
pub const PROX_EXT: &str = "prx";
pub const NORMS_EXT: &str = "nrm";
pub const STORED_INDEX_EXT: &str = "fdx";
pub const STORED_DATA_EXT: &str = "fdt";
pub const VECTORS_INDEX_EXT: &str = "tvx";
pub const VECTORS_DOCS_EXT: &str = "tvd";
pub const VECTORS_FIELDS_EXT: &str = "tvf";
pub const COMPOUND_EXT: &str = "cfs";
pub const DELETES_EXT: &str = "del";

/// Extensions bundled into the compound file. Deletion bitmaps stay
/// outside: they are generational and written after the segment.
pub const COMPOUND_MEMBER_EXTS: &[&str] = &[
    FIELD_INFOS_EXT,
    TERM_DICT_EXT,
    TERM_INDEX_EXT,
    FREQ_EXT,
    PROX_EXT,
    NORMS_EXT,
    STORED_INDEX_EXT,
    STORED_DATA_EXT,
    VECTORS_INDEX_EXT,
    VECTORS_DOCS_EXT,
    VECTORS_FIELDS_EXT,
];

pub fn segment_file_name(segment: &str, ext: &str) -> String {
    format!("{segment}.{ext}")
}

/// Generational file name, e.g. `_3_2.del` for generation 2 of segment
/// `_3`'s deletion bitmap.
pub fn generation_file_name(segment: &str, ext: &str, generation: u64) -> String {
    format!("{segment}_{generation:x}.{ext}")
}

/// Docs are counted in "work units" between merge abort checks.
pub const ABORT_CHECK_INTERVAL: u64 = 10_000;
