use log::{debug, warn};

use crate::codec::{self, generation_file_name, segment_file_name, COMPOUND_MEMBER_EXTS};
use crate::directory::{Directory, IndexOutput, RamOutput};
use crate::error::{SearchError, SearchResult};

const FORMAT: i32 = -9;
const GEN_FORMAT: i32 = -2;

pub const SEGMENTS_PREFIX: &str = "segments";
pub const SEGMENTS_GEN: &str = "segments.gen";

pub fn segments_file_name(generation: u64) -> String {
    format!("{SEGMENTS_PREFIX}_{generation:x}")
}

/// Parses the generation out of a `segments_<hex>` name.
pub fn parse_generation(name: &str) -> Option<u64> {
    if name == SEGMENTS_GEN || !name.starts_with(SEGMENTS_PREFIX) {
        return None;
    }
    let suffix = name.strip_prefix(SEGMENTS_PREFIX)?.strip_prefix('_')?;
    u64::from_str_radix(suffix, 16).ok()
}

/// Descriptor of one immutable segment inside a commit.
#[derive(Clone, Debug)]
pub struct SegmentInfo {
    pub name: String,
    pub doc_count: u32,
    /// Generation of the deletion bitmap; `None` while no doc is deleted.
    pub del_gen: Option<u64>,
    /// Generation of the consolidated norms overlay, written when norms
    /// were updated after the segment.
    pub norm_gen: Option<u64>,
    pub use_compound: bool,
    /// Whether the segment wrote a `.nrm` file (some field carries norms).
    pub has_norms: bool,
    /// Whether the segment wrote term-vector files.
    pub has_vectors: bool,
    pub del_count: u32,
    /// Tool version, creation time, merge provenance.
    pub diagnostics: Vec<(String, String)>,
}

impl SegmentInfo {
    pub fn new(name: &str, doc_count: u32, use_compound: bool) -> Self {
        Self {
            name: name.to_string(),
            doc_count,
            del_gen: None,
            norm_gen: None,
            use_compound,
            has_norms: false,
            has_vectors: false,
            del_count: 0,
            diagnostics: Vec::new(),
        }
    }

    pub fn has_deletions(&self) -> bool {
        self.del_gen.is_some()
    }

    pub fn del_file_name(&self) -> Option<String> {
        self.del_gen
            .map(|gen| generation_file_name(&self.name, codec::DELETES_EXT, gen))
    }

    pub fn norms_overlay_name(&self) -> Option<String> {
        self.norm_gen
            .map(|gen| generation_file_name(&self.name, codec::NORMS_EXT, gen))
    }

    pub fn next_del_gen(&self) -> u64 {
        self.del_gen.map(|gen| gen + 1).unwrap_or(1)
    }

    pub fn next_norm_gen(&self) -> u64 {
        self.norm_gen.map(|gen| gen + 1).unwrap_or(1)
    }

    /// The files a freshly flushed (non-compound) segment consists of,
    /// before any deletion or norm generations.
    pub fn base_files(&self) -> Vec<String> {
        let mut files = Vec::new();
        for ext in COMPOUND_MEMBER_EXTS {
            match *ext {
                codec::NORMS_EXT if !self.has_norms => continue,
                codec::VECTORS_INDEX_EXT | codec::VECTORS_DOCS_EXT | codec::VECTORS_FIELDS_EXT
                    if !self.has_vectors =>
                {
                    continue
                }
                _ => files.push(segment_file_name(&self.name, ext)),
            }
        }
        files
    }

    /// Every file this segment references in the directory.
    pub fn files(&self) -> Vec<String> {
        let mut files = Vec::new();
        if self.use_compound {
            files.push(segment_file_name(&self.name, codec::COMPOUND_EXT));
        } else {
            files.extend(self.base_files());
        }
        if let Some(del) = self.del_file_name() {
            files.push(del);
        }
        if let Some(norms) = self.norms_overlay_name() {
            files.push(norms);
        }
        files
    }

    /// Live documents.
    pub fn num_docs(&self) -> u32 {
        self.doc_count - self.del_count
    }

    fn write(&self, out: &mut dyn IndexOutput) -> SearchResult<()> {
        out.write_string(&self.name)?;
        out.write_u32(self.doc_count)?;
        out.write_i64(self.del_gen.map(|g| g as i64).unwrap_or(-1))?;
        out.write_i64(self.norm_gen.map(|g| g as i64).unwrap_or(-1))?;
        out.write_byte(self.use_compound as u8)?;
        out.write_byte(self.has_norms as u8)?;
        out.write_byte(self.has_vectors as u8)?;
        // doc stores are never shared across segments here
        out.write_i32(-1)?;
        out.write_u32(self.del_count)?;
        out.write_string_map(&self.diagnostics)
    }

    fn read(input: &mut crate::directory::IndexInput) -> SearchResult<Self> {
        let name = input.read_string()?;
        let doc_count = input.read_u32()?;
        let del_gen = match input.read_i64()? {
            -1 => None,
            gen if gen >= 0 => Some(gen as u64),
            gen => {
                return Err(SearchError::corrupt(format!(
                    "invalid deletion generation {gen} for segment {name}"
                )))
            }
        };
        let norm_gen = match input.read_i64()? {
            -1 => None,
            gen if gen >= 0 => Some(gen as u64),
            gen => {
                return Err(SearchError::corrupt(format!(
                    "invalid norms generation {gen} for segment {name}"
                )))
            }
        };
        let use_compound = input.read_byte()? != 0;
        let has_norms = input.read_byte()? != 0;
        let has_vectors = input.read_byte()? != 0;
        let doc_store_offset = input.read_i32()?;
        if doc_store_offset != -1 {
            return Err(SearchError::corrupt(format!(
                "segment {name} uses a shared doc store, which this library does not write"
            )));
        }
        let del_count = input.read_u32()?;
        let diagnostics = input.read_string_map()?;
        if del_count > doc_count {
            return Err(SearchError::corrupt(format!(
                "segment {name} claims {del_count} deletions over {doc_count} docs"
            )));
        }
        Ok(Self {
            name,
            doc_count,
            del_gen,
            norm_gen,
            use_compound,
            has_norms,
            has_vectors,
            del_count,
            diagnostics,
        })
    }
}

/// The versioned manifest: an ordered segment list plus the generation
/// counter, persisted as `segments_<hex-gen>` with a `segments.gen`
/// pointer file beside it.
#[derive(Clone, Debug, Default)]
pub struct SegmentInfos {
    /// Generation of the last commit this instance wrote or read.
    pub generation: u64,
    /// Next segment number to assign; monotonic, never reused.
    pub counter: u32,
    /// Bumped on every commit; cheap "has anything changed" probe.
    pub version: u64,
    pub segments: Vec<SegmentInfo>,
    pub user_data: Vec<(String, String)>,
}

impl SegmentInfos {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn total_doc_count(&self) -> u32 {
        self.segments.iter().map(|s| s.doc_count).sum()
    }

    /// Allocates the next at-most-once segment name.
    pub fn next_segment_name(&mut self) -> String {
        let name = format!("_{:x}", self.counter);
        self.counter += 1;
        name
    }

    pub fn current_file_name(&self) -> String {
        segments_file_name(self.generation)
    }

    fn next_generation(&self) -> u64 {
        self.generation + 1
    }

    /// All files referenced by this commit, optionally including the
    /// manifest file itself.
    pub fn files(&self, include_segments_file: bool) -> Vec<String> {
        let mut files = Vec::new();
        if include_segments_file && self.generation > 0 {
            files.push(self.current_file_name());
        }
        for segment in &self.segments {
            files.extend(segment.files());
        }
        files
    }

    fn encode(&self) -> SearchResult<Vec<u8>> {
        let mut out = RamOutput::new();
        out.write_i32(FORMAT)?;
        out.write_u64(self.version)?;
        out.write_u32(self.counter)?;
        out.write_vint(self.segments.len() as u32)?;
        for segment in &self.segments {
            segment.write(&mut out)?;
        }
        out.write_string_map(&self.user_data)?;
        let mut bytes = out.into_bytes();
        let checksum: u64 = bytes.iter().map(|&b| b as u64).sum();
        bytes.extend_from_slice(&checksum.to_be_bytes());
        Ok(bytes)
    }

    fn decode(name: &str, input: &mut crate::directory::IndexInput) -> SearchResult<Self> {
        let total = input.len();
        if total < 8 {
            return Err(SearchError::corrupt(format!("{name} is truncated")));
        }
        let body_len = (total - 8) as usize;
        let body = input.read_vec(body_len)?;
        let stored_checksum = input.read_u64()?;
        let checksum: u64 = body.iter().map(|&b| b as u64).sum();
        if checksum != stored_checksum {
            return Err(SearchError::corrupt(format!(
                "checksum mismatch in {name}: stored {stored_checksum}, computed {checksum}"
            )));
        }
        let mut body = crate::directory::IndexInput::from_bytes(name, body);
        let format = body.read_i32()?;
        if format != FORMAT {
            return Err(SearchError::corrupt(format!(
                "unknown manifest format {format} in {name}"
            )));
        }
        let version = body.read_u64()?;
        let counter = body.read_u32()?;
        let count = body.read_vint()? as usize;
        let mut segments = Vec::with_capacity(count);
        for _ in 0..count {
            segments.push(SegmentInfo::read(&mut body)?);
        }
        let user_data = body.read_string_map()?;
        Ok(Self {
            generation: parse_generation(name).unwrap_or(0),
            counter,
            version,
            segments,
            user_data,
        })
    }

    fn read_file(dir: &dyn Directory, name: &str) -> SearchResult<Self> {
        let mut input = dir.open_input(name)?;
        Self::decode(name, &mut input)
    }

    /// Reads the generation recorded in `segments.gen`, if the file exists
    /// and is intact.
    fn read_gen_file(dir: &dyn Directory) -> Option<u64> {
        let mut input = dir.open_input(SEGMENTS_GEN).ok()?;
        if input.read_i32().ok()? != GEN_FORMAT {
            return None;
        }
        let gen0 = input.read_u64().ok()?;
        let gen1 = input.read_u64().ok()?;
        (gen0 == gen1).then_some(gen0)
    }

    /// Recovery: candidate generations come from both the directory
    /// listing and `segments.gen`; the highest one that parses cleanly
    /// wins.
    pub fn read_current(dir: &dyn Directory) -> SearchResult<Self> {
        let mut candidates: Vec<u64> = dir
            .list_all()?
            .iter()
            .filter_map(|name| parse_generation(name))
            .collect();
        if let Some(gen) = Self::read_gen_file(dir) {
            candidates.push(gen);
        }
        if candidates.is_empty() {
            return Err(SearchError::FileNotFound(format!(
                "no {SEGMENTS_PREFIX}_N file in directory"
            )));
        }
        candidates.sort_unstable();
        candidates.dedup();
        let mut last_err = None;
        for gen in candidates.into_iter().rev() {
            let name = segments_file_name(gen);
            match Self::read_file(dir, &name) {
                Ok(infos) => {
                    debug!("loaded manifest {name} (version {})", infos.version);
                    return Ok(infos);
                }
                Err(err) => {
                    warn!("manifest {name} unreadable, trying previous generation: {err}");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap())
    }

    /// Reads one specific past generation.
    pub fn read_generation(dir: &dyn Directory, generation: u64) -> SearchResult<Self> {
        Self::read_file(dir, &segments_file_name(generation))
    }

    /// True when a commit exists in the directory.
    pub fn index_exists(dir: &dyn Directory) -> bool {
        Self::read_current(dir).is_ok()
    }

    fn pending_file_name(generation: u64) -> String {
        format!("pending_{}", segments_file_name(generation))
    }

    /// Step one of the two-phase commit: write the next-generation
    /// manifest under its pending name and sync it.
    pub fn prepare_commit(&mut self, dir: &dyn Directory) -> SearchResult<()> {
        let generation = self.next_generation();
        let pending = Self::pending_file_name(generation);
        self.version += 1;
        let bytes = self.encode()?;
        if dir.file_exists(&pending) {
            dir.delete_file(&pending)?;
        }
        let mut out = dir.create_output(&pending)?;
        out.write_bytes(&bytes)?;
        out.close()?;
        dir.sync(&[pending])?;
        Ok(())
    }

    /// Step two: rename the pending manifest into place and point
    /// `segments.gen` at it. After the rename the commit is live even if
    /// the pointer write is lost.
    pub fn finish_commit(&mut self, dir: &dyn Directory) -> SearchResult<()> {
        let generation = self.next_generation();
        let pending = Self::pending_file_name(generation);
        let target = segments_file_name(generation);
        dir.rename(&pending, &target)?;
        self.generation = generation;

        if dir.file_exists(SEGMENTS_GEN) {
            dir.delete_file(SEGMENTS_GEN)?;
        }
        let mut out = dir.create_output(SEGMENTS_GEN)?;
        out.write_i32(GEN_FORMAT)?;
        out.write_u64(generation)?;
        out.write_u64(generation)?;
        out.close()?;
        dir.sync(&[SEGMENTS_GEN.to_string()])?;
        Ok(())
    }

    /// Abandons a prepared commit.
    pub fn rollback_commit(&self, dir: &dyn Directory) {
        let pending = Self::pending_file_name(self.next_generation());
        if dir.file_exists(&pending) {
            let _ = dir.delete_file(&pending);
        }
    }

    pub fn commit(&mut self, dir: &dyn Directory) -> SearchResult<()> {
        self.prepare_commit(dir)?;
        self.finish_commit(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::RamDirectory;

    fn sample() -> SegmentInfos {
        let mut infos = SegmentInfos::new();
        let name = infos.next_segment_name();
        let mut seg = SegmentInfo::new(&name, 100, true);
        seg.del_gen = Some(2);
        seg.del_count = 7;
        seg.diagnostics
            .push(("source".to_string(), "flush".to_string()));
        infos.segments.push(seg);
        let name = infos.next_segment_name();
        infos.segments.push(SegmentInfo::new(&name, 9, false));
        infos
            .user_data
            .push(("commit-tag".to_string(), "t1".to_string()));
        infos
    }

    #[test]
    fn commit_and_read_back() {
        let dir = RamDirectory::new();
        let mut infos = sample();
        infos.commit(dir.as_ref()).unwrap();
        assert_eq!(infos.generation, 1);
        assert!(dir.file_exists("segments_1"));
        assert!(dir.file_exists(SEGMENTS_GEN));

        let read = SegmentInfos::read_current(dir.as_ref()).unwrap();
        assert_eq!(read.generation, 1);
        assert_eq!(read.counter, 2);
        assert_eq!(read.len(), 2);
        assert_eq!(read.segments[0].name, "_0");
        assert_eq!(read.segments[0].del_gen, Some(2));
        assert_eq!(read.segments[0].del_count, 7);
        assert!(read.segments[0].use_compound);
        assert_eq!(read.segments[1].num_docs(), 9);
        assert_eq!(read.user_data, infos.user_data);
    }

    #[test]
    fn recovery_prefers_highest_parsable() {
        let dir = RamDirectory::new();
        let mut infos = sample();
        infos.commit(dir.as_ref()).unwrap();
        infos.commit(dir.as_ref()).unwrap();
        assert_eq!(infos.generation, 2);

        // corrupt the newest manifest
        dir.delete_file("segments_2").unwrap();
        let mut out = dir.create_output("segments_2").unwrap();
        out.write_bytes(&[0, 1, 2, 3]).unwrap();
        out.close().unwrap();

        let read = SegmentInfos::read_current(dir.as_ref()).unwrap();
        assert_eq!(read.generation, 1);
    }

    #[test]
    fn crash_between_rename_and_gen_pointer() {
        let dir = RamDirectory::new();
        let mut infos = sample();
        infos.commit(dir.as_ref()).unwrap();

        // second commit crashes right after the rename: segments.gen still
        // points at generation 1
        infos.segments.push(SegmentInfo::new("_9", 1, false));
        infos.prepare_commit(dir.as_ref()).unwrap();
        dir.rename("pending_segments_2", "segments_2").unwrap();

        let read = SegmentInfos::read_current(dir.as_ref()).unwrap();
        assert_eq!(read.generation, 2);
        assert_eq!(read.len(), 3);
    }

    #[test]
    fn missing_manifest_is_file_not_found() {
        let dir = RamDirectory::new();
        assert!(matches!(
            SegmentInfos::read_current(dir.as_ref()),
            Err(SearchError::FileNotFound(_))
        ));
    }

    #[test]
    fn segment_files_cover_generations() {
        let mut seg = SegmentInfo::new("_3", 10, false);
        seg.del_gen = Some(1);
        seg.norm_gen = Some(4);
        let files = seg.files();
        assert!(files.contains(&"_3.tis".to_string()));
        assert!(files.contains(&"_3_1.del".to_string()));
        assert!(files.contains(&"_3_4.nrm".to_string()));

        let compound = SegmentInfo::new("_4", 10, true);
        let files = compound.files();
        assert_eq!(files, vec!["_4.cfs".to_string()]);
    }
}
