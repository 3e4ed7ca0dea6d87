use std::fmt;
use std::sync::Arc;

use crate::directory::{Directory, IndexInput, IndexOutput, LockGuard};
use crate::error::{SearchError, SearchResult};

const FORMAT: i32 = -1;

/// Bundles a segment's files into one `.cfs` archive: format, file count,
/// a (name, offset, length) table with fixed-width offsets, then the
/// payloads back to back.
pub fn write_compound_file(
    dir: &dyn Directory,
    files: &[String],
    compound_name: &str,
) -> SearchResult<()> {
    let mut out = dir.create_output(compound_name)?;
    out.write_i32(FORMAT)?;
    out.write_vint(files.len() as u32)?;

    // the table is fixed-width apart from the names, so offsets are known
    // before any payload is copied
    let mut header_len = out.file_pointer();
    for name in files {
        header_len += vint_len(name.len() as u32) as u64 + name.len() as u64 + 16;
    }
    let mut offset = header_len;
    for name in files {
        let length = dir.file_length(name)?;
        out.write_string(name)?;
        out.write_u64(offset)?;
        out.write_u64(length)?;
        offset += length;
    }
    for name in files {
        let mut input = dir.open_input(name)?;
        let mut remaining = input.len() as usize;
        let mut buf = [0u8; 16 * 1024];
        while remaining > 0 {
            let chunk = remaining.min(buf.len());
            input.read_bytes(&mut buf[..chunk])?;
            out.write_bytes(&buf[..chunk])?;
            remaining -= chunk;
        }
    }
    out.close()
}

fn vint_len(v: u32) -> usize {
    match v {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0xfff_ffff => 4,
        _ => 5,
    }
}

/// Presents a `.cfs` bundle as a nested read-only directory of slices, so
/// segment readers open member files through the ordinary interface.
pub struct CompoundFileReader {
    name: String,
    input: IndexInput,
    entries: Vec<(String, u64, u64)>,
}

impl CompoundFileReader {
    pub fn open(dir: &dyn Directory, compound_name: &str) -> SearchResult<Arc<Self>> {
        let mut input = dir.open_input(compound_name)?;
        let format = input.read_i32()?;
        if format != FORMAT {
            return Err(SearchError::corrupt(format!(
                "unknown compound file format {format} in {compound_name}"
            )));
        }
        let count = input.read_vint()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let name = input.read_string()?;
            let offset = input.read_u64()?;
            let length = input.read_u64()?;
            if offset + length > input.len() {
                return Err(SearchError::corrupt(format!(
                    "compound entry {name} [{offset}, +{length}) outside {compound_name}"
                )));
            }
            entries.push((name, offset, length));
        }
        Ok(Arc::new(Self {
            name: compound_name.to_string(),
            input,
            entries,
        }))
    }

    fn entry(&self, name: &str) -> Option<&(String, u64, u64)> {
        self.entries.iter().find(|(n, _, _)| n == name)
    }
}

impl Directory for CompoundFileReader {
    fn list_all(&self) -> SearchResult<Vec<String>> {
        Ok(self.entries.iter().map(|(n, _, _)| n.clone()).collect())
    }

    fn file_exists(&self, name: &str) -> bool {
        self.entry(name).is_some()
    }

    fn file_length(&self, name: &str) -> SearchResult<u64> {
        self.entry(name)
            .map(|(_, _, len)| *len)
            .ok_or_else(|| SearchError::FileNotFound(name.to_string()))
    }

    fn file_modified(&self, name: &str) -> SearchResult<u64> {
        self.entry(name)
            .map(|_| 0)
            .ok_or_else(|| SearchError::FileNotFound(name.to_string()))
    }

    fn create_output(&self, _name: &str) -> SearchResult<Box<dyn IndexOutput>> {
        Err(SearchError::UnsupportedOperation(
            "compound files are read-only",
        ))
    }

    fn open_input(&self, name: &str) -> SearchResult<IndexInput> {
        let (_, offset, length) = self
            .entry(name)
            .ok_or_else(|| SearchError::FileNotFound(name.to_string()))?;
        self.input.slice(name, *offset, *length)
    }

    fn delete_file(&self, _name: &str) -> SearchResult<()> {
        Err(SearchError::UnsupportedOperation(
            "compound files are read-only",
        ))
    }

    fn rename(&self, _from: &str, _to: &str) -> SearchResult<()> {
        Err(SearchError::UnsupportedOperation(
            "compound files are read-only",
        ))
    }

    fn sync(&self, _names: &[String]) -> SearchResult<()> {
        Ok(())
    }

    fn obtain_lock(&self, _name: &str, _timeout_ms: u64) -> SearchResult<LockGuard> {
        Err(SearchError::UnsupportedOperation(
            "compound files are read-only",
        ))
    }

    fn clear_lock(&self, _name: &str) -> SearchResult<()> {
        Ok(())
    }

    fn set_prevent_delete_open_files(&self, _prevent: bool) {}
}

impl fmt::Debug for CompoundFileReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompoundFileReader({})", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::RamDirectory;

    #[test]
    fn bundle_round_trip() {
        let dir = RamDirectory::new();
        for (name, content) in [("_0.fnm", b"abc".as_slice()), ("_0.frq", b"defgh")] {
            let mut out = dir.create_output(name).unwrap();
            out.write_bytes(content).unwrap();
            out.close().unwrap();
        }
        let files = vec!["_0.fnm".to_string(), "_0.frq".to_string()];
        write_compound_file(dir.as_ref(), &files, "_0.cfs").unwrap();

        let bundle = CompoundFileReader::open(dir.as_ref(), "_0.cfs").unwrap();
        assert_eq!(bundle.file_length("_0.fnm").unwrap(), 3);
        let mut input = bundle.open_input("_0.frq").unwrap();
        assert_eq!(input.read_vec(5).unwrap(), b"defgh");
        assert!(matches!(
            bundle.open_input("_0.prx"),
            Err(SearchError::FileNotFound(_))
        ));
        assert!(bundle.create_output("x").is_err());
    }

    #[test]
    fn empty_member_files_allowed() {
        let dir = RamDirectory::new();
        dir.create_output("_1.prx").unwrap().close().unwrap();
        let mut out = dir.create_output("_1.frq").unwrap();
        out.write_bytes(b"xy").unwrap();
        out.close().unwrap();

        let files = vec!["_1.prx".to_string(), "_1.frq".to_string()];
        write_compound_file(dir.as_ref(), &files, "_1.cfs").unwrap();
        let bundle = CompoundFileReader::open(dir.as_ref(), "_1.cfs").unwrap();
        assert_eq!(bundle.file_length("_1.prx").unwrap(), 0);
        assert!(bundle.open_input("_1.prx").unwrap().is_empty());
    }
}
