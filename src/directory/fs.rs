use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant, UNIX_EPOCH};

use hashbrown::HashMap;
use memmap2::Mmap;

use crate::directory::input::InputSource;
use crate::directory::{Directory, IndexInput, IndexOutput, LockGuard};
use crate::error::{SearchError, SearchResult};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// File-system directory. Inputs are mmapped; the mapping for each file is
/// shared by every open cursor and cached weakly so reopening a hot file is
/// free.
pub struct FsDirectory {
    root: PathBuf,
    mmap_cache: Mutex<HashMap<String, Weak<Mmap>>>,
    prevent_delete_open: AtomicBool,
}

impl FsDirectory {
    pub fn open<P: AsRef<Path>>(root: P) -> SearchResult<Arc<Self>> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            fs::create_dir_all(&root)?;
        }
        Ok(Arc::new(Self {
            root,
            mmap_cache: Mutex::new(HashMap::new()),
            prevent_delete_open: AtomicBool::new(false),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// True while some open input still holds the mapping for `name`.
    fn is_mapped(&self, name: &str) -> bool {
        let cache = self.mmap_cache.lock().unwrap();
        cache
            .get(name)
            .map(|weak| weak.upgrade().is_some())
            .unwrap_or(false)
    }
}

impl Directory for FsDirectory {
    fn list_all(&self) -> SearchResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.metadata()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    fn file_exists(&self, name: &str) -> bool {
        self.resolve(name).is_file()
    }

    fn file_length(&self, name: &str) -> SearchResult<u64> {
        fs::metadata(self.resolve(name))
            .map(|meta| meta.len())
            .map_err(|err| SearchError::from_io(name, err))
    }

    fn file_modified(&self, name: &str) -> SearchResult<u64> {
        let meta =
            fs::metadata(self.resolve(name)).map_err(|err| SearchError::from_io(name, err))?;
        let modified = meta.modified().map_err(SearchError::Io)?;
        let millis = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(millis)
    }

    fn create_output(&self, name: &str) -> SearchResult<Box<dyn IndexOutput>> {
        let path = self.resolve(name);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    SearchError::IllegalArgument(format!("file already exists: {name}"))
                } else {
                    SearchError::Io(err)
                }
            })?;
        Ok(Box::new(FsOutput {
            writer: BufWriter::new(file),
            pos: 0,
        }))
    }

    fn open_input(&self, name: &str) -> SearchResult<IndexInput> {
        let path = self.resolve(name);
        {
            let cache = self.mmap_cache.lock().unwrap();
            if let Some(map) = cache.get(name).and_then(Weak::upgrade) {
                return Ok(IndexInput::new(name, InputSource::Mapped(map)));
            }
        }
        let file = File::open(&path).map_err(|err| SearchError::from_io(name, err))?;
        let len = file.metadata()?.len();
        if len == 0 {
            // a zero-length file cannot be mapped
            return Ok(IndexInput::new(name, InputSource::Ram(Arc::new(Vec::new()))));
        }
        let map = Arc::new(unsafe { Mmap::map(&file)? });
        self.mmap_cache
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::downgrade(&map));
        Ok(IndexInput::new(name, InputSource::Mapped(map)))
    }

    fn delete_file(&self, name: &str) -> SearchResult<()> {
        if self.prevent_delete_open.load(Ordering::Acquire) && self.is_mapped(name) {
            return Err(SearchError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("cannot delete {name}: file is still open"),
            )));
        }
        self.mmap_cache.lock().unwrap().remove(name);
        fs::remove_file(self.resolve(name)).map_err(|err| SearchError::from_io(name, err))
    }

    fn rename(&self, from: &str, to: &str) -> SearchResult<()> {
        self.mmap_cache.lock().unwrap().remove(from);
        fs::rename(self.resolve(from), self.resolve(to))
            .map_err(|err| SearchError::from_io(from, err))
    }

    fn sync(&self, names: &[String]) -> SearchResult<()> {
        for name in names {
            let file =
                File::open(self.resolve(name)).map_err(|err| SearchError::from_io(name, err))?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn obtain_lock(&self, name: &str, timeout_ms: u64) -> SearchResult<LockGuard> {
        let path = self.resolve(name);
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => {
                    let lock_path = path.clone();
                    return Ok(LockGuard::new(Box::new(move || {
                        let _ = fs::remove_file(&lock_path);
                    })));
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(SearchError::LockObtainFailed(format!(
                            "lock {name} held after {timeout_ms} ms"
                        )));
                    }
                    thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(err) => return Err(SearchError::Io(err)),
            }
        }
    }

    fn clear_lock(&self, name: &str) -> SearchResult<()> {
        let path = self.resolve(name);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn set_prevent_delete_open_files(&self, prevent: bool) {
        self.prevent_delete_open.store(prevent, Ordering::Release);
    }
}

impl fmt::Debug for FsDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FsDirectory({})", self.root.display())
    }
}

struct FsOutput {
    writer: BufWriter<File>,
    pos: u64,
}

impl IndexOutput for FsOutput {
    fn write_byte(&mut self, b: u8) -> SearchResult<()> {
        self.writer.write_all(&[b])?;
        self.pos += 1;
        Ok(())
    }

    fn write_bytes(&mut self, buf: &[u8]) -> SearchResult<()> {
        self.writer.write_all(buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn file_pointer(&self) -> u64 {
        self.pos
    }

    fn seek(&mut self, pos: u64) -> SearchResult<()> {
        self.writer.flush()?;
        self.writer.get_mut().seek(SeekFrom::Start(pos))?;
        self.pos = pos;
        Ok(())
    }

    fn flush(&mut self) -> SearchResult<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn close(&mut self) -> SearchResult<()> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn create_open_round_trip() {
        let tmp = TempDir::new("fsdir").unwrap();
        let dir = FsDirectory::open(tmp.path()).unwrap();
        {
            let mut out = dir.create_output("a.bin").unwrap();
            out.write_vint(300).unwrap();
            out.write_string("hello").unwrap();
            out.close().unwrap();
        }
        dir.sync(&["a.bin".to_string()]).unwrap();
        let mut input = dir.open_input("a.bin").unwrap();
        assert_eq!(input.read_vint().unwrap(), 300);
        assert_eq!(input.read_string().unwrap(), "hello");
        assert_eq!(dir.list_all().unwrap(), vec!["a.bin".to_string()]);
    }

    #[test]
    fn double_create_refused() {
        let tmp = TempDir::new("fsdir").unwrap();
        let dir = FsDirectory::open(tmp.path()).unwrap();
        dir.create_output("x").unwrap().close().unwrap();
        assert!(dir.create_output("x").is_err());
    }

    #[test]
    fn lock_contention_times_out() {
        let tmp = TempDir::new("fsdir").unwrap();
        let dir = FsDirectory::open(tmp.path()).unwrap();
        let guard = dir.obtain_lock("write.lock", 100).unwrap();
        assert!(matches!(
            dir.obtain_lock("write.lock", 100),
            Err(SearchError::LockObtainFailed(_))
        ));
        drop(guard);
        dir.obtain_lock("write.lock", 100).unwrap();
    }

    #[test]
    fn pinned_file_delete_refused() {
        let tmp = TempDir::new("fsdir").unwrap();
        let dir = FsDirectory::open(tmp.path()).unwrap();
        {
            let mut out = dir.create_output("pinned").unwrap();
            out.write_bytes(b"data").unwrap();
            out.close().unwrap();
        }
        dir.set_prevent_delete_open_files(true);
        let input = dir.open_input("pinned").unwrap();
        assert!(dir.delete_file("pinned").is_err());
        drop(input);
        dir.delete_file("pinned").unwrap();
    }
}
