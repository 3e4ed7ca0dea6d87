use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use hashbrown::{HashMap, HashSet};

use crate::directory::input::InputSource;
use crate::directory::{Directory, IndexInput, IndexOutput, LockGuard};
use crate::error::{SearchError, SearchResult};

/// Heap-backed directory for tests and transient indexes. The full commit
/// protocol works against it; `sync` is a no-op.
pub struct RamDirectory {
    inner: Arc<RamInner>,
}

struct RamInner {
    files: Mutex<HashMap<String, RamFile>>,
    locks: Mutex<HashSet<String>>,
    prevent_delete_open: AtomicBool,
}

struct RamFile {
    data: Arc<Vec<u8>>,
    modified: u64,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl RamDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(RamInner {
                files: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashSet::new()),
                prevent_delete_open: AtomicBool::new(false),
            }),
        })
    }
}

impl Directory for RamDirectory {
    fn list_all(&self) -> SearchResult<Vec<String>> {
        Ok(self.inner.files.lock().unwrap().keys().cloned().collect())
    }

    fn file_exists(&self, name: &str) -> bool {
        self.inner.files.lock().unwrap().contains_key(name)
    }

    fn file_length(&self, name: &str) -> SearchResult<u64> {
        self.inner
            .files
            .lock()
            .unwrap()
            .get(name)
            .map(|f| f.data.len() as u64)
            .ok_or_else(|| SearchError::FileNotFound(name.to_string()))
    }

    fn file_modified(&self, name: &str) -> SearchResult<u64> {
        self.inner
            .files
            .lock()
            .unwrap()
            .get(name)
            .map(|f| f.modified)
            .ok_or_else(|| SearchError::FileNotFound(name.to_string()))
    }

    fn create_output(&self, name: &str) -> SearchResult<Box<dyn IndexOutput>> {
        let files = self.inner.files.lock().unwrap();
        if files.contains_key(name) {
            return Err(SearchError::IllegalArgument(format!(
                "file already exists: {name}"
            )));
        }
        drop(files);
        Ok(Box::new(RamFileOutput {
            name: name.to_string(),
            inner: Arc::clone(&self.inner),
            buf: Vec::new(),
            pos: 0,
            closed: false,
        }))
    }

    fn open_input(&self, name: &str) -> SearchResult<IndexInput> {
        let files = self.inner.files.lock().unwrap();
        let file = files
            .get(name)
            .ok_or_else(|| SearchError::FileNotFound(name.to_string()))?;
        Ok(IndexInput::new(name, InputSource::Ram(Arc::clone(&file.data))))
    }

    fn delete_file(&self, name: &str) -> SearchResult<()> {
        let mut files = self.inner.files.lock().unwrap();
        if self.inner.prevent_delete_open.load(Ordering::Acquire) {
            if let Some(file) = files.get(name) {
                // another strong ref means an input is still open
                if Arc::strong_count(&file.data) > 1 {
                    return Err(SearchError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("cannot delete {name}: file is still open"),
                    )));
                }
            }
        }
        files
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SearchError::FileNotFound(name.to_string()))
    }

    fn rename(&self, from: &str, to: &str) -> SearchResult<()> {
        let mut files = self.inner.files.lock().unwrap();
        let file = files
            .remove(from)
            .ok_or_else(|| SearchError::FileNotFound(from.to_string()))?;
        files.insert(to.to_string(), file);
        Ok(())
    }

    fn sync(&self, _names: &[String]) -> SearchResult<()> {
        Ok(())
    }

    fn obtain_lock(&self, name: &str, timeout_ms: u64) -> SearchResult<LockGuard> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            {
                let mut locks = self.inner.locks.lock().unwrap();
                if locks.insert(name.to_string()) {
                    let inner = Arc::clone(&self.inner);
                    let name = name.to_string();
                    return Ok(LockGuard::new(Box::new(move || {
                        inner.locks.lock().unwrap().remove(&name);
                    })));
                }
            }
            if Instant::now() >= deadline {
                return Err(SearchError::LockObtainFailed(format!(
                    "lock {name} held after {timeout_ms} ms"
                )));
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn clear_lock(&self, name: &str) -> SearchResult<()> {
        self.inner.locks.lock().unwrap().remove(name);
        Ok(())
    }

    fn set_prevent_delete_open_files(&self, prevent: bool) {
        self.inner
            .prevent_delete_open
            .store(prevent, Ordering::Release);
    }
}

impl fmt::Debug for RamDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RamDirectory({} files)",
            self.inner.files.lock().unwrap().len()
        )
    }
}

struct RamFileOutput {
    name: String,
    inner: Arc<RamInner>,
    buf: Vec<u8>,
    pos: usize,
    closed: bool,
}

impl RamFileOutput {
    fn publish(&mut self) {
        let mut files = self.inner.files.lock().unwrap();
        files.insert(
            self.name.clone(),
            RamFile {
                data: Arc::new(std::mem::take(&mut self.buf)),
                modified: now_millis(),
            },
        );
    }
}

impl IndexOutput for RamFileOutput {
    fn write_byte(&mut self, b: u8) -> SearchResult<()> {
        if self.pos == self.buf.len() {
            self.buf.push(b);
        } else {
            self.buf[self.pos] = b;
        }
        self.pos += 1;
        Ok(())
    }

    fn write_bytes(&mut self, buf: &[u8]) -> SearchResult<()> {
        let end = self.pos + buf.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        Ok(())
    }

    fn file_pointer(&self) -> u64 {
        self.pos as u64
    }

    fn seek(&mut self, pos: u64) -> SearchResult<()> {
        self.pos = pos as usize;
        if self.pos > self.buf.len() {
            self.buf.resize(self.pos, 0);
        }
        Ok(())
    }

    fn flush(&mut self) -> SearchResult<()> {
        Ok(())
    }

    fn close(&mut self) -> SearchResult<()> {
        if !self.closed {
            self.closed = true;
            self.publish();
        }
        Ok(())
    }
}

impl Drop for RamFileOutput {
    fn drop(&mut self) {
        // an output dropped without close still publishes what was written,
        // mirroring a file left on disk by a crash
        if !self.closed {
            self.publish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let dir = RamDirectory::new();
        let mut out = dir.create_output("f").unwrap();
        out.write_string("abc").unwrap();
        out.write_u64(42).unwrap();
        out.close().unwrap();

        let mut input = dir.open_input("f").unwrap();
        assert_eq!(input.read_string().unwrap(), "abc");
        assert_eq!(input.read_u64().unwrap(), 42);
        assert_eq!(dir.file_length("f").unwrap(), input.len());
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = RamDirectory::new();
        assert!(matches!(
            dir.open_input("nope"),
            Err(SearchError::FileNotFound(_))
        ));
    }

    #[test]
    fn rename_replaces_target() {
        let dir = RamDirectory::new();
        dir.create_output("a").unwrap().close().unwrap();
        dir.rename("a", "b").unwrap();
        assert!(!dir.file_exists("a"));
        assert!(dir.file_exists("b"));
    }
}
