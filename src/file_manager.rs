//! Process-scoped file manager. Owns open file handles and mmap buffers,
//! tracks which pages scans touch, and notifies registered cleaners under
//! memory pressure. Partitions hold handles, never the buffers themselves.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use lru::LruCache;
use memmap2::Mmap;

use crate::bitmap::Bitmap;

pub const PAGE_SIZE: usize = 4096;

/// Callback invoked when the file manager wants memory back. Cleaners must
/// not re-acquire partition locks held by the thread that triggered them.
pub trait MemCleaner: Send + Sync {
    fn release(&self, urgency: usize);
}

pub struct ManagedFile {
    path: PathBuf,
    file: Mutex<File>,
    mmap: Mutex<Option<Arc<Mmap>>>,
    uses: AtomicUsize,
}

impl ManagedFile {
    fn open(path: &Path) -> std::io::Result<ManagedFile> {
        Ok(ManagedFile {
            path: path.to_path_buf(),
            file: Mutex::new(File::open(path)?),
            mmap: Mutex::new(None),
            uses: AtomicUsize::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> std::io::Result<u64> {
        Ok(self.file.lock().unwrap().metadata()?.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len().map(|l| l == 0).unwrap_or(true)
    }

    pub fn begin_use(&self) {
        self.uses.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_use(&self) {
        self.uses.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn in_use(&self) -> bool {
        self.uses.load(Ordering::SeqCst) > 0
    }

    /// Seek+read hidden behind one call. Returns the number of bytes read,
    /// which is short only at end of file.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Lazily created shared mapping of the whole file.
    pub fn map(&self) -> std::io::Result<Arc<Mmap>> {
        let mut mmap = self.mmap.lock().unwrap();
        if let Some(ref m) = *mmap {
            return Ok(m.clone());
        }
        let file = self.file.lock().unwrap();
        let m = Arc::new(unsafe { Mmap::map(&*file)? });
        *mmap = Some(m.clone());
        Ok(m)
    }

    fn drop_buffers(&self) {
        *self.mmap.lock().unwrap() = None;
    }
}

pub struct FileManager {
    files: Mutex<HashMap<PathBuf, Arc<ManagedFile>>>,
    recency: Mutex<LruCache<PathBuf, ()>>,
    pages: Mutex<HashMap<PathBuf, Bitmap>>,
    beat: AtomicU32,
    cleaners: Mutex<Vec<Weak<dyn MemCleaner>>>,
}

impl FileManager {
    pub fn new() -> Arc<FileManager> {
        Arc::new(FileManager {
            files: Mutex::new(HashMap::new()),
            recency: Mutex::new(LruCache::new(NonZeroUsize::new(1 << 16).unwrap())),
            pages: Mutex::new(HashMap::new()),
            beat: AtomicU32::new(0),
            cleaners: Mutex::new(Vec::new()),
        })
    }

    pub fn open(&self, path: &Path) -> std::io::Result<Arc<ManagedFile>> {
        let mut files = self.files.lock().unwrap();
        if let Some(f) = files.get(path) {
            self.recency.lock().unwrap().get(path);
            return Ok(f.clone());
        }
        let f = Arc::new(ManagedFile::open(path)?);
        files.insert(path.to_path_buf(), f.clone());
        self.recency.lock().unwrap().put(path.to_path_buf(), ());
        Ok(f)
    }

    /// Records that a scan touched `bytes` of `path`, page-granular.
    pub fn record_pages(&self, path: &Path, bytes: std::ops::Range<u64>) {
        if bytes.is_empty() {
            return;
        }
        let first = (bytes.start / PAGE_SIZE as u64) as usize;
        let last = ((bytes.end - 1) / PAGE_SIZE as u64) as usize;
        let mut pages = self.pages.lock().unwrap();
        let touched = pages.entry(path.to_path_buf()).or_default();
        for page in first..=last {
            touched.set(page);
        }
    }

    pub fn pages_touched(&self, path: &Path) -> usize {
        self.pages
            .lock()
            .unwrap()
            .get(path)
            .map(|b| b.count())
            .unwrap_or(0)
    }

    /// Monotonically increasing per-process counter.
    pub fn beat(&self) -> u32 {
        self.beat.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drops cached buffers for `path`. Handles still in use are kept open.
    pub fn flush(&self, path: &Path) {
        let mut files = self.files.lock().unwrap();
        if let Some(f) = files.get(path) {
            f.drop_buffers();
            if !f.in_use() {
                files.remove(path);
                self.recency.lock().unwrap().pop(path);
            }
        }
        self.pages.lock().unwrap().remove(path);
    }

    pub fn register_cleaner(&self, cleaner: Weak<dyn MemCleaner>) {
        self.cleaners.lock().unwrap().push(cleaner);
    }

    /// Invoked on memory pressure: evicts unused buffers in LRU order and
    /// asks every live cleaner to give memory back.
    pub fn unload(&self, urgency: usize) {
        let victims: Vec<PathBuf> = {
            let mut recency = self.recency.lock().unwrap();
            let files = self.files.lock().unwrap();
            let mut victims = Vec::new();
            while let Some((path, ())) = recency.pop_lru() {
                if files.get(&path).map(|f| !f.in_use()).unwrap_or(false) {
                    victims.push(path);
                }
                if victims.len() >= urgency.max(1) {
                    break;
                }
            }
            victims
        };
        for path in victims {
            self.flush(&path);
        }
        let cleaners: Vec<Weak<dyn MemCleaner>> = {
            let mut cleaners = self.cleaners.lock().unwrap();
            cleaners.retain(|c| c.upgrade().is_some());
            cleaners.clone()
        };
        for cleaner in cleaners {
            if let Some(c) = cleaner.upgrade() {
                c.release(urgency);
            }
        }
    }
}
