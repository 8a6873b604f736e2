//! The partition proper: schema, row mask, row identifiers, and the lock
//! discipline shared by every reader and mutator.
//!
//! Lock order: accessors take the `meta` read lock; mutators (rename, state
//! change, index spec, column changes) take the write lock. Regeneration of
//! derived RID state serializes on `rid_mutex` instead so it cannot
//! deadlock with threads already holding the read lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::bitmap::Bitmap;
use crate::config::Config;
use crate::errors::{PartError, PartResult};
use crate::file_manager::{FileManager, MemCleaner};
use crate::part::column::{Column, PartCtx};
use crate::part::header::{self, HeaderInfo, MeshDim, PartState, MASK_FILE};
use crate::rid::{self, Rid};

pub struct PartMeta {
    pub name: String,
    pub description: String,
    pub state: PartState,
    pub timestamp: u64,
    pub backup_dir: Option<PathBuf>,
    pub index_spec: String,
    pub columns: Vec<Arc<Column>>,
    pub meta_tags: Vec<(String, String)>,
    pub shape: Option<Vec<MeshDim>>,
    pub selected: Option<Vec<String>>,
    pub tot_props: Option<u32>,
    // lowercase column name -> position in `columns`
    lookup: HashMap<String, usize>,
}

impl PartMeta {
    pub(crate) fn rebuild_lookup(&mut self) {
        self.lookup = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name().to_ascii_lowercase(), i))
            .collect();
    }

    pub fn column(&self, name: &str) -> Option<Arc<Column>> {
        self.lookup
            .get(&name.to_ascii_lowercase())
            .map(|&i| self.columns[i].clone())
    }
}

pub struct Partition {
    rows: usize,
    active_dir: PathBuf,
    export_csr: Option<PathBuf>,
    fill_rids_enabled: bool,
    fm: Arc<FileManager>,
    pub(crate) meta: RwLock<PartMeta>,
    mask: RwLock<Bitmap>,
    rids: RwLock<Option<Arc<Vec<Rid>>>>,
    pub(crate) rid_mutex: Mutex<()>,
    errors: AtomicUsize,
    cleaner: Mutex<Option<Arc<PartCleaner>>>,
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("rows", &self.rows)
            .field("active_dir", &self.active_dir)
            .finish_non_exhaustive()
    }
}

pub(crate) fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Partition {
    pub(crate) fn assemble(
        info: HeaderInfo,
        active_dir: PathBuf,
        mask: Bitmap,
        config: &Config,
        fm: Arc<FileManager>,
    ) -> Partition {
        let mut meta = PartMeta {
            name: info.name,
            description: info.description,
            state: info.state,
            timestamp: info.timestamp,
            backup_dir: info.alt_dir,
            index_spec: info.index_spec,
            columns: info.columns,
            meta_tags: info.meta_tags,
            shape: info.shape,
            selected: info.selected,
            tot_props: info.tot_props,
            lookup: HashMap::new(),
        };
        meta.rebuild_lookup();
        let fill_rids_enabled = config.fill_rids(&meta.name);
        Partition {
            rows: info.rows as usize,
            export_csr: config.export_bitmap_as_csr().map(PathBuf::from),
            fill_rids_enabled,
            active_dir,
            fm,
            meta: RwLock::new(meta),
            mask: RwLock::new(mask),
            rids: RwLock::new(None),
            rid_mutex: Mutex::new(()),
            errors: AtomicUsize::new(0),
            cleaner: Mutex::new(None),
        }
    }

    /// Registers a cleaner with the file manager so index and RID memory can
    /// be reclaimed under pressure.
    pub(crate) fn register_cleaner(self: &Arc<Partition>) {
        let cleaner = Arc::new(PartCleaner {
            part: Arc::downgrade(self),
        });
        self.fm
            .register_cleaner(Arc::downgrade(&cleaner) as Weak<dyn MemCleaner>);
        *self.cleaner.lock().unwrap() = Some(cleaner);
    }

    pub fn ctx(&self) -> PartCtx {
        PartCtx {
            dir: &self.active_dir,
            rows: self.rows,
            fm: &self.fm,
            export_csr: self.export_csr.as_deref(),
        }
    }

    pub fn nrows(&self) -> usize {
        self.rows
    }

    pub fn ncols(&self) -> usize {
        self.meta.read().unwrap().columns.len()
    }

    pub fn name(&self) -> String {
        self.meta.read().unwrap().name.clone()
    }

    pub fn description(&self) -> String {
        self.meta.read().unwrap().description.clone()
    }

    pub fn state(&self) -> PartState {
        self.meta.read().unwrap().state
    }

    pub fn active_dir(&self) -> &Path {
        &self.active_dir
    }

    pub fn backup_dir(&self) -> Option<PathBuf> {
        self.meta.read().unwrap().backup_dir.clone()
    }

    pub fn file_manager(&self) -> &Arc<FileManager> {
        &self.fm
    }

    /// Seconds-since-epoch of the last state switch.
    pub fn switch_time(&self) -> u64 {
        self.meta.read().unwrap().timestamp
    }

    pub fn index_spec(&self) -> String {
        self.meta.read().unwrap().index_spec.clone()
    }

    pub fn set_index_spec(&self, spec: &str) -> PartResult<()> {
        {
            let mut meta = self.meta.write().unwrap();
            meta.index_spec = spec.to_string();
        }
        self.write_header()
    }

    pub fn set_state(&self, state: PartState) -> PartResult<()> {
        {
            let mut meta = self.meta.write().unwrap();
            meta.state = state;
            meta.timestamp = epoch_now();
        }
        self.write_header()
    }

    pub fn meta_tags(&self) -> Vec<(String, String)> {
        self.meta.read().unwrap().meta_tags.clone()
    }

    /// Whether this partition carries all the given tags. A stored value of
    /// `"*"` matches any requested value.
    pub fn matches_meta_tags(&self, tags: &[(String, String)]) -> bool {
        let meta = self.meta.read().unwrap();
        tags.iter().all(|(name, value)| {
            meta.meta_tags.iter().any(|(n, v)| {
                n.eq_ignore_ascii_case(name) && (v == "*" || v.eq_ignore_ascii_case(value))
            })
        })
    }

    pub fn shape(&self) -> Option<Vec<MeshDim>> {
        self.meta.read().unwrap().shape.clone()
    }

    pub fn columns(&self) -> Vec<Arc<Column>> {
        self.meta.read().unwrap().columns.clone()
    }

    /// Case-insensitive column lookup.
    pub fn column(&self, name: &str) -> Option<Arc<Column>> {
        self.meta.read().unwrap().column(name)
    }

    pub fn column_names(&self) -> Vec<String> {
        let meta = self.meta.read().unwrap();
        match meta.selected {
            Some(ref order) => order.clone(),
            None => meta.columns.iter().map(|c| c.name().to_string()).collect(),
        }
    }

    /// Copy of the row-validity mask.
    pub fn active_mask(&self) -> Bitmap {
        self.mask.read().unwrap().clone()
    }

    pub fn active_rows(&self) -> usize {
        self.mask.read().unwrap().count()
    }

    pub(crate) fn set_mask(&self, mask: Bitmap) {
        *self.mask.write().unwrap() = mask;
    }

    pub fn deactivate_rows(&self, rows: &Bitmap) -> PartResult<()> {
        self.mask.write().unwrap().and_not(rows);
        self.store_mask()
    }

    /// Persists the row mask: fully-set masks remove the file instead.
    pub fn store_mask(&self) -> PartResult<()> {
        let mask = self.mask.read().unwrap();
        let path = self.active_dir.join(MASK_FILE);
        if mask.count() == self.rows {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        } else {
            mask.write_to(&path)?;
        }
        Ok(())
    }

    /// The RID array, read from disk on first use or synthesized when the
    /// partition is configured for it. Shared read-only among readers.
    pub fn rids(&self) -> Option<Arc<Vec<Rid>>> {
        if let Some(rids) = self.rids.read().unwrap().clone() {
            return Some(rids);
        }
        let mut slot = self.rids.write().unwrap();
        if slot.is_none() {
            match rid::read_rids(&self.active_dir, self.rows) {
                Ok(Some(rids)) => *slot = Some(Arc::new(rids)),
                Ok(None) => {
                    if self.fill_rids_enabled {
                        match rid::fill_rids(&self.active_dir, self.rows, &self.fm) {
                            Ok(rids) => *slot = Some(Arc::new(rids)),
                            Err(e) => {
                                warn!("failed to synthesize row identifiers: {}", e);
                                self.inc_errors();
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("failed to read row identifiers: {}", e);
                    self.inc_errors();
                }
            }
        }
        slot.clone()
    }

    pub fn has_rids(&self) -> bool {
        self.rids().is_some()
    }

    /// Advisory free of the RID array: skipped entirely when any reader
    /// holds it.
    pub fn free_rids(&self) {
        match self.rids.try_write() {
            Ok(mut slot) => {
                if let Some(ref rids) = *slot {
                    if Arc::strong_count(rids) > 1 {
                        debug!("rid array still shared; not freed");
                        return;
                    }
                }
                *slot = None;
            }
            Err(_) => debug!("rid array lock contested; not freed"),
        }
    }

    /// Ensures `rids.srt` exists with the expected size, regenerating it
    /// from the RID array if necessary. Serialized by the partition mutex.
    pub fn sort_rids(&self) -> PartResult<()> {
        let _guard = self.rid_mutex.lock().unwrap();
        if rid::sorted_file_ok(&self.active_dir, self.rows) {
            return Ok(());
        }
        let rids = self
            .rids()
            .ok_or_else(|| PartError::Inconsistent("partition has no row identifiers".to_string()))?;
        rid::sort_rids(&self.active_dir, &rids)
    }

    /// Rewrites the header from current metadata.
    pub fn write_header(&self) -> PartResult<()> {
        let info = {
            let meta = self.meta.read().unwrap();
            HeaderInfo {
                name: meta.name.clone(),
                description: meta.description.clone(),
                rows: self.rows as u64,
                timestamp: meta.timestamp,
                state: meta.state,
                alt_dir: meta.backup_dir.clone(),
                meta_tags: meta.meta_tags.clone(),
                shape: meta.shape.clone(),
                index_spec: meta.index_spec.clone(),
                columns: meta.columns.clone(),
                selected: meta.selected.clone(),
                tot_props: meta.tot_props,
                max_name_len: 0,
            }
        };
        header::write_header(&self.active_dir, &info)
    }

    /// Renames the partition and persists the header.
    pub fn rename(&self, name: &str) -> PartResult<()> {
        {
            let mut meta = self.meta.write().unwrap();
            meta.name = name.to_string();
        }
        self.write_header()
    }

    pub fn inc_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Gives index and RID memory back when the file manager signals pressure.
/// Runs opportunistically: anything already locked is skipped rather than
/// waited for, so cleaners never deadlock with partition lock holders.
pub(crate) struct PartCleaner {
    part: Weak<Partition>,
}

impl MemCleaner for PartCleaner {
    fn release(&self, _urgency: usize) {
        if let Some(part) = self.part.upgrade() {
            part.free_rids();
            if let Ok(meta) = part.meta.try_read() {
                for col in &meta.columns {
                    col.unload_index();
                    col.free_data();
                }
            }
        }
    }
}
