//! Partition construction and the active/backup directory scheme.
//!
//! The backup copy runs as a detached background task. Termination signals
//! are blocked inside the task so an interrupted process cannot leave the
//! destination half-populated, and all destructive directory operations
//! serialize on a process-wide environment lock.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use itertools::Itertools;
use lazy_static::lazy_static;
use threadpool::ThreadPool;
use walkdir::WalkDir;

use crate::bitmap::Bitmap;
use crate::config::Config;
use crate::errors::{PartError, PartResult};
use crate::file_manager::FileManager;
use crate::part::header::{self, HeaderInfo, PartState, MASK_FILE};
use crate::part::partition::{epoch_now, Partition};

lazy_static! {
    static ref ENV_LOCK: Mutex<()> = Mutex::new(());
    static ref COPY_POOL: ThreadPool = ThreadPool::new(1);
}

/// Blocks until all pending backup copies have finished.
pub fn wait_for_background_tasks() {
    COPY_POOL.join();
}

impl Partition {
    /// Opens the partition stored in `dir`, creating an empty partition when
    /// the directory does not exist yet. Fails without leaving partial state
    /// behind.
    pub fn from_dir(
        dir: &Path,
        config: &Config,
        fm: Arc<FileManager>,
    ) -> PartResult<Arc<Partition>> {
        let mut created = false;
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
            created = true;
        } else if !dir.is_dir() {
            return Err(PartError::BadDirectory(dir.to_path_buf()));
        }
        let result = Partition::from_dir_inner(dir, config, fm);
        if result.is_err() && created {
            let _ = std::fs::remove_dir_all(dir);
        }
        result
    }

    fn from_dir_inner(
        dir: &Path,
        config: &Config,
        fm: Arc<FileManager>,
    ) -> PartResult<Arc<Partition>> {
        let info = match header::read_header(dir) {
            Ok(info) => info,
            Err(PartError::HeaderNotFound(_)) if dir_is_empty(dir) => {
                debug!("creating empty partition in {:?}", dir);
                let info = HeaderInfo {
                    timestamp: epoch_now(),
                    ..HeaderInfo::default()
                };
                header::write_header(dir, &info)?;
                header::read_header(dir)?
            }
            Err(e) => return Err(e),
        };
        let rows = info.rows as usize;

        let mask = load_row_mask(dir, rows);
        let part = Partition::assemble(info, dir.to_path_buf(), mask, config, fm);
        part.store_mask()?;
        let part = Arc::new(part);
        part.register_cleaner();

        if config.use_backup_dir(&part.name()) {
            let backup = part
                .backup_dir()
                .or_else(|| config.backup_dir(Some(&part.name())))
                .unwrap_or_else(|| derive_backup_name(dir));
            if backup == dir {
                return Err(PartError::Inconsistent(format!(
                    "active and backup directory are both {:?}",
                    dir
                )));
            }
            {
                let mut meta = part.meta.write().unwrap();
                meta.backup_dir = Some(backup);
            }
            part.write_header()?;
            if !verify_backup(&part)? {
                info!("backup of {} needs refresh", part.name());
                make_backup_copy(&part);
            }
        }
        Ok(part)
    }

    /// Builds the partition directory name from meta tags and defers to the
    /// directory constructor.
    pub fn from_meta_tags(
        tags: &[(String, String)],
        config: &Config,
        fm: Arc<FileManager>,
    ) -> PartResult<Arc<Partition>> {
        let name = dir_name_from_tags(tags);
        let base = config
            .data_dir(Some(&name))
            .ok_or_else(|| PartError::BadDirectory(PathBuf::from("<dataDir unset>")))?;
        let dir = base.join(&name);
        let part = Partition::from_dir(&dir, config, fm)?;
        if part.nrows() == 0 && part.meta_tags().is_empty() {
            {
                let mut meta = part.meta.write().unwrap();
                meta.name = name;
                meta.meta_tags = tags.to_vec();
            }
            part.write_header()?;
        }
        Ok(part)
    }
}

fn dir_is_empty(dir: &Path) -> bool {
    dir.read_dir()
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

/// Reads the row mask, repairing its size against the row count. A missing
/// file means every row is active.
fn load_row_mask(dir: &Path, rows: usize) -> Bitmap {
    let path = dir.join(MASK_FILE);
    match Bitmap::read_from(&path) {
        Ok(mut mask) => {
            if mask.size() != rows {
                warn!(
                    "row mask in {:?} has {} bits, expected {}; repairing",
                    dir,
                    mask.size(),
                    rows
                );
                mask.adjust_size(rows, true);
            }
            mask
        }
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Bitmap::ones(rows),
        Err(e) => {
            warn!("unreadable row mask in {:?}: {}; assuming all active", dir, e);
            Bitmap::ones(rows)
        }
    }
}

/// Derives a peer directory name: strip trailing digits from the active
/// name, then append the first counter for which the path does not exist.
pub fn derive_backup_name(active: &Path) -> PathBuf {
    let name = active
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = name.trim_end_matches(|c: char| c.is_ascii_digit());
    let parent = active.parent().unwrap_or_else(|| Path::new("."));
    let mut counter = 1u32;
    loop {
        let candidate = parent.join(format!("{}{}", stem, counter));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Whether the backup directory agrees with this partition: its header must
/// link back to the active directory and match in row and column count.
pub fn verify_backup(part: &Partition) -> PartResult<bool> {
    let backup = match part.backup_dir() {
        Some(dir) => dir,
        None => return Ok(false),
    };
    if backup == part.active_dir() {
        return Err(PartError::Inconsistent(format!(
            "backup directory {:?} equals the active directory",
            backup
        )));
    }
    match header::read_header(&backup) {
        Ok(info) => Ok(info.alt_dir.as_deref() == Some(part.active_dir())
            && info.rows as usize == part.nrows()
            && info.columns.len() == part.ncols()),
        Err(PartError::HeaderNotFound(_)) => Ok(false),
        Err(e) => {
            warn!("cannot verify backup {:?}: {}", backup, e);
            Ok(false)
        }
    }
}

/// Refreshes the backup directory in a detached background task. On
/// success the partition ends in the Stable state.
pub fn make_backup_copy(part: &Arc<Partition>) {
    if let Err(e) = part.set_state(PartState::PreTransition) {
        warn!("cannot record transition state: {}", e);
    }
    let part = part.clone();
    COPY_POOL.execute(move || {
        let code = copy_task(&part);
        if code != 0 {
            error!("backup copy of {} failed with code {}", part.name(), code);
            part.inc_errors();
        }
    });
}

fn copy_task(part: &Arc<Partition>) -> i32 {
    let _blocked = SignalBlock::new();
    if part.set_state(PartState::Transitioning).is_err() {
        return PartError::Inconsistent(String::new()).code();
    }
    let code = {
        // pin the source metadata for the duration of the copy
        let _src = part.meta.read().unwrap();
        let backup = match _src.backup_dir.clone() {
            Some(dir) => dir,
            None => return PartError::BadDirectory(PathBuf::new()).code(),
        };
        match copy_partition_dir(part.active_dir(), &backup) {
            Ok(()) => match patch_backup_header(part.active_dir(), &backup) {
                Ok(()) => 0,
                Err(e) => {
                    warn!("failed to patch backup header: {}", e);
                    e.code()
                }
            },
            Err(e) => {
                warn!("backup copy failed: {}", e);
                e.code()
            }
        }
    };
    if code == 0 {
        if part.set_state(PartState::PostTransition).is_err()
            || part.set_state(PartState::Stable).is_err()
        {
            return PartError::Inconsistent(String::new()).code();
        }
        info!("backup of {} refreshed", part.name());
    }
    code
}

/// Removes the destination under the environment lock, then copies the
/// source tree file by file.
fn copy_partition_dir(src: &Path, dst: &Path) -> PartResult<()> {
    {
        let _env = ENV_LOCK.lock().unwrap();
        if dst.exists() {
            std::fs::remove_dir_all(dst)?;
        }
        std::fs::create_dir_all(dst)?;
    }
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| {
            PartError::Io(e.into_io_error().unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "walkdir error")
            }))
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields children of src");
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// The copied header still points at the source; relink it to form a peer
/// pair and mark the copy stable.
fn patch_backup_header(active: &Path, backup: &Path) -> PartResult<()> {
    let mut info = header::read_header(backup)?;
    info.alt_dir = Some(active.to_path_buf());
    info.state = PartState::Stable;
    info.columns.retain(|c| !c.is_virtual());
    header::write_header(backup, &info)
}

fn dir_name_from_tags(tags: &[(String, String)]) -> String {
    let find = |key: &str| {
        tags.iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    };
    if tags.len() == 3 {
        if let (Some(setup), Some(production), Some(scale)) = (
            find("trgSetupName"),
            find("production"),
            find("magScale"),
        ) {
            return format!("{}_{}_{}", setup, production, scale);
        }
    }
    tags.iter().map(|(_, value)| value.as_str()).join("_")
}

/// Blocks SIGHUP/SIGINT on the current thread, restoring the previous mask
/// on drop.
#[cfg(unix)]
struct SignalBlock {
    old: libc::sigset_t,
}

#[cfg(unix)]
impl SignalBlock {
    fn new() -> SignalBlock {
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGHUP);
            libc::sigaddset(&mut set, libc::SIGINT);
            let mut old: libc::sigset_t = std::mem::zeroed();
            libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut old);
            SignalBlock { old }
        }
    }
}

#[cfg(unix)]
impl Drop for SignalBlock {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.old, std::ptr::null_mut());
        }
    }
}

#[cfg(not(unix))]
struct SignalBlock;

#[cfg(not(unix))]
impl SignalBlock {
    fn new() -> SignalBlock {
        SignalBlock
    }
}
