//! Row identifiers and the sorted-RID file. A RID is a 64-bit value viewed
//! as a (run, event) pair; `rids.srt` holds (run, event, row) triples sorted
//! by (run, event) so RIDs can be resolved without loading the full array.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::bitmap::Bitmap;
use crate::errors::{PartError, PartResult};
use crate::file_manager::{FileManager, ManagedFile};

pub const RID_FILE: &str = "rids";
pub const SORTED_RID_FILE: &str = "rids.srt";

const TRIPLE_BYTES: usize = 12;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rid(u64);

impl Rid {
    pub fn new(run: u32, event: u32) -> Rid {
        Rid(((run as u64) << 32) | event as u64)
    }

    pub fn from_value(value: u64) -> Rid {
        Rid(value)
    }

    pub fn run(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn event(self) -> u32 {
        self.0 as u32
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Rid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {})", self.run(), self.event())
    }
}

/// Reads the RID array. A missing file yields `None`; a wrong-sized file is
/// treated as absent with a warning.
pub fn read_rids(dir: &Path, rows: usize) -> PartResult<Option<Vec<Rid>>> {
    let path = dir.join(RID_FILE);
    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if data.len() != rows * 8 {
        warn!(
            "{:?} has {} bytes, expected {}; ignoring",
            path,
            data.len(),
            rows * 8
        );
        return Ok(None);
    }
    Ok(Some(
        data.chunks_exact(8)
            .map(|c| Rid::from_value(LittleEndian::read_u64(c)))
            .collect(),
    ))
}

pub fn write_rids(dir: &Path, rids: &[Rid]) -> PartResult<()> {
    let mut w = BufWriter::new(File::create(dir.join(RID_FILE))?);
    let mut buf = [0u8; 8];
    for rid in rids {
        LittleEndian::write_u64(&mut buf, rid.value());
        w.write_all(&buf)?;
    }
    w.flush()?;
    Ok(())
}

/// Synthesizes RIDs when absent: one fresh run number from the file
/// manager's beat, the row index as event. Writes both `rids` and
/// `rids.srt`.
pub fn fill_rids(dir: &Path, rows: usize, fm: &FileManager) -> PartResult<Vec<Rid>> {
    let run = fm.beat();
    let rids: Vec<Rid> = (0..rows).map(|row| Rid::new(run, row as u32)).collect();
    write_rids(dir, &rids)?;
    write_sorted(dir, &rids)?;
    Ok(rids)
}

/// Whether `rids.srt` exists with the expected 12N size.
pub fn sorted_file_ok(dir: &Path, rows: usize) -> bool {
    std::fs::metadata(dir.join(SORTED_RID_FILE))
        .map(|m| m.len() == (rows * TRIPLE_BYTES) as u64)
        .unwrap_or(false)
}

/// Writes the sorted triple file. A no-op when the file already has the
/// expected size; callers serialize through the partition mutex.
pub fn sort_rids(dir: &Path, rids: &[Rid]) -> PartResult<()> {
    if sorted_file_ok(dir, rids.len()) {
        return Ok(());
    }
    write_sorted(dir, rids)
}

fn write_sorted(dir: &Path, rids: &[Rid]) -> PartResult<()> {
    let mut order: Vec<(Rid, u32)> = rids
        .iter()
        .enumerate()
        .map(|(row, &rid)| (rid, row as u32))
        .collect();
    order.sort_by_key(|&(rid, _)| rid);
    let mut w = BufWriter::new(File::create(dir.join(SORTED_RID_FILE))?);
    let mut buf = [0u8; TRIPLE_BYTES];
    for (rid, row) in order {
        LittleEndian::write_u32(&mut buf[0..4], rid.run());
        LittleEndian::write_u32(&mut buf[4..8], rid.event());
        LittleEndian::write_u32(&mut buf[8..12], row);
        w.write_all(&buf)?;
    }
    w.flush()?;
    Ok(())
}

/// Read access to the sorted triple file. Lookups are scattered point
/// reads over a small file, the access pattern the mmap preference exists
/// for, so the file is read through a shared mapping.
pub struct SortedRids {
    file: Arc<ManagedFile>,
    map: Arc<memmap2::Mmap>,
    len: usize,
}

impl SortedRids {
    pub fn open(fm: &Arc<FileManager>, dir: &Path, rows: usize) -> PartResult<SortedRids> {
        let path = dir.join(SORTED_RID_FILE);
        let file = fm.open(&path)?;
        let size = file.len()?;
        if size != (rows * TRIPLE_BYTES) as u64 {
            return Err(PartError::BadFileSize {
                path,
                size,
                expected: (rows * TRIPLE_BYTES) as u64,
            });
        }
        let map = file.map()?;
        file.begin_use();
        Ok(SortedRids {
            file,
            map,
            len: rows,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, i: usize) -> (Rid, u32) {
        let triple = &self.map[i * TRIPLE_BYTES..(i + 1) * TRIPLE_BYTES];
        let run = LittleEndian::read_u32(&triple[0..4]);
        let event = LittleEndian::read_u32(&triple[4..8]);
        let row = LittleEndian::read_u32(&triple[8..12]);
        (Rid::new(run, event), row)
    }

    /// Binary search by (run, event); returns the row position on a hit.
    pub fn find(&self, rid: Rid) -> Option<u32> {
        let mut lo = 0usize;
        let mut hi = self.len;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (found, row) = self.get(mid);
            match found.cmp(&rid) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(row),
            }
        }
        None
    }

    /// Two-pointer merge of a sorted RID set against the file, setting the
    /// row bit in `out` for every match.
    pub fn merge_into(&self, sorted_set: &[Rid], out: &mut Bitmap) {
        debug_assert!(sorted_set.windows(2).all(|w| w[0] <= w[1]));
        let mut set_idx = 0;
        for i in 0..self.len {
            if set_idx >= sorted_set.len() {
                break;
            }
            let (rid, row) = self.get(i);
            while set_idx < sorted_set.len() && sorted_set[set_idx] < rid {
                set_idx += 1;
            }
            if set_idx < sorted_set.len() && sorted_set[set_idx] == rid {
                out.set(row as usize);
            }
        }
    }
}

impl Drop for SortedRids {
    fn drop(&mut self) {
        self.file.end_use();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rid_pair_view() {
        let rid = Rid::new(7, 42);
        assert_eq!(rid.run(), 7);
        assert_eq!(rid.event(), 42);
        assert_eq!(Rid::from_value(rid.value()), rid);
        assert!(Rid::new(0, 9) < Rid::new(1, 0));
        assert!(Rid::new(1, 1) < Rid::new(1, 2));
    }

    #[test]
    fn sorted_file_roundtrip_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let rids = vec![
            Rid::new(1, 1),
            Rid::new(0, 2),
            Rid::new(0, 0),
            Rid::new(1, 0),
            Rid::new(0, 1),
        ];
        write_rids(dir.path(), &rids).unwrap();
        sort_rids(dir.path(), &rids).unwrap();
        assert!(sorted_file_ok(dir.path(), 5));

        let fm = FileManager::new();
        let sorted = SortedRids::open(&fm, dir.path(), 5).unwrap();
        // every RID resolves back to its original row
        for (row, &rid) in rids.iter().enumerate() {
            assert_eq!(sorted.find(rid), Some(row as u32));
        }
        assert_eq!(sorted.find(Rid::new(9, 9)), None);
    }

    #[test]
    fn sort_is_idempotent_on_good_file() {
        let dir = tempfile::tempdir().unwrap();
        let rids: Vec<Rid> = (0..10).map(|i| Rid::new(0, i as u32)).collect();
        sort_rids(dir.path(), &rids).unwrap();
        let before = std::fs::metadata(dir.path().join(SORTED_RID_FILE))
            .unwrap()
            .modified()
            .unwrap();
        sort_rids(dir.path(), &rids).unwrap();
        let after = std::fs::metadata(dir.path().join(SORTED_RID_FILE))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn merge_matches_scenario() {
        // rids = [(0,0),(0,1),(0,2),(1,0),(1,1)]; query {(1,0),(0,2)} -> rows {2,3}
        let dir = tempfile::tempdir().unwrap();
        let rids = vec![
            Rid::new(0, 0),
            Rid::new(0, 1),
            Rid::new(0, 2),
            Rid::new(1, 0),
            Rid::new(1, 1),
        ];
        sort_rids(dir.path(), &rids).unwrap();
        let fm = FileManager::new();
        let sorted = SortedRids::open(&fm, dir.path(), 5).unwrap();
        let mut query = vec![Rid::new(1, 0), Rid::new(0, 2)];
        query.sort();
        let mut out = Bitmap::new(5);
        sorted.merge_into(&query, &mut out);
        assert_eq!(out.iter().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn fill_synthesizes_row_events() {
        let dir = tempfile::tempdir().unwrap();
        let fm = FileManager::new();
        let rids = fill_rids(dir.path(), 4, &fm).unwrap();
        assert_eq!(rids.len(), 4);
        assert!(rids.iter().enumerate().all(|(i, r)| r.event() == i as u32));
        assert!(rids.windows(2).all(|w| w[0].run() == w[1].run()));
        let back = read_rids(dir.path(), 4).unwrap().unwrap();
        assert_eq!(back, rids);
        assert!(sorted_file_ok(dir.path(), 4));
    }
}
