//! Run-compressed bitmaps. Scan results and row masks are kept compressed;
//! a dense byte-vector representation is used transiently when a scan is
//! expected to set a large fraction of bits.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

const MASK_MAGIC: u32 = 0x504d_5342; // "BSMP"

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Run {
    pub start: usize,
    pub len: usize,
}

impl Run {
    #[inline]
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Compressed bit sequence of fixed logical length. Internally a sorted list
/// of disjoint, non-adjacent runs of set bits.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Bitmap {
    size: usize,
    runs: Vec<Run>,
}

impl Bitmap {
    pub fn new(size: usize) -> Bitmap {
        Bitmap { size, runs: vec![] }
    }

    /// Single run of set bits within a bitmap of the given length.
    pub fn from_run(start: usize, len: usize, size: usize) -> Bitmap {
        debug_assert!(start + len <= size);
        let runs = if len > 0 { vec![Run { start, len }] } else { vec![] };
        Bitmap { size, runs }
    }

    pub fn ones(size: usize) -> Bitmap {
        let runs = if size > 0 {
            vec![Run { start: 0, len: size }]
        } else {
            vec![]
        };
        Bitmap { size, runs }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.runs.iter().map(|r| r.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn is_set(&self, idx: usize) -> bool {
        let i = self.runs.partition_point(|r| r.end() <= idx);
        i < self.runs.len() && self.runs[i].start <= idx
    }

    pub fn set(&mut self, idx: usize) {
        if idx >= self.size {
            self.size = idx + 1;
        }
        let i = self.runs.partition_point(|r| r.end() < idx);
        if i < self.runs.len() {
            let r = self.runs[i];
            if r.start <= idx && idx < r.end() {
                return;
            }
            if r.end() == idx {
                self.runs[i].len += 1;
                if i + 1 < self.runs.len() && self.runs[i + 1].start == idx + 1 {
                    self.runs[i].len += self.runs[i + 1].len;
                    self.runs.remove(i + 1);
                }
                return;
            }
            if r.start == idx + 1 {
                self.runs[i].start = idx;
                self.runs[i].len += 1;
                return;
            }
        }
        self.runs.insert(i, Run { start: idx, len: 1 });
    }

    pub fn unset(&mut self, idx: usize) {
        let i = self.runs.partition_point(|r| r.end() <= idx);
        if i >= self.runs.len() || self.runs[i].start > idx {
            return;
        }
        let r = self.runs[i];
        let left = idx - r.start;
        let right = r.end() - idx - 1;
        match (left, right) {
            (0, 0) => {
                self.runs.remove(i);
            }
            (0, _) => {
                self.runs[i].start = idx + 1;
                self.runs[i].len = right;
            }
            (_, 0) => {
                self.runs[i].len = left;
            }
            (_, _) => {
                self.runs[i].len = left;
                self.runs.insert(
                    i + 1,
                    Run {
                        start: idx + 1,
                        len: right,
                    },
                );
            }
        }
    }

    /// Truncates or extends the logical size. When extending, `fill` decides
    /// whether the new tail is set or clear.
    pub fn adjust_size(&mut self, size: usize, fill: bool) {
        if size < self.size {
            let i = self.runs.partition_point(|r| r.end() <= size);
            self.runs.truncate(i + 1);
            if let Some(last) = self.runs.last_mut() {
                if last.start >= size {
                    self.runs.pop();
                } else if last.end() > size {
                    last.len = size - last.start;
                }
            }
        } else if size > self.size && fill {
            let start = self.size;
            match self.runs.last_mut() {
                Some(last) if last.end() == start => last.len += size - start,
                _ => self.runs.push(Run {
                    start,
                    len: size - start,
                }),
            }
        }
        self.size = size;
    }

    /// Iterator over the index set: maximal runs of consecutive set bits.
    /// A run of length one is a singleton.
    pub fn iter_runs(&self) -> impl Iterator<Item = Run> + '_ {
        self.runs.iter().copied()
    }

    /// Iterator over the positions of all set bits.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.runs.iter().flat_map(|r| r.start..r.end())
    }

    pub fn and(&mut self, other: &Bitmap) {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.runs.len() && j < other.runs.len() {
            let a = self.runs[i];
            let b = other.runs[j];
            let lo = a.start.max(b.start);
            let hi = a.end().min(b.end());
            if lo < hi {
                out.push(Run {
                    start: lo,
                    len: hi - lo,
                });
            }
            if a.end() <= b.end() {
                i += 1;
            } else {
                j += 1;
            }
        }
        self.runs = out;
    }

    pub fn or(&mut self, other: &Bitmap) {
        if other.runs.is_empty() {
            self.size = self.size.max(other.size);
            return;
        }
        let mut out: Vec<Run> = Vec::with_capacity(self.runs.len() + other.runs.len());
        let (mut i, mut j) = (0, 0);
        loop {
            let next = match (self.runs.get(i), other.runs.get(j)) {
                (Some(&a), Some(&b)) => {
                    if a.start <= b.start {
                        i += 1;
                        a
                    } else {
                        j += 1;
                        b
                    }
                }
                (Some(&a), None) => {
                    i += 1;
                    a
                }
                (None, Some(&b)) => {
                    j += 1;
                    b
                }
                (None, None) => break,
            };
            match out.last_mut() {
                Some(last) if last.end() >= next.start => {
                    last.len = last.len.max(next.end() - last.start);
                }
                _ => out.push(next),
            }
        }
        self.runs = out;
        self.size = self.size.max(other.size);
    }

    /// Removes all bits that are set in `other`.
    pub fn and_not(&mut self, other: &Bitmap) {
        if other.runs.is_empty() {
            return;
        }
        let mut out = Vec::with_capacity(self.runs.len() + other.runs.len());
        let mut j = 0;
        for &a in &self.runs {
            let mut lo = a.start;
            let end = a.end();
            while j < other.runs.len() && other.runs[j].end() <= lo {
                j += 1;
            }
            let mut k = j;
            while lo < end {
                match other.runs.get(k) {
                    Some(&b) if b.start < end => {
                        if b.start > lo {
                            out.push(Run {
                                start: lo,
                                len: b.start - lo,
                            });
                        }
                        lo = lo.max(b.end());
                        k += 1;
                    }
                    _ => {
                        out.push(Run {
                            start: lo,
                            len: end - lo,
                        });
                        break;
                    }
                }
            }
        }
        self.runs = out;
    }

    /// Complements all bits within the logical size.
    pub fn flip(&mut self) {
        let mut out = Vec::with_capacity(self.runs.len() + 1);
        let mut lo = 0;
        for &r in &self.runs {
            if r.start > lo {
                out.push(Run {
                    start: lo,
                    len: r.start - lo,
                });
            }
            lo = r.end();
        }
        if lo < self.size {
            out.push(Run {
                start: lo,
                len: self.size - lo,
            });
        }
        self.runs = out;
    }

    pub fn is_subset(&self, other: &Bitmap) -> bool {
        let mut j = 0;
        for &a in &self.runs {
            while j < other.runs.len() && other.runs[j].end() < a.end() {
                j += 1;
            }
            match other.runs.get(j) {
                Some(&b) if b.start <= a.start && a.end() <= b.end() => {}
                _ => return false,
            }
        }
        true
    }

    pub fn from_dense(bits: &[u8], size: usize) -> Bitmap {
        let mut runs = Vec::new();
        let mut run_start = None;
        for idx in 0..size {
            let set = bits
                .get(idx >> 3)
                .map(|byte| byte & (1 << (idx as u8 & 7)) > 0)
                .unwrap_or(false);
            match (set, run_start) {
                (true, None) => run_start = Some(idx),
                (false, Some(start)) => {
                    runs.push(Run {
                        start,
                        len: idx - start,
                    });
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            runs.push(Run {
                start,
                len: size - start,
            });
        }
        Bitmap { size, runs }
    }

    pub fn to_dense(&self) -> Vec<u8> {
        let mut bits = vec![0u8; self.size.div_ceil(8)];
        for idx in self.iter() {
            bits[idx >> 3] |= 1 << (idx as u8 & 7);
        }
        bits
    }

    pub fn write_into(&self, w: &mut impl Write) -> std::io::Result<()> {
        w.write_u32::<LittleEndian>(MASK_MAGIC)?;
        w.write_u64::<LittleEndian>(self.size as u64)?;
        w.write_u32::<LittleEndian>(self.runs.len() as u32)?;
        for r in &self.runs {
            w.write_u64::<LittleEndian>(r.start as u64)?;
            w.write_u64::<LittleEndian>(r.len as u64)?;
        }
        Ok(())
    }

    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        self.write_into(&mut w)?;
        w.flush()
    }

    pub fn read_into(r: &mut impl Read) -> std::io::Result<Bitmap> {
        let magic = r.read_u32::<LittleEndian>()?;
        if magic != MASK_MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad mask magic {:#x}", magic),
            ));
        }
        let size = r.read_u64::<LittleEndian>()? as usize;
        let nruns = r.read_u32::<LittleEndian>()? as usize;
        let mut runs = Vec::with_capacity(nruns);
        let mut last_end = 0;
        for _ in 0..nruns {
            let start = r.read_u64::<LittleEndian>()? as usize;
            let len = r.read_u64::<LittleEndian>()? as usize;
            if len == 0 || (start < last_end && last_end > 0) || start + len > size {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "mask runs out of order",
                ));
            }
            last_end = start + len;
            runs.push(Run { start, len });
        }
        Ok(Bitmap { size, runs })
    }

    pub fn read_from(path: &Path) -> std::io::Result<Bitmap> {
        let mut r = BufReader::new(File::open(path)?);
        let bm = Bitmap::read_into(&mut r)?;
        let mut extra = Vec::new();
        r.read_to_end(&mut extra)?;
        if !extra.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "trailing bytes in mask file",
            ));
        }
        Ok(bm)
    }
}

impl FromIterator<usize> for Bitmap {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Bitmap {
        let mut bm = Bitmap::new(0);
        for idx in iter {
            bm.set(idx);
        }
        bm
    }
}

/// Uncompressed bit vector used while building dense scan results.
pub struct DenseBits {
    bits: Vec<u8>,
    size: usize,
}

impl DenseBits {
    pub fn new(size: usize) -> DenseBits {
        DenseBits {
            bits: vec![0u8; size.div_ceil(8)],
            size,
        }
    }

    #[inline]
    pub fn set(&mut self, idx: usize) {
        self.bits[idx >> 3] |= 1 << (idx as u8 & 7);
    }

    #[inline]
    pub fn is_set(&self, idx: usize) -> bool {
        self.bits[idx >> 3] & (1 << (idx as u8 & 7)) > 0
    }

    pub fn compress(self) -> Bitmap {
        Bitmap::from_dense(&self.bits, self.size)
    }
}
