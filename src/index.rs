//! Contract between columns and bitmap index implementations, plus the one
//! built-in binned index. Anything fancier lives outside this crate; only
//! load/unload/query is relied on here.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use itertools::Itertools;

use crate::bitmap::Bitmap;
use crate::errors::PartResult;
use crate::scan::predicate::RangePred;
use crate::scan::CompiledPred;

const INDEX_MAGIC: u32 = 0x5042_4958; // "XIBP"

pub trait ColumnIndex: Send + Sync {
    fn spec(&self) -> &str;

    /// Exact hit bitmap, if the index can produce one without a scan.
    fn evaluate(&self, range: &RangePred) -> Option<Bitmap>;

    /// Bracketing bitmaps with `low ⊆ answer ⊆ high`.
    fn estimate(&self, range: &RangePred) -> (Bitmap, Bitmap);

    /// Scalar cost hint: number of index rows that must be inspected.
    fn estimate_cost(&self, range: &RangePred) -> f64;

    /// Fraction of rows the index cannot decide plus the bitmap of them.
    fn undecidable(&self, range: &RangePred) -> (f32, Bitmap);

    fn size_bytes(&self) -> usize;

    fn write(&self, path: &Path) -> PartResult<()>;

    /// Dumps the index bitmaps in CSR text form (offsets line, then set
    /// positions per bitmap).
    fn export_csr(&self, out: &mut dyn Write) -> std::io::Result<()>;
}

/// Builds an index for `spec` over the column's values in the double
/// domain. Unknown specs yield `None` and a warning; evaluation then falls
/// back to scans.
pub fn build_index(spec: &str, values: &[f64], rows: usize) -> Option<Box<dyn ColumnIndex>> {
    let normalized = spec.trim().to_ascii_lowercase();
    if normalized.is_empty() || normalized == "none" {
        return None;
    }
    if normalized.contains("bin") || normalized.contains("equality") || normalized == "default" {
        return Some(Box::new(BinnedIndex::build(spec, values, rows)));
    }
    warn!("unknown index spec {:?}, falling back to scans", spec);
    None
}

pub fn load_index(spec: &str, path: &Path) -> PartResult<Option<Box<dyn ColumnIndex>>> {
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(Box::new(BinnedIndex::read(spec, path)?)))
}

/// Equality-binned bitmap index: ascending bin edges with one bitmap per
/// bin. When every bin holds a single distinct value the index answers any
/// continuous range exactly.
pub struct BinnedIndex {
    spec: String,
    edges: Vec<f64>,
    bins: Vec<Bitmap>,
    exact_values: bool,
    rows: usize,
}

const MAX_EXACT_BINS: usize = 256;

impl BinnedIndex {
    pub fn build(spec: &str, values: &[f64], rows: usize) -> BinnedIndex {
        let mut distinct: Vec<f64> = values
            .iter()
            .copied()
            .filter(|v| !v.is_nan())
            .sorted_by(|a, b| a.partial_cmp(b).unwrap())
            .dedup()
            .collect();
        let (edges, exact_values) = if distinct.len() <= MAX_EXACT_BINS {
            (std::mem::take(&mut distinct), true)
        } else {
            // equi-width bins over the observed range
            let lo = distinct[0];
            let hi = distinct[distinct.len() - 1];
            let step = (hi - lo) / MAX_EXACT_BINS as f64;
            let mut edges: Vec<f64> = (0..MAX_EXACT_BINS).map(|i| lo + step * i as f64).collect();
            edges.push(hi);
            edges.dedup();
            (edges, false)
        };
        let mut bins = vec![Bitmap::new(rows); if exact_values { edges.len() } else { edges.len().saturating_sub(1) }];
        for (row, &v) in values.iter().enumerate() {
            if v.is_nan() {
                continue;
            }
            if let Some(b) = Self::bin_of(&edges, exact_values, v) {
                bins[b].set(row);
            }
        }
        BinnedIndex {
            spec: spec.to_string(),
            edges,
            bins,
            exact_values,
            rows,
        }
    }

    fn bin_of(edges: &[f64], exact: bool, v: f64) -> Option<usize> {
        if exact {
            edges.binary_search_by(|e| e.partial_cmp(&v).unwrap()).ok()
        } else if edges.len() < 2 {
            None
        } else {
            let last = edges.len() - 2;
            let i = edges.partition_point(|&e| e <= v);
            // values at or above the final edge land in the last bin
            Some(i.saturating_sub(1).min(last))
        }
    }

    /// Lower/upper f64 extent of bin `i`.
    fn bin_extent(&self, i: usize) -> (f64, f64) {
        if self.exact_values {
            (self.edges[i], self.edges[i])
        } else {
            (self.edges[i], self.edges[i + 1])
        }
    }

    fn classify(&self, range: &RangePred) -> (Bitmap, Bitmap, Bitmap) {
        // (sure hits, maybe hits, sure plus maybe)
        let pred = CompiledPred::<f64>::from_range(range);
        let mut low = Bitmap::new(self.rows);
        let mut maybe = Bitmap::new(self.rows);
        for (i, bin) in self.bins.iter().enumerate() {
            let (a, b) = self.bin_extent(i);
            if self.exact_values {
                if pred.matches(a) {
                    low.or(bin);
                }
            } else if range.covers(a, b) {
                low.or(bin);
            } else if !range.disjoint_from(a, b) {
                maybe.or(bin);
            }
        }
        let mut high = low.clone();
        high.or(&maybe);
        (low, maybe, high)
    }
}

impl ColumnIndex for BinnedIndex {
    fn spec(&self) -> &str {
        &self.spec
    }

    fn evaluate(&self, range: &RangePred) -> Option<Bitmap> {
        let (low, maybe, _) = self.classify(range);
        if maybe.is_empty() {
            Some(low)
        } else {
            None
        }
    }

    fn estimate(&self, range: &RangePred) -> (Bitmap, Bitmap) {
        let (low, _, high) = self.classify(range);
        (low, high)
    }

    fn estimate_cost(&self, range: &RangePred) -> f64 {
        let (_, maybe, _) = self.classify(range);
        maybe.count() as f64
    }

    fn undecidable(&self, range: &RangePred) -> (f32, Bitmap) {
        let (_, maybe, _) = self.classify(range);
        let frac = if self.rows == 0 {
            0.0
        } else {
            maybe.count() as f32 / self.rows as f32
        };
        (frac, maybe)
    }

    fn size_bytes(&self) -> usize {
        self.edges.len() * 8 + self.bins.iter().map(|b| b.iter_runs().count() * 16).sum::<usize>()
    }

    fn write(&self, path: &Path) -> PartResult<()> {
        let mut w = BufWriter::new(File::create(path)?);
        w.write_u32::<LittleEndian>(INDEX_MAGIC)?;
        w.write_u8(self.exact_values as u8)?;
        w.write_u64::<LittleEndian>(self.rows as u64)?;
        w.write_u32::<LittleEndian>(self.edges.len() as u32)?;
        for &e in &self.edges {
            w.write_f64::<LittleEndian>(e)?;
        }
        w.write_u32::<LittleEndian>(self.bins.len() as u32)?;
        for bin in &self.bins {
            bin.write_into(&mut w)?;
        }
        w.flush()?;
        Ok(())
    }

    fn export_csr(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let mut offset = 0usize;
        let mut offsets: Vec<usize> = self
            .bins
            .iter()
            .map(|b| {
                let o = offset;
                offset += b.count();
                o
            })
            .collect();
        offsets.push(offset);
        writeln!(out, "{}", offsets.iter().join(" "))?;
        for bin in &self.bins {
            writeln!(out, "{}", bin.iter().join(" "))?;
        }
        Ok(())
    }
}

impl BinnedIndex {
    pub fn read(spec: &str, path: &Path) -> PartResult<BinnedIndex> {
        let mut r = BufReader::new(File::open(path)?);
        let magic = r.read_u32::<LittleEndian>()?;
        if magic != INDEX_MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad index magic {:#x}", magic),
            )
            .into());
        }
        let exact_values = r.read_u8()? != 0;
        let rows = r.read_u64::<LittleEndian>()? as usize;
        let nedges = r.read_u32::<LittleEndian>()? as usize;
        let mut edges = Vec::with_capacity(nedges);
        for _ in 0..nedges {
            edges.push(r.read_f64::<LittleEndian>()?);
        }
        let nbins = r.read_u32::<LittleEndian>()? as usize;
        let mut bins = Vec::with_capacity(nbins);
        for _ in 0..nbins {
            bins.push(Bitmap::read_into(&mut r)?);
        }
        Ok(BinnedIndex {
            spec: spec.to_string(),
            edges,
            bins,
            exact_values,
            rows,
        })
    }
}
