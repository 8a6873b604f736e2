//! Typed sequential scans over in-memory arrays or column data files,
//! producing compressed bitmaps of matching row positions.
//!
//! The dispatch boundary is a match over the column's scalar type; below it
//! every kernel is generic over the element type.

pub mod predicate;
pub mod reader;

use crate::bitmap::{Bitmap, DenseBits, Run};
use crate::errors::{PartError, PartResult};
use crate::file_manager::PAGE_SIZE;

use self::predicate::{ArithPred, Barrel, Bound, DiscretePred, RangePred};
use self::reader::ScanReader;

/// Scalar element type a scan kernel can be instantiated over.
pub trait ScanVal: Copy + PartialOrd + Send + Sync + 'static {
    const SIZE: usize;
    const INTEGRAL: bool;
    const MIN_F: f64;
    const MAX_F: f64;

    fn from_le(bytes: &[u8]) -> Self;
    fn to_f64(self) -> f64;
    /// Saturating cast from the double domain.
    fn from_f64(v: f64) -> Self;
}

macro_rules! impl_scanval {
    ($t:ty, $integral:expr) => {
        impl ScanVal for $t {
            const SIZE: usize = std::mem::size_of::<$t>();
            const INTEGRAL: bool = $integral;
            const MIN_F: f64 = <$t>::MIN as f64;
            const MAX_F: f64 = <$t>::MAX as f64;

            #[inline]
            fn from_le(bytes: &[u8]) -> $t {
                <$t>::from_le_bytes(bytes.try_into().unwrap())
            }

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_f64(v: f64) -> $t {
                v as $t
            }
        }
    };
}

impl_scanval!(i8, true);
impl_scanval!(u8, true);
impl_scanval!(i16, true);
impl_scanval!(u16, true);
impl_scanval!(i32, true);
impl_scanval!(u32, true);
impl_scanval!(i64, true);
impl_scanval!(u64, true);
impl_scanval!(f32, false);
impl_scanval!(f64, false);

/// One side of a compiled range in the element domain. Integer targets only
/// ever see inclusive bounds after folding.
#[derive(Clone, Copy, Debug)]
pub enum CBound<T> {
    Unbounded,
    Incl(T),
    Excl(T),
}

#[derive(Clone, Debug)]
pub enum CompiledPred<T> {
    All,
    Empty,
    Range { lo: CBound<T>, hi: CBound<T> },
    Set(Vec<T>),
}

enum Fold<T> {
    Value(T),
    Unbounded,
    Empty,
}

/// Nearest representable integer bound at or above `b`.
fn fold_lo<T: ScanVal>(b: f64, inclusive: bool) -> Fold<T> {
    if b.is_nan() {
        return Fold::Empty;
    }
    let f = if inclusive { b.ceil() } else { b.floor() + 1.0 };
    if f > T::MAX_F {
        Fold::Empty
    } else if f < T::MIN_F {
        Fold::Unbounded
    } else {
        Fold::Value(T::from_f64(f))
    }
}

/// Nearest representable integer bound at or below `b`.
fn fold_hi<T: ScanVal>(b: f64, inclusive: bool) -> Fold<T> {
    if b.is_nan() {
        return Fold::Empty;
    }
    let f = if inclusive { b.floor() } else { b.ceil() - 1.0 };
    if f < T::MIN_F {
        Fold::Empty
    } else if f > T::MAX_F {
        Fold::Unbounded
    } else {
        Fold::Value(T::from_f64(f))
    }
}

impl<T: ScanVal> CompiledPred<T> {
    pub fn from_range(r: &RangePred) -> CompiledPred<T> {
        let (lo, hi) = r.interval();
        let lo = match lo {
            Bound::Unbounded => CBound::Unbounded,
            Bound::Incl(b) | Bound::Excl(b) if T::INTEGRAL => {
                match fold_lo::<T>(b, matches!(lo, Bound::Incl(_))) {
                    Fold::Value(v) => CBound::Incl(v),
                    Fold::Unbounded => CBound::Unbounded,
                    Fold::Empty => return CompiledPred::Empty,
                }
            }
            Bound::Incl(b) => CBound::Incl(T::from_f64(b)),
            Bound::Excl(b) => CBound::Excl(T::from_f64(b)),
        };
        let hi = match hi {
            Bound::Unbounded => CBound::Unbounded,
            Bound::Incl(b) | Bound::Excl(b) if T::INTEGRAL => {
                match fold_hi::<T>(b, matches!(hi, Bound::Incl(_))) {
                    Fold::Value(v) => CBound::Incl(v),
                    Fold::Unbounded => CBound::Unbounded,
                    Fold::Empty => return CompiledPred::Empty,
                }
            }
            Bound::Incl(b) => CBound::Incl(T::from_f64(b)),
            Bound::Excl(b) => CBound::Excl(T::from_f64(b)),
        };
        match (lo, hi) {
            (CBound::Unbounded, CBound::Unbounded) => CompiledPred::All,
            (CBound::Incl(a), CBound::Incl(b)) if a > b => CompiledPred::Empty,
            (CBound::Incl(a) | CBound::Excl(a), CBound::Incl(b) | CBound::Excl(b))
                if !matches!((lo, hi), (CBound::Incl(_), CBound::Incl(_))) && a >= b =>
            {
                CompiledPred::Empty
            }
            _ => CompiledPred::Range { lo, hi },
        }
    }

    /// Filters the set to values representable in `T`.
    pub fn from_discrete(d: &DiscretePred) -> CompiledPred<T> {
        let mut values: Vec<T> = d
            .values
            .iter()
            .filter(|v| !v.is_nan())
            .filter(|v| !T::INTEGRAL || (v.fract() == 0.0 && **v >= T::MIN_F && **v <= T::MAX_F))
            .map(|&v| T::from_f64(v))
            .collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        values.dedup_by(|a, b| a == b);
        if values.is_empty() {
            CompiledPred::Empty
        } else {
            CompiledPred::Set(values)
        }
    }

    #[inline]
    pub fn matches(&self, v: T) -> bool {
        match self {
            CompiledPred::All => true,
            CompiledPred::Empty => false,
            CompiledPred::Range { lo, hi } => {
                (match *lo {
                    CBound::Unbounded => true,
                    CBound::Incl(b) => v >= b,
                    CBound::Excl(b) => v > b,
                }) && (match *hi {
                    CBound::Unbounded => true,
                    CBound::Incl(b) => v <= b,
                    CBound::Excl(b) => v < b,
                })
            }
            CompiledPred::Set(values) => values
                .binary_search_by(|x| x.partial_cmp(&v).unwrap_or(std::cmp::Ordering::Less))
                .is_ok(),
        }
    }
}

/// Builds the result bitmap under the representation policy: when a large
/// fraction of candidate rows is expected, work uncompressed and compress at
/// the end; otherwise append runs incrementally.
pub struct ResultBuilder {
    size: usize,
    dense: Option<DenseBits>,
    sparse: Bitmap,
}

impl ResultBuilder {
    pub fn new(size: usize, candidates: usize) -> ResultBuilder {
        if size / 256 < candidates {
            ResultBuilder {
                size,
                dense: Some(DenseBits::new(size)),
                sparse: Bitmap::new(0),
            }
        } else {
            ResultBuilder {
                size,
                dense: None,
                sparse: Bitmap::new(0),
            }
        }
    }

    #[inline]
    pub fn set(&mut self, idx: usize) {
        match self.dense {
            Some(ref mut d) => d.set(idx),
            None => self.sparse.set(idx),
        }
    }

    /// Final output is always compressed and padded to the full length.
    pub fn finish(self) -> Bitmap {
        let mut out = match self.dense {
            Some(d) => d.compress(),
            None => self.sparse,
        };
        if out.size() < self.size {
            out.adjust_size(self.size, false);
        }
        out
    }
}

fn check_source_len<T>(values: &[T], mask: &Bitmap) -> PartResult<bool> {
    if values.len() == mask.size() {
        Ok(false)
    } else if values.len() == mask.count() {
        Ok(true)
    } else {
        Err(PartError::ArraySizeMismatch {
            len: values.len(),
            rows: mask.size(),
            count: mask.count(),
        })
    }
}

/// Scans an in-memory array. The array length must equal the mask length
/// (full column) or the mask popcount (compacted). With `negate`, rows whose
/// values do NOT satisfy the predicate are returned instead.
pub fn scan_array<T: ScanVal>(
    values: &[T],
    mask: &Bitmap,
    pred: &CompiledPred<T>,
    negate: bool,
) -> PartResult<Bitmap> {
    let compact = check_source_len(values, mask)?;
    let mut out = ResultBuilder::new(mask.size(), mask.count());
    let mut offset = 0;
    for run in mask.iter_runs() {
        for i in 0..run.len {
            let row = run.start + i;
            let v = if compact {
                values[offset + i]
            } else {
                values[row]
            };
            if pred.matches(v) != negate {
                out.set(row);
            }
        }
        offset += run.len;
    }
    Ok(out.finish())
}

pub fn count_array<T: ScanVal>(
    values: &[T],
    mask: &Bitmap,
    pred: &CompiledPred<T>,
) -> PartResult<u64> {
    let compact = check_source_len(values, mask)?;
    let mut hits = 0;
    let mut offset = 0;
    for run in mask.iter_runs() {
        for i in 0..run.len {
            let v = if compact {
                values[offset + i]
            } else {
                values[run.start + i]
            };
            if pred.matches(v) {
                hits += 1;
            }
        }
        offset += run.len;
    }
    Ok(hits)
}

/// Walks the mask's index set over a file: one seek + one bounded bulk read
/// per run; consecutive singletons are read as one bracket when the bracket
/// fits the scan buffer, individually otherwise.
fn walk_file<T: ScanVal>(
    reader: &mut ScanReader,
    mask: &Bitmap,
    mut visit: impl FnMut(usize, T),
) -> PartResult<()> {
    let cap = reader.capacity_rows();
    let runs: Vec<Run> = mask.iter_runs().collect();
    let mut i = 0;
    while i < runs.len() {
        if runs[i].len > 1 {
            let mut start = runs[i].start;
            let mut remaining = runs[i].len;
            while remaining > 0 {
                let n = remaining.min(cap);
                let bytes = reader.fill(start, n)?;
                for k in 0..n {
                    visit(start + k, T::from_le(&bytes[k * T::SIZE..(k + 1) * T::SIZE]));
                }
                start += n;
                remaining -= n;
            }
            i += 1;
        } else {
            let first = i;
            while i < runs.len() && runs[i].len == 1 {
                i += 1;
            }
            let singles = &runs[first..i];
            let base = singles[0].start;
            let span = singles[singles.len() - 1].start - base + 1;
            if span <= cap {
                let bytes = reader.fill(base, span)?;
                for s in singles {
                    let k = (s.start - base) * T::SIZE;
                    visit(s.start, T::from_le(&bytes[k..k + T::SIZE]));
                }
            } else {
                for s in singles {
                    let bytes = reader.value(s.start)?;
                    visit(s.start, T::from_le(&bytes[..T::SIZE]));
                }
            }
        }
    }
    Ok(())
}

pub fn scan_file<T: ScanVal>(
    reader: &mut ScanReader,
    mask: &Bitmap,
    pred: &CompiledPred<T>,
    negate: bool,
) -> PartResult<Bitmap> {
    let mut out = ResultBuilder::new(mask.size(), mask.count());
    walk_file::<T>(reader, mask, |row, v| {
        if pred.matches(v) != negate {
            out.set(row);
        }
    })?;
    Ok(out.finish())
}

pub fn count_file<T: ScanVal>(
    reader: &mut ScanReader,
    mask: &Bitmap,
    pred: &CompiledPred<T>,
) -> PartResult<u64> {
    let mut hits = 0;
    walk_file::<T>(reader, mask, |_, v| {
        if pred.matches(v) {
            hits += 1;
        }
    })?;
    Ok(hits)
}

/// Collects the values at the mask's set positions into a fresh vector whose
/// length equals the mask popcount.
pub fn select_file<T: ScanVal>(reader: &mut ScanReader, mask: &Bitmap) -> PartResult<Vec<T>> {
    let mut out = Vec::with_capacity(mask.count());
    walk_file::<T>(reader, mask, |_, v| out.push(v))?;
    Ok(out)
}

/// Per-row value source feeding barrel scans.
pub trait ValueCursor {
    fn value_f64(&mut self, row: usize) -> PartResult<f64>;
}

/// File-backed cursor decoding one element per row.
pub struct FileCursor {
    reader: ScanReader,
    decode: fn(&[u8]) -> f64,
}

impl FileCursor {
    pub fn new(reader: ScanReader, decode: fn(&[u8]) -> f64) -> FileCursor {
        FileCursor { reader, decode }
    }
}

impl ValueCursor for FileCursor {
    fn value_f64(&mut self, row: usize) -> PartResult<f64> {
        let bytes = self.reader.value(row)?;
        Ok((self.decode)(bytes))
    }
}

/// Arithmetic scan: pulls one value per column per row through the barrel
/// and keeps rows where the predicate holds.
pub fn scan_arith(
    cursors: &mut [&mut dyn ValueCursor],
    barrel: &mut Barrel,
    pred: &ArithPred,
    mask: &Bitmap,
    negate: bool,
) -> PartResult<Bitmap> {
    let mut out = ResultBuilder::new(mask.size(), mask.count());
    for run in mask.iter_runs() {
        for row in run.start..run.end() {
            for (slot, cursor) in cursors.iter_mut().enumerate() {
                let v = cursor.value_f64(row)?;
                barrel.set(slot, v);
            }
            if pred.in_range(barrel) != negate {
                out.set(row);
            }
        }
    }
    Ok(out.finish())
}

/// Row-index passthrough: a numeric range against a row-number axis. Values
/// below zero or at/above the mask length are ignored.
pub fn row_range_hits(pred: &RangePred, mask: &Bitmap) -> Bitmap {
    let rows = mask.size();
    let compiled = CompiledPred::<i64>::from_range(pred);
    let (lo, hi) = match compiled {
        CompiledPred::All => (0, rows.saturating_sub(1) as i64),
        CompiledPred::Empty => return Bitmap::new(rows),
        CompiledPred::Range { lo, hi } => (
            match lo {
                CBound::Unbounded => 0,
                CBound::Incl(b) => b,
                CBound::Excl(b) => b + 1,
            },
            match hi {
                CBound::Unbounded => rows.saturating_sub(1) as i64,
                CBound::Incl(b) => b,
                CBound::Excl(b) => b - 1,
            },
        ),
        CompiledPred::Set(_) => unreachable!("row ranges are continuous"),
    };
    let lo = lo.max(0) as usize;
    if hi < 0 {
        return Bitmap::new(rows);
    }
    let hi = (hi as usize).min(rows.saturating_sub(1));
    if lo > hi {
        return Bitmap::new(rows);
    }
    let mut range = Bitmap::from_run(lo, hi - lo + 1, rows);
    range.and(mask);
    range
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessHint {
    MmapLarge,
    PreferRead,
    PreferMmap,
}

/// Advisory mmap/read preference for reading the masked rows of a column
/// with the given element size.
pub fn access_hint(mask: &Bitmap, elem_size: usize) -> AccessHint {
    let rows = mask.size();
    if rows == 0 || elem_size == 0 || mask.is_empty() {
        return AccessHint::MmapLarge;
    }
    let total_pages = (rows * elem_size).div_ceil(PAGE_SIZE);
    let mut touched = 0usize;
    let mut prev_last = usize::MAX;
    let mut first_page = usize::MAX;
    let mut last_page = 0usize;
    for run in mask.iter_runs() {
        let first = run.start * elem_size / PAGE_SIZE;
        let last = (run.end() * elem_size - 1) / PAGE_SIZE;
        touched += last - first + 1;
        if prev_last == first {
            touched -= 1;
        }
        prev_last = last;
        if first_page == usize::MAX {
            first_page = first;
        }
        last_page = last;
    }
    if touched * 16 > total_pages {
        AccessHint::PreferRead
    } else if touched * 2 >= last_page - first_page + 1 {
        AccessHint::PreferMmap
    } else {
        AccessHint::MmapLarge
    }
}
