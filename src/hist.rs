//! Histograms over one, two, or three columns, plus adaptive distributions.
//! Each call evaluates an internal constraint query, pulls the surviving
//! rows through the columns' typed selections, and bins in one pass.

use std::sync::Arc;

use crate::bitmap::Bitmap;
use crate::errors::{PartError, PartResult};
use crate::eval::Evaluator;
use crate::part::column::Column;
use crate::part::partition::Partition;
use crate::scan::predicate::{PredNode, RangePred};
use crate::scan::ScanVal;

/// Distinct values are reported exactly below this count.
const EXACT_DISTINCT_LIMIT: usize = 10_000;
/// Above the limit, values are packed into this many equi-count bins.
const ADAPTIVE_BINS: usize = 1000;

pub struct HistogramEngine<'a> {
    part: &'a Partition,
}

/// Axis values pulled through a typed selection: integers keep 64-bit
/// integer form, floating point stays double.
enum AxisValues {
    Longs(Vec<i64>),
    Doubles(Vec<f64>),
}

macro_rules! with_axis {
    ($axis:expr, $v:ident => $body:expr) => {
        match $axis {
            AxisValues::Longs(ref $v) => $body,
            AxisValues::Doubles(ref $v) => $body,
        }
    };
}

fn fill_1d<T: ScanVal>(values: &[T], begin: f64, stride: f64, counts: &mut [u64]) {
    for &v in values {
        let idx = ((v.to_f64() - begin) / stride).floor();
        if idx >= 0.0 && (idx as usize) < counts.len() {
            counts[idx as usize] += 1;
        }
    }
}

struct Axis {
    begin: f64,
    stride: f64,
    dim: usize,
}

impl Axis {
    #[inline]
    fn bin(&self, v: f64) -> Option<usize> {
        let idx = ((v - self.begin) / self.stride).floor();
        if idx >= 0.0 && (idx as usize) < self.dim {
            Some(idx as usize)
        } else {
            None
        }
    }
}

fn fill_2d<T1: ScanVal, T2: ScanVal>(v1: &[T1], v2: &[T2], a1: &Axis, a2: &Axis, counts: &mut [u64]) {
    for (&x, &y) in v1.iter().zip(v2.iter()) {
        if let (Some(j1), Some(j2)) = (a1.bin(x.to_f64()), a2.bin(y.to_f64())) {
            counts[j1 * a2.dim + j2] += 1;
        }
    }
}

fn fill_3d<T1: ScanVal, T2: ScanVal, T3: ScanVal>(
    v1: &[T1],
    v2: &[T2],
    v3: &[T3],
    a1: &Axis,
    a2: &Axis,
    a3: &Axis,
    counts: &mut [u64],
) {
    for ((&x, &y), &z) in v1.iter().zip(v2.iter()).zip(v3.iter()) {
        if let (Some(j1), Some(j2), Some(j3)) =
            (a1.bin(x.to_f64()), a2.bin(y.to_f64()), a3.bin(z.to_f64()))
        {
            counts[(j1 * a2.dim + j2) * a3.dim + j3] += 1;
        }
    }
}

impl<'a> HistogramEngine<'a> {
    pub fn new(part: &'a Partition) -> HistogramEngine<'a> {
        HistogramEngine { part }
    }

    fn column(&self, name: &str) -> PartResult<Arc<Column>> {
        self.part
            .column(name)
            .ok_or_else(|| PartError::UnknownColumn(name.to_string()))
    }

    fn axis_values(&self, col: &Column, mask: &Bitmap) -> PartResult<AxisValues> {
        let ctx = self.part.ctx();
        match col.ctype() {
            t if t.is_integer() => Ok(AxisValues::Longs(col.select_longs(ctx, mask)?)),
            t if t.is_numeric() => Ok(AxisValues::Doubles(col.select_doubles(ctx, mask)?)),
            _ => Ok(AxisValues::Longs(col.select_longs(ctx, mask)?)),
        }
    }

    fn constrained_hits(
        &self,
        constraints: Option<&PredNode>,
        boxes: &[RangePred],
    ) -> PartResult<Bitmap> {
        let mut query: Option<PredNode> = constraints.cloned();
        for range in boxes {
            let node = PredNode::Range(range.clone());
            query = Some(match query {
                Some(q) => q.and(node),
                None => node,
            });
        }
        match query {
            Some(q) => Evaluator::new(self.part).evaluate(&q),
            None => Ok(self.part.active_mask()),
        }
    }

    /// 1-D histogram: `counts[⌊(v - begin)/stride⌋]` over rows satisfying
    /// the constraints and `begin <= v <= end`. Output length is
    /// `1 + ⌊(end - begin)/stride⌋`.
    pub fn hist_1d(
        &self,
        constraints: Option<&PredNode>,
        column: &str,
        begin: f64,
        end: f64,
        stride: f64,
    ) -> PartResult<Vec<u64>> {
        let steps = (end - begin) / stride;
        if stride == 0.0 || !steps.is_finite() || steps < 0.0 {
            return Err(PartError::BadBounds(format!(
                "begin {} end {} stride {} disagree in direction",
                begin, end, stride
            )));
        }
        let nbins = 1 + steps.floor() as usize;
        let col = self.column(column)?;
        let range = RangePred::between(column, begin.min(end), begin.max(end));
        let hits = self.constrained_hits(constraints, &[range])?;
        let mut counts = vec![0u64; nbins];
        let values = self.axis_values(&col, &hits)?;
        with_axis!(values, v => fill_1d(v, begin, stride, &mut counts));
        Ok(counts)
    }

    fn axis(&self, column: &str, begin: f64, end: f64, stride: f64) -> PartResult<(Axis, RangePred)> {
        if stride <= 0.0 || end <= begin {
            return Err(PartError::BadBounds(format!(
                "axis {} with begin {} end {} stride {}",
                column, begin, end, stride
            )));
        }
        let dim = ((end - begin) / stride).ceil() as usize;
        Ok((
            Axis { begin, stride, dim: dim.max(1) },
            RangePred::half_open(column, begin, end),
        ))
    }

    /// 2-D histogram addressed as `j1 * dim2 + j2`, each axis half-open
    /// `[begin, end)`.
    #[allow(clippy::too_many_arguments)]
    pub fn hist_2d(
        &self,
        constraints: Option<&PredNode>,
        column1: &str,
        begin1: f64,
        end1: f64,
        stride1: f64,
        column2: &str,
        begin2: f64,
        end2: f64,
        stride2: f64,
    ) -> PartResult<Vec<u64>> {
        let col1 = self.column(column1)?;
        let col2 = self.column(column2)?;
        let (a1, box1) = self.axis(column1, begin1, end1, stride1)?;
        let (a2, box2) = self.axis(column2, begin2, end2, stride2)?;
        let hits = self.constrained_hits(constraints, &[box1, box2])?;
        let mut counts = vec![0u64; a1.dim * a2.dim];
        let v1 = self.axis_values(&col1, &hits)?;
        let v2 = self.axis_values(&col2, &hits)?;
        with_axis!(v1, x => with_axis!(v2, y => fill_2d(x, y, &a1, &a2, &mut counts)));
        Ok(counts)
    }

    /// 3-D histogram addressed as `(j1 * dim2 + j2) * dim3 + j3`.
    #[allow(clippy::too_many_arguments)]
    pub fn hist_3d(
        &self,
        constraints: Option<&PredNode>,
        column1: &str,
        begin1: f64,
        end1: f64,
        stride1: f64,
        column2: &str,
        begin2: f64,
        end2: f64,
        stride2: f64,
        column3: &str,
        begin3: f64,
        end3: f64,
        stride3: f64,
    ) -> PartResult<Vec<u64>> {
        let col1 = self.column(column1)?;
        let col2 = self.column(column2)?;
        let col3 = self.column(column3)?;
        let (a1, box1) = self.axis(column1, begin1, end1, stride1)?;
        let (a2, box2) = self.axis(column2, begin2, end2, stride2)?;
        let (a3, box3) = self.axis(column3, begin3, end3, stride3)?;
        let hits = self.constrained_hits(constraints, &[box1, box2, box3])?;
        let mut counts = vec![0u64; a1.dim * a2.dim * a3.dim];
        let v1 = self.axis_values(&col1, &hits)?;
        let v2 = self.axis_values(&col2, &hits)?;
        let v3 = self.axis_values(&col3, &hits)?;
        with_axis!(v1, x => with_axis!(v2, y => with_axis!(v3, z =>
            fill_3d(x, y, z, &a1, &a2, &a3, &mut counts))));
        Ok(counts)
    }

    fn selected_values(
        &self,
        column: &str,
        constraints: Option<&PredNode>,
    ) -> PartResult<Vec<f64>> {
        let col = self.column(column)?;
        let hits = match constraints {
            Some(q) => Evaluator::new(self.part).evaluate(q)?,
            None => self.part.active_mask(),
        };
        col.select_doubles(self.part.ctx(), &hits)
    }

    /// Sorted (value, count) pairs of the column restricted to the
    /// constraints mask.
    fn value_counts(
        &self,
        column: &str,
        constraints: Option<&PredNode>,
    ) -> PartResult<Vec<(f64, u64)>> {
        let mut values = self.selected_values(column, constraints)?;
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mut pairs: Vec<(f64, u64)> = Vec::new();
        for v in values {
            match pairs.last_mut() {
                Some((last, count)) if *last == v => *count += 1,
                _ => pairs.push((v, 1)),
            }
        }
        Ok(pairs)
    }

    /// Adaptive distribution: returns `(bounds, counts)` with
    /// `counts.len() == bounds.len() + 1`; `counts[i]` covers
    /// `[bounds[i-1], bounds[i])`, with open first and last bins.
    pub fn get_distribution(
        &self,
        column: &str,
        constraints: Option<&PredNode>,
        user_bounds: Option<&[f64]>,
    ) -> PartResult<(Vec<f64>, Vec<u64>)> {
        if let Some(bounds) = user_bounds {
            if !bounds.is_empty() && bounds.windows(2).all(|w| w[0] < w[1]) {
                let values = self.selected_values(column, constraints)?;
                let mut counts = vec![0u64; bounds.len() + 1];
                for v in values {
                    let idx = bounds.partition_point(|b| *b <= v);
                    counts[idx] += 1;
                }
                return Ok((bounds.to_vec(), counts));
            }
            debug!("supplied bounds not strictly ascending; deriving adaptively");
        }
        let pairs = self.value_counts(column, constraints)?;
        Ok(adaptive_bins(&pairs))
    }

    /// Same shape as [`get_distribution`] but counts are running totals:
    /// `counts[i]` is the number of values strictly below `bounds[i]`, and
    /// the final bound lies strictly above the maximum observed value.
    pub fn get_cumulative_distribution(
        &self,
        column: &str,
        constraints: Option<&PredNode>,
    ) -> PartResult<(Vec<f64>, Vec<u64>)> {
        let pairs = self.value_counts(column, constraints)?;
        if pairs.is_empty() {
            return Ok((vec![], vec![]));
        }
        let max = pairs[pairs.len() - 1].0;
        let (bounds, bin_counts) = if pairs.len() < EXACT_DISTINCT_LIMIT {
            // one boundary per distinct value
            let bounds: Vec<f64> = pairs.iter().map(|&(v, _)| v).collect();
            let counts: Vec<u64> = pairs.iter().map(|&(_, c)| c).collect();
            (bounds, counts)
        } else {
            // same greedy equi-count boundaries as the plain distribution
            let (interior, counts) = adaptive_bins(&pairs);
            let mut bounds = vec![pairs[0].0];
            bounds.extend(interior);
            (bounds, counts)
        };
        let mut out_bounds = bounds;
        out_bounds.push(compact_value(max, max + 1.0));
        let mut out_counts = Vec::with_capacity(out_bounds.len());
        out_counts.push(0u64);
        let mut running = 0u64;
        for c in bin_counts {
            running += c;
            out_counts.push(running);
        }
        Ok((out_bounds, out_counts))
    }

    /// Fixed-size output: the natural distribution when it fits in `nbc`
    /// bins, otherwise interior bins are merged toward equal row counts,
    /// preserving the first and last boundary.
    pub fn pack_distribution(
        &self,
        column: &str,
        constraints: Option<&PredNode>,
        nbc: usize,
    ) -> PartResult<(Vec<f64>, Vec<u64>)> {
        if nbc < 3 {
            return Err(PartError::BadBounds(format!(
                "packed distribution needs at least 3 bins, got {}",
                nbc
            )));
        }
        let (bounds, counts) = self.get_distribution(column, constraints, None)?;
        if counts.len() <= nbc {
            return Ok((bounds, counts));
        }
        let interior = &counts[1..counts.len() - 1];
        let mut out_bounds = vec![bounds[0]];
        let mut out_counts = vec![counts[0]];
        let mut total_left: u64 = interior.iter().sum();
        let mut bins_left = nbc - 2;
        let mut i = 0;
        while bins_left > 0 && i < interior.len() {
            let target = total_left.div_ceil(bins_left as u64);
            let mut acc = 0u64;
            while i < interior.len() {
                acc += interior[i];
                i += 1;
                if acc >= target {
                    break;
                }
            }
            out_counts.push(acc);
            total_left -= acc;
            bins_left -= 1;
            if i < interior.len() {
                out_bounds.push(bounds[i]);
            }
        }
        if i < interior.len() {
            let rest: u64 = interior[i..].iter().sum();
            *out_counts.last_mut().unwrap() += rest;
        }
        out_bounds.push(*bounds.last().unwrap());
        out_counts.push(*counts.last().unwrap());
        Ok((out_bounds, out_counts))
    }

    /// Joint distribution of two columns. Each axis honors caller-supplied
    /// strictly ascending bounds; `counts.len()` equals
    /// `(bounds1.len() + 1) * (bounds2.len() + 1)`.
    pub fn joint_distribution(
        &self,
        constraints: Option<&PredNode>,
        column1: &str,
        bounds1: Option<&[f64]>,
        column2: &str,
        bounds2: Option<&[f64]>,
    ) -> PartResult<(Vec<f64>, Vec<f64>, Vec<u64>)> {
        let b1 = self.axis_bounds(column1, constraints, bounds1)?;
        let b2 = self.axis_bounds(column2, constraints, bounds2)?;
        let col1 = self.column(column1)?;
        let col2 = self.column(column2)?;
        let hits = match constraints {
            Some(q) => Evaluator::new(self.part).evaluate(q)?,
            None => self.part.active_mask(),
        };
        let v1 = col1.select_doubles(self.part.ctx(), &hits)?;
        let v2 = col2.select_doubles(self.part.ctx(), &hits)?;
        let width = b2.len() + 1;
        let mut counts = vec![0u64; (b1.len() + 1) * width];
        for (&x, &y) in v1.iter().zip(v2.iter()) {
            let i = b1.partition_point(|b| *b <= x);
            let j = b2.partition_point(|b| *b <= y);
            counts[i * width + j] += 1;
        }
        Ok((b1, b2, counts))
    }

    fn axis_bounds(
        &self,
        column: &str,
        constraints: Option<&PredNode>,
        user: Option<&[f64]>,
    ) -> PartResult<Vec<f64>> {
        if let Some(bounds) = user {
            if !bounds.is_empty() && bounds.windows(2).all(|w| w[0] < w[1]) {
                return Ok(bounds.to_vec());
            }
        }
        Ok(self.get_distribution(column, constraints, None)?.0)
    }
}

/// Bins sorted (value, count) pairs per the adaptive policy.
fn adaptive_bins(pairs: &[(f64, u64)]) -> (Vec<f64>, Vec<u64>) {
    match pairs.len() {
        0 => (vec![], vec![]),
        1 => {
            let (v, cnt) = pairs[0];
            (vec![v, v + 1.0], vec![0, cnt, 0])
        }
        n if n < EXACT_DISTINCT_LIMIT => {
            let bounds = pairs.iter().skip(1).map(|&(v, _)| v).collect();
            let counts = pairs.iter().map(|&(_, c)| c).collect();
            (bounds, counts)
        }
        _ => {
            let total: u64 = pairs.iter().map(|&(_, c)| c).sum();
            let mut bounds = Vec::with_capacity(ADAPTIVE_BINS);
            let mut counts = Vec::with_capacity(ADAPTIVE_BINS);
            let mut acc = 0u64;
            let mut consumed = 0u64;
            let mut bins_left = ADAPTIVE_BINS as u64;
            for (i, &(_, c)) in pairs.iter().enumerate() {
                acc += c;
                let target = (total - consumed).div_ceil(bins_left);
                if acc >= target && i + 1 < pairs.len() && bins_left > 1 {
                    counts.push(acc);
                    consumed += acc;
                    acc = 0;
                    bins_left -= 1;
                    // midpoint-compact boundary between the last value of
                    // this bin and the first of the next
                    bounds.push(compact_value(pairs[i].0, pairs[i + 1].0));
                }
            }
            counts.push(acc);
            (bounds, counts)
        }
    }
}

/// A value with a short decimal representation in `(left, right]`.
fn compact_value(left: f64, right: f64) -> f64 {
    if !(left < right) {
        return right;
    }
    let span = right - left;
    let mut p = 10f64.powf(span.log10().floor());
    loop {
        let candidate = (left / p).floor() * p + p;
        if candidate > left && candidate <= right {
            return candidate;
        }
        p /= 10.0;
        if p < f64::MIN_POSITIVE {
            return right;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_values_are_short_and_in_range() {
        assert_eq!(compact_value(2.0, 3.0), 3.0);
        assert_eq!(compact_value(2.0, 2.5), 2.1);
        assert_eq!(compact_value(4.0, 5.0), 5.0);
        let v = compact_value(1.234567, 1.234568);
        assert!(v > 1.234567 && v <= 1.234568);
    }

    #[test]
    fn adaptive_bins_exact_distinct() {
        // five distinct values, 100 rows each
        let pairs: Vec<(f64, u64)> = (1..=5).map(|v| (v as f64, 100)).collect();
        let (bounds, counts) = adaptive_bins(&pairs);
        assert_eq!(bounds, vec![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(counts, vec![100, 100, 100, 100, 100]);
    }

    #[test]
    fn adaptive_bins_single_value() {
        let (bounds, counts) = adaptive_bins(&[(7.0, 42)]);
        assert_eq!(bounds, vec![7.0, 8.0]);
        assert_eq!(counts, vec![0, 42, 0]);
    }

    #[test]
    fn adaptive_bins_equi_count() {
        // 20k distinct values, one row each -> 1000 bins of ~20 rows
        let pairs: Vec<(f64, u64)> = (0..20_000).map(|v| (v as f64, 1)).collect();
        let (bounds, counts) = adaptive_bins(&pairs);
        assert_eq!(counts.len(), ADAPTIVE_BINS);
        assert_eq!(bounds.len(), counts.len() - 1);
        assert_eq!(counts.iter().sum::<u64>(), 20_000);
        assert!(bounds.windows(2).all(|w| w[0] < w[1]));
        assert!(counts.iter().all(|&c| c >= 10 && c <= 40));
    }
}
