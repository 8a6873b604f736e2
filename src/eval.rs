//! Predicate evaluation against one partition: dispatches leaves to column
//! indexes or sequential scans, combines interior nodes with bitmap
//! algebra, and resolves row-identifier sets to row positions.

use std::sync::Arc;

use crate::bitmap::Bitmap;
use crate::errors::PartResult;
use crate::part::column::Column;
use crate::part::partition::Partition;
use crate::rid::{Rid, SortedRids};
use crate::scan::predicate::{AnyAnyPred, ArithPred, Barrel, DiscretePred, PredNode, RangePred, StringPred};
use crate::scan::{self, ValueCursor};

pub struct Evaluator<'a> {
    part: &'a Partition,
}

impl<'a> Evaluator<'a> {
    pub fn new(part: &'a Partition) -> Evaluator<'a> {
        Evaluator { part }
    }

    fn empty(&self) -> Bitmap {
        Bitmap::new(self.part.nrows())
    }

    fn column_or_warn(&self, name: &str) -> Option<Arc<Column>> {
        let col = self.part.column(name);
        if col.is_none() {
            warn!("partition {} has no column {}", self.part.name(), name);
        }
        col
    }

    /// Evaluates the predicate tree against the active mask.
    pub fn evaluate(&self, pred: &PredNode) -> PartResult<Bitmap> {
        let mask = self.part.active_mask();
        self.eval_node(pred, &mask)
    }

    /// Evaluates against `mask ∩ activeMask`; an empty or zero-length mask
    /// means no extra restriction.
    pub fn evaluate_masked(&self, pred: &PredNode, mask: &Bitmap) -> PartResult<Bitmap> {
        let mut effective = self.part.active_mask();
        if mask.size() != 0 && mask.count() > 0 {
            effective.and(mask);
        }
        self.eval_node(pred, &effective)
    }

    fn eval_node(&self, pred: &PredNode, mask: &Bitmap) -> PartResult<Bitmap> {
        match pred {
            PredNode::Range(r) => self.eval_range(r, mask),
            PredNode::Discrete(d) => self.eval_discrete(d, mask),
            PredNode::StringEq(s) => {
                let mut hits = self.lookfor_string(s)?;
                hits.and(mask);
                Ok(hits)
            }
            PredNode::AnyAny(a) => self.match_any(a, mask),
            PredNode::Arith(a) => self.eval_arith(a, mask),
            PredNode::And(l, r) => {
                let left = self.eval_node(l, mask)?;
                if left.is_empty() {
                    return Ok(left);
                }
                self.eval_node(r, &left)
            }
            PredNode::Or(l, r) => {
                let mut left = self.eval_node(l, mask)?;
                let right = self.eval_node(r, mask)?;
                left.or(&right);
                Ok(left)
            }
            PredNode::Not(inner) => match inner.as_ref() {
                // leaf ranges have a direct complement scan
                PredNode::Range(r) => self.negative_scan(r, mask),
                _ => {
                    let hits = self.eval_node(inner, mask)?;
                    let mut out = mask.clone();
                    out.and_not(&hits);
                    Ok(out)
                }
            },
        }
    }

    fn eval_range(&self, range: &RangePred, mask: &Bitmap) -> PartResult<Bitmap> {
        match self.column_or_warn(&range.column) {
            Some(col) => col.evaluate_range(self.part.ctx(), range, mask),
            None => Ok(self.empty()),
        }
    }

    fn eval_discrete(&self, pred: &DiscretePred, mask: &Bitmap) -> PartResult<Bitmap> {
        match self.column_or_warn(&pred.column) {
            Some(col) => col.evaluate_discrete(self.part.ctx(), pred, mask),
            None => Ok(self.empty()),
        }
    }

    /// Rows of the mask that do NOT satisfy the range, produced in one pass.
    pub fn negative_scan(&self, range: &RangePred, mask: &Bitmap) -> PartResult<Bitmap> {
        match self.column_or_warn(&range.column) {
            Some(col) => col.negative_scan(self.part.ctx(), range, mask),
            None => Ok(self.empty()),
        }
    }

    fn eval_arith(&self, pred: &ArithPred, mask: &Bitmap) -> PartResult<Bitmap> {
        let names = pred.columns();
        let mut cursors = Vec::with_capacity(names.len());
        for name in &names {
            match self.column_or_warn(name) {
                Some(col) => cursors.push(col.cursor(self.part.ctx())?),
                None => return Ok(self.empty()),
            }
        }
        let mut barrel = Barrel::new(names);
        let mut dyn_cursors: Vec<&mut dyn ValueCursor> = cursors
            .iter_mut()
            .map(|c| c as &mut dyn ValueCursor)
            .collect();
        scan::scan_arith(&mut dyn_cursors, &mut barrel, pred, mask, false)
    }

    /// Conservative upper bound on the number of hits.
    pub fn estimate_count(&self, range: &RangePred) -> u64 {
        match self.estimate(range) {
            Ok((_, high)) => high.count() as u64,
            Err(_) => 0,
        }
    }

    /// Bracketing bitmaps, both intersected with the active mask whenever
    /// sizes match.
    pub fn estimate(&self, range: &RangePred) -> PartResult<(Bitmap, Bitmap)> {
        let col = match self.column_or_warn(&range.column) {
            Some(col) => col,
            None => return Ok((self.empty(), self.empty())),
        };
        let (mut low, mut high) = col.estimate_range(self.part.ctx(), range)?;
        let mask = self.part.active_mask();
        if low.size() == mask.size() {
            low.and(&mask);
        }
        if high.size() == mask.size() {
            high.and(&mask);
        }
        Ok((low, high))
    }

    /// Counts hits without materializing the result bitmap.
    pub fn count_hits(&self, range: &RangePred) -> PartResult<u64> {
        let mask = self.part.active_mask();
        self.count_hits_masked(range, &mask)
    }

    pub fn count_hits_masked(&self, range: &RangePred, mask: &Bitmap) -> PartResult<u64> {
        let mut effective = self.part.active_mask();
        effective.and(mask);
        match self.column_or_warn(&range.column) {
            Some(col) => col.count_hits(self.part.ctx(), range, &effective),
            None => Ok(0),
        }
    }

    /// For every column whose name starts with the prefix, matches the value
    /// set against the rows not yet claimed and ORs the results together.
    pub fn match_any(&self, pred: &AnyAnyPred, mask: &Bitmap) -> PartResult<Bitmap> {
        let mut hits = self.empty();
        let prefix = pred.prefix.to_ascii_lowercase();
        for col in self.part.columns() {
            if !col.name().to_ascii_lowercase().starts_with(&prefix) {
                continue;
            }
            let mut remaining = mask.clone();
            remaining.and_not(&hits);
            if remaining.is_empty() {
                break;
            }
            let discrete = DiscretePred::new(col.name(), pred.values.clone());
            match col.evaluate_discrete(self.part.ctx(), &discrete, &remaining) {
                Ok(found) => hits.or(&found),
                Err(e) => {
                    debug!("skipping column {} in any-any match: {}", col.name(), e);
                }
            }
        }
        Ok(hits)
    }

    /// String equality: tries the left literal as a column name, then the
    /// right.
    pub fn lookfor_string(&self, pred: &StringPred) -> PartResult<Bitmap> {
        if let Some(col) = self.part.column(&pred.left) {
            match col.search(self.part.ctx(), &pred.right) {
                Ok(hits) => return Ok(hits),
                Err(e) => debug!("search on column {} failed: {}", pred.left, e),
            }
        }
        if let Some(col) = self.part.column(&pred.right) {
            match col.search(self.part.ctx(), &pred.left) {
                Ok(hits) => return Ok(hits),
                Err(e) => debug!("search on column {} failed: {}", pred.right, e),
            }
        }
        warn!(
            "neither {:?} nor {:?} names a string column",
            pred.left, pred.right
        );
        Ok(self.empty())
    }

    // ---- row identifiers ----------------------------------------------

    /// Rows whose RID is in `set`. Partitions without row identifiers treat
    /// each RID's lower 32 bits as a row position.
    pub fn evaluate_rid_set(&self, set: &[Rid]) -> PartResult<Bitmap> {
        let rows = self.part.nrows();
        if !self.part.has_rids() {
            let mut hits = Bitmap::new(rows);
            for rid in set {
                let row = rid.event() as usize;
                if row < rows {
                    hits.set(row);
                }
            }
            return Ok(hits);
        }
        let mut sorted_set: Vec<Rid> = set.to_vec();
        sorted_set.sort();
        sorted_set.dedup();
        match self.sorted_rid_merge(&sorted_set) {
            Ok(hits) => Ok(hits),
            Err(e) => {
                warn!("sorted RID search failed ({}); falling back to linear scan", e);
                let mut hits = Bitmap::new(rows);
                if let Some(rids) = self.part.rids() {
                    for (row, rid) in rids.iter().enumerate() {
                        if sorted_set.binary_search(rid).is_ok() {
                            hits.set(row);
                        }
                    }
                }
                hits.adjust_size(rows, false);
                Ok(hits)
            }
        }
    }

    fn sorted_rid_merge(&self, sorted_set: &[Rid]) -> PartResult<Bitmap> {
        self.part.sort_rids()?;
        let sorted = SortedRids::open(
            self.part.file_manager(),
            self.part.active_dir(),
            self.part.nrows(),
        )?;
        let mut out = Bitmap::new(self.part.nrows());
        sorted.merge_into(sorted_set, &mut out);
        out.adjust_size(self.part.nrows(), false);
        Ok(out)
    }

    /// Two-pointer merge of a sorted RID set against the sorted-RID file,
    /// regenerating the file first when its size is wrong.
    pub fn search_sorted_rids(&self, sorted_set: &[Rid], out: &mut Bitmap) -> PartResult<()> {
        self.part.sort_rids()?;
        let sorted = SortedRids::open(
            self.part.file_manager(),
            self.part.active_dir(),
            self.part.nrows(),
        )?;
        sorted.merge_into(sorted_set, out);
        Ok(())
    }

    /// Resolves one RID to its row position, or the row count when absent.
    pub fn get_row_number(&self, rid: Rid) -> usize {
        let rows = self.part.nrows();
        if self.part.sort_rids().is_ok() {
            if let Ok(sorted) = SortedRids::open(
                self.part.file_manager(),
                self.part.active_dir(),
                rows,
            ) {
                if let Some(row) = sorted.find(rid) {
                    return row as usize;
                }
            }
        }
        // binary search missed or was unavailable
        if let Some(rids) = self.part.rids() {
            if let Some(row) = rids.iter().position(|&r| r == rid) {
                return row;
            }
        }
        rows
    }
}
