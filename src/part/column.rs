//! Per-column metadata and operations. A column never points back at its
//! partition; the partition passes a [`PartCtx`] at every call site.

use std::any::Any;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::bitmap::Bitmap;
use crate::errors::{PartError, PartResult};
use crate::file_manager::FileManager;
use crate::index::{self, ColumnIndex};
use crate::scan::predicate::{DiscretePred, RangePred};
use crate::scan::reader::ScanReader;
use crate::scan::{self, CompiledPred, FileCursor, ScanVal};

/// Scalar type of a column.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ColType {
    Byte,
    UByte,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    Float,
    Double,
    Text,
    Category,
    Oid,
}

impl ColType {
    pub fn parse(s: &str) -> Option<ColType> {
        match s.trim().to_ascii_lowercase().as_str() {
            "byte" | "char" | "int8" => Some(ColType::Byte),
            "ubyte" | "unsigned byte" | "uint8" => Some(ColType::UByte),
            "short" | "int16" => Some(ColType::Short),
            "ushort" | "unsigned short" | "uint16" => Some(ColType::UShort),
            "int" | "integer" | "int32" => Some(ColType::Int),
            "uint" | "unsigned" | "unsigned int" | "uint32" => Some(ColType::UInt),
            "long" | "int64" => Some(ColType::Long),
            "ulong" | "unsigned long" | "uint64" => Some(ColType::ULong),
            "float" | "real" => Some(ColType::Float),
            "double" => Some(ColType::Double),
            "text" | "string" => Some(ColType::Text),
            "category" | "key" => Some(ColType::Category),
            "oid" | "rid" => Some(ColType::Oid),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ColType::Byte => "BYTE",
            ColType::UByte => "UBYTE",
            ColType::Short => "SHORT",
            ColType::UShort => "USHORT",
            ColType::Int => "INT",
            ColType::UInt => "UINT",
            ColType::Long => "LONG",
            ColType::ULong => "ULONG",
            ColType::Float => "FLOAT",
            ColType::Double => "DOUBLE",
            ColType::Text => "TEXT",
            ColType::Category => "CATEGORY",
            ColType::Oid => "OID",
        }
    }

    /// Bytes per value; negative for variable-width types.
    pub fn element_size(self) -> i32 {
        match self {
            ColType::Byte | ColType::UByte => 1,
            ColType::Short | ColType::UShort => 2,
            ColType::Int | ColType::UInt | ColType::Float | ColType::Category => 4,
            ColType::Long | ColType::ULong | ColType::Double | ColType::Oid => 8,
            ColType::Text => -1,
        }
    }

    pub fn is_numeric(self) -> bool {
        !matches!(self, ColType::Text | ColType::Category | ColType::Oid)
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ColType::Byte
                | ColType::UByte
                | ColType::Short
                | ColType::UShort
                | ColType::Int
                | ColType::UInt
                | ColType::Long
                | ColType::ULong
        )
    }
}

impl fmt::Display for ColType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Partition context handed to every column operation.
#[derive(Clone, Copy)]
pub struct PartCtx<'a> {
    pub dir: &'a Path,
    pub rows: usize,
    pub fm: &'a Arc<FileManager>,
    pub export_csr: Option<&'a Path>,
}

/// In-memory copy of a column's values, tagged by element type.
pub enum TypedArray {
    Byte(Vec<i8>),
    UByte(Vec<u8>),
    Short(Vec<i16>),
    UShort(Vec<u16>),
    Int(Vec<i32>),
    UInt(Vec<u32>),
    Long(Vec<i64>),
    ULong(Vec<u64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

macro_rules! each_array_variant {
    ($self:expr, $v:ident => $body:expr) => {
        match $self {
            TypedArray::Byte($v) => $body,
            TypedArray::UByte($v) => $body,
            TypedArray::Short($v) => $body,
            TypedArray::UShort($v) => $body,
            TypedArray::Int($v) => $body,
            TypedArray::UInt($v) => $body,
            TypedArray::Long($v) => $body,
            TypedArray::ULong($v) => $body,
            TypedArray::Float($v) => $body,
            TypedArray::Double($v) => $body,
        }
    };
}

impl TypedArray {
    pub fn len(&self) -> usize {
        each_array_variant!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn slice<T: 'static>(&self) -> Option<&[T]> {
        each_array_variant!(self, v => (v as &dyn Any).downcast_ref::<Vec<T>>().map(|v| v.as_slice()))
    }
}

/// Dispatches `$body` with `$T` bound to the element type of `$ctype`.
/// `$fallback` handles variable-width types.
macro_rules! dispatch_scalar {
    ($ctype:expr, $T:ident => $body:expr, $fallback:expr) => {
        match $ctype {
            ColType::Byte => {
                type $T = i8;
                $body
            }
            ColType::UByte => {
                type $T = u8;
                $body
            }
            ColType::Short => {
                type $T = i16;
                $body
            }
            ColType::UShort => {
                type $T = u16;
                $body
            }
            ColType::Int => {
                type $T = i32;
                $body
            }
            ColType::UInt | ColType::Category => {
                type $T = u32;
                $body
            }
            ColType::Long => {
                type $T = i64;
                $body
            }
            ColType::ULong | ColType::Oid => {
                type $T = u64;
                $body
            }
            ColType::Float => {
                type $T = f32;
                $body
            }
            ColType::Double => {
                type $T = f64;
                $body
            }
            ColType::Text => $fallback,
        }
    };
}

pub struct Column {
    name: String,
    ctype: ColType,
    // lower > upper means the bounds have not been computed yet
    bounds: Mutex<(f64, f64)>,
    index_spec: Mutex<String>,
    index: Mutex<Option<Box<dyn ColumnIndex>>>,
    data: Mutex<Option<Arc<TypedArray>>>,
    // set for columns synthesized from a meta tag: every row carries this value
    virtual_value: Option<String>,
}

impl Column {
    pub fn new(name: &str, ctype: ColType) -> Column {
        Column {
            name: name.to_string(),
            ctype,
            bounds: Mutex::new((f64::INFINITY, f64::NEG_INFINITY)),
            index_spec: Mutex::new(String::new()),
            index: Mutex::new(None),
            data: Mutex::new(None),
            virtual_value: None,
        }
    }

    /// Single-value Category column standing in for a meta tag that has no
    /// column block of its own.
    pub fn synthesized(name: &str, value: &str) -> Column {
        let mut col = Column::new(name, ColType::Category);
        col.virtual_value = Some(value.to_string());
        col
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn ctype(&self) -> ColType {
        self.ctype
    }

    pub fn element_size(&self) -> i32 {
        self.ctype.element_size()
    }

    pub fn is_virtual(&self) -> bool {
        self.virtual_value.is_some()
    }

    pub fn virtual_value(&self) -> Option<&str> {
        self.virtual_value.as_deref()
    }

    /// Data file path: the column name exactly, within the partition
    /// directory.
    pub fn data_file(&self, dir: &Path) -> PathBuf {
        dir.join(&self.name)
    }

    pub fn index_file(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.idx", self.name))
    }

    fn mask_file(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.msk", self.name))
    }

    fn offsets_file(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.sp", self.name))
    }

    fn dictionary_file(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.dic", self.name))
    }

    pub fn bounds(&self) -> Option<(f64, f64)> {
        let (lo, hi) = *self.bounds.lock().unwrap();
        if lo <= hi {
            Some((lo, hi))
        } else {
            None
        }
    }

    pub fn set_bounds(&self, lo: f64, hi: f64) {
        *self.bounds.lock().unwrap() = (lo, hi);
    }

    pub fn index_spec(&self) -> String {
        self.index_spec.lock().unwrap().clone()
    }

    pub fn set_index_spec(&self, spec: &str) {
        *self.index_spec.lock().unwrap() = spec.to_string();
    }

    /// Bitmap of rows whose value is valid; missing mask file means all
    /// rows.
    pub fn null_mask(&self, ctx: PartCtx) -> Bitmap {
        match Bitmap::read_from(&self.mask_file(ctx.dir)) {
            Ok(mut mask) => {
                if mask.size() != ctx.rows {
                    warn!(
                        "column {} mask has {} bits, expected {}",
                        self.name,
                        mask.size(),
                        ctx.rows
                    );
                    mask.adjust_size(ctx.rows, true);
                }
                mask
            }
            Err(_) => Bitmap::ones(ctx.rows),
        }
    }

    /// Scans the data file to establish the bounds. Idempotent.
    pub fn compute_min_max(&self, ctx: PartCtx) -> PartResult<()> {
        if self.bounds().is_some() || !self.ctype.is_numeric() {
            return Ok(());
        }
        let values = self.read_values_f64(ctx)?;
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for v in values {
            if v < lo {
                lo = v;
            }
            if v > hi {
                hi = v;
            }
        }
        if lo <= hi {
            self.set_bounds(lo, hi);
        }
        Ok(())
    }

    /// All values in the double domain, in row order.
    pub fn read_values_f64(&self, ctx: PartCtx) -> PartResult<Vec<f64>> {
        let mask = Bitmap::ones(ctx.rows);
        dispatch_scalar!(self.ctype, T => {
            let values = self.masked_values::<T>(ctx, &mask)?;
            Ok(values.into_iter().map(|v| v.to_f64()).collect())
        }, Err(self.unsupported()))
    }

    fn unsupported(&self) -> PartError {
        PartError::UnsupportedType {
            column: self.name.clone(),
            ctype: self.ctype.name(),
        }
    }

    /// Values at the mask's set positions, from the cached array when one
    /// is loaded, from the data file otherwise.
    fn masked_values<T: ScanVal>(&self, ctx: PartCtx, mask: &Bitmap) -> PartResult<Vec<T>> {
        let data = self.data.lock().unwrap().clone();
        if let Some(arr) = data {
            let values = arr
                .slice::<T>()
                .ok_or_else(|| self.unsupported())?;
            if values.len() != mask.size() {
                return Err(PartError::ArraySizeMismatch {
                    len: values.len(),
                    rows: mask.size(),
                    count: mask.count(),
                });
            }
            Ok(mask.iter().map(|row| values[row]).collect())
        } else {
            let mut reader = ScanReader::open(ctx.fm, &self.data_file(ctx.dir), T::SIZE)?;
            scan::select_file::<T>(&mut reader, mask)
        }
    }

    fn scan_range(
        &self,
        ctx: PartCtx,
        range: &RangePred,
        mask: &Bitmap,
        negate: bool,
    ) -> PartResult<Bitmap> {
        dispatch_scalar!(self.ctype, T => {
            let pred = CompiledPred::<T>::from_range(range);
            let data = self.data.lock().unwrap().clone();
            if let Some(arr) = data {
                let values = arr.slice::<T>().ok_or_else(|| self.unsupported())?;
                scan::scan_array(values, mask, &pred, negate)
            } else {
                let mut reader = ScanReader::open(ctx.fm, &self.data_file(ctx.dir), T::SIZE)?;
                scan::scan_file(&mut reader, mask, &pred, negate)
            }
        }, Ok(scan::row_range_hits(range, mask)))
    }

    /// Exact answer intersected with the mask.
    pub fn evaluate_range(
        &self,
        ctx: PartCtx,
        range: &RangePred,
        mask: &Bitmap,
    ) -> PartResult<Bitmap> {
        if self.ctype == ColType::Text {
            // numeric ranges address row numbers on text columns
            return Ok(scan::row_range_hits(range, mask));
        }
        let index = self.index.lock().unwrap();
        if let Some(idx) = index.as_ref() {
            if let Some(mut hits) = idx.evaluate(range) {
                hits.and(mask);
                return Ok(hits);
            }
            let (mut sure, _) = idx.estimate(range);
            let (_, mut iffy) = idx.undecidable(range);
            drop(index);
            sure.and(mask);
            iffy.and(mask);
            if !iffy.is_empty() {
                let scanned = self.scan_range(ctx, range, &iffy, false)?;
                sure.or(&scanned);
            }
            return Ok(sure);
        }
        drop(index);
        self.scan_range(ctx, range, mask, false)
    }

    /// Rows of the mask whose values do NOT satisfy the predicate.
    pub fn negative_scan(
        &self,
        ctx: PartCtx,
        range: &RangePred,
        mask: &Bitmap,
    ) -> PartResult<Bitmap> {
        if self.ctype == ColType::Text {
            let hits = scan::row_range_hits(range, mask);
            let mut out = mask.clone();
            out.and_not(&hits);
            return Ok(out);
        }
        self.scan_range(ctx, range, mask, true)
    }

    pub fn evaluate_discrete(
        &self,
        ctx: PartCtx,
        pred: &DiscretePred,
        mask: &Bitmap,
    ) -> PartResult<Bitmap> {
        dispatch_scalar!(self.ctype, T => {
            let compiled = CompiledPred::<T>::from_discrete(pred);
            let data = self.data.lock().unwrap().clone();
            if let Some(arr) = data {
                let values = arr.slice::<T>().ok_or_else(|| self.unsupported())?;
                scan::scan_array(values, mask, &compiled, false)
            } else {
                let mut reader = ScanReader::open(ctx.fm, &self.data_file(ctx.dir), T::SIZE)?;
                scan::scan_file(&mut reader, mask, &compiled, false)
            }
        }, Err(self.unsupported()))
    }

    /// Bracketing bitmaps with `low ⊆ answer ⊆ high`; neither is masked.
    pub fn estimate_range(&self, ctx: PartCtx, range: &RangePred) -> PartResult<(Bitmap, Bitmap)> {
        if let Some(idx) = self.index.lock().unwrap().as_ref() {
            return Ok(idx.estimate(range));
        }
        if range.is_contradiction() {
            return Ok((Bitmap::new(ctx.rows), Bitmap::new(ctx.rows)));
        }
        if let Some((lo, hi)) = self.bounds() {
            if range.disjoint_from(lo, hi) {
                return Ok((Bitmap::new(ctx.rows), Bitmap::new(ctx.rows)));
            }
            if range.covers(lo, hi) {
                return Ok((Bitmap::ones(ctx.rows), Bitmap::ones(ctx.rows)));
            }
        }
        Ok((Bitmap::new(ctx.rows), Bitmap::ones(ctx.rows)))
    }

    /// Scalar cost hint for answering `range`.
    pub fn estimate_cost(&self, ctx: PartCtx, range: &RangePred) -> f64 {
        if let Some(idx) = self.index.lock().unwrap().as_ref() {
            return idx.estimate_cost(range);
        }
        std::fs::metadata(self.data_file(ctx.dir))
            .map(|m| m.len() as f64)
            .unwrap_or(ctx.rows as f64 * self.element_size().max(1) as f64)
    }

    /// Fraction of rows whose membership cannot be decided without a scan;
    /// the bitmap of those rows is stored into `iffy`.
    pub fn undecidable(&self, ctx: PartCtx, range: &RangePred, iffy: &mut Bitmap) -> f32 {
        if let Some(idx) = self.index.lock().unwrap().as_ref() {
            let (frac, bits) = idx.undecidable(range);
            *iffy = bits;
            return frac;
        }
        match self.estimate_range(ctx, range) {
            Ok((low, mut high)) => {
                high.and_not(&low);
                let frac = if ctx.rows == 0 {
                    0.0
                } else {
                    high.count() as f32 / ctx.rows as f32
                };
                *iffy = high;
                frac
            }
            Err(_) => {
                *iffy = Bitmap::ones(ctx.rows);
                1.0
            }
        }
    }

    /// Loads the index for `spec`, building and persisting it on first use.
    pub fn load_index(&self, ctx: PartCtx, spec: &str) -> PartResult<()> {
        let mut slot = self.index.lock().unwrap();
        if slot.is_some() {
            return Ok(());
        }
        let path = self.index_file(ctx.dir);
        let loaded = match index::load_index(spec, &path) {
            Ok(idx) => idx,
            Err(e) => {
                warn!("failed to read index file {:?}: {}", path, e);
                None
            }
        };
        let idx = match loaded {
            Some(idx) => idx,
            None => {
                let values = self.read_values_f64(ctx)?;
                match index::build_index(spec, &values, ctx.rows) {
                    Some(idx) => {
                        idx.write(&path)?;
                        idx
                    }
                    None => return Ok(()),
                }
            }
        };
        if let Some(csr_path) = ctx.export_csr {
            let target = csr_path.join(format!("{}.csr", self.name));
            match std::fs::File::create(&target) {
                Ok(mut f) => {
                    if let Err(e) = idx.export_csr(&mut f) {
                        warn!("csr export for {} failed: {}", self.name, e);
                    }
                }
                Err(e) => warn!("cannot create {:?}: {}", target, e),
            }
        }
        self.set_index_spec(spec);
        *slot = Some(idx);
        Ok(())
    }

    pub fn unload_index(&self) {
        *self.index.lock().unwrap() = None;
    }

    pub fn has_index(&self) -> bool {
        self.index.lock().unwrap().is_some()
    }

    pub fn purge_index_file(&self, ctx: PartCtx) -> PartResult<()> {
        self.unload_index();
        let path = self.index_file(ctx.dir);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Loads the whole data file into the in-memory cache.
    pub fn load_data(&self, ctx: PartCtx) -> PartResult<()> {
        if self.data.lock().unwrap().is_some() {
            return Ok(());
        }
        let mask = Bitmap::ones(ctx.rows);
        let arr = dispatch_scalar!(self.ctype, T => {
            let mut reader = ScanReader::open(ctx.fm, &self.data_file(ctx.dir), T::SIZE)?;
            let values = scan::select_file::<T>(&mut reader, &mask)?;
            typed_array_from(values)
        }, return Err(self.unsupported()));
        *self.data.lock().unwrap() = Some(Arc::new(arr));
        Ok(())
    }

    pub fn free_data(&self) {
        *self.data.lock().unwrap() = None;
    }

    /// Barrel feed: one double per row.
    pub fn cursor(&self, ctx: PartCtx) -> PartResult<FileCursor> {
        let elem = self.element_size();
        if elem <= 0 {
            return Err(self.unsupported());
        }
        let reader = ScanReader::open(ctx.fm, &self.data_file(ctx.dir), elem as usize)?;
        Ok(FileCursor::new(reader, decode_f64(self.ctype)))
    }

    pub fn count_hits(&self, ctx: PartCtx, range: &RangePred, mask: &Bitmap) -> PartResult<u64> {
        dispatch_scalar!(self.ctype, T => {
            let pred = CompiledPred::<T>::from_range(range);
            let data = self.data.lock().unwrap().clone();
            if let Some(arr) = data {
                let values = arr.slice::<T>().ok_or_else(|| self.unsupported())?;
                scan::count_array(values, mask, &pred)
            } else {
                let mut reader = ScanReader::open(ctx.fm, &self.data_file(ctx.dir), T::SIZE)?;
                scan::count_file(&mut reader, mask, &pred)
            }
        }, Ok(scan::row_range_hits(range, mask).count() as u64))
    }

    // ---- typed selection ----------------------------------------------

    pub fn select_ints(&self, ctx: PartCtx, mask: &Bitmap) -> PartResult<Vec<i32>> {
        match self.ctype {
            ColType::Byte => self.select_cast::<i8, i32>(ctx, mask, |v| v as i32),
            ColType::UByte => self.select_cast::<u8, i32>(ctx, mask, |v| v as i32),
            ColType::Short => self.select_cast::<i16, i32>(ctx, mask, |v| v as i32),
            ColType::UShort => self.select_cast::<u16, i32>(ctx, mask, |v| v as i32),
            ColType::Int => self.select_cast::<i32, i32>(ctx, mask, |v| v),
            _ => Err(self.unsupported()),
        }
    }

    pub fn select_uints(&self, ctx: PartCtx, mask: &Bitmap) -> PartResult<Vec<u32>> {
        match self.ctype {
            ColType::UByte => self.select_cast::<u8, u32>(ctx, mask, |v| v as u32),
            ColType::UShort => self.select_cast::<u16, u32>(ctx, mask, |v| v as u32),
            ColType::UInt | ColType::Category => self.select_cast::<u32, u32>(ctx, mask, |v| v),
            _ => Err(self.unsupported()),
        }
    }

    pub fn select_longs(&self, ctx: PartCtx, mask: &Bitmap) -> PartResult<Vec<i64>> {
        match self.ctype {
            ColType::Byte => self.select_cast::<i8, i64>(ctx, mask, |v| v as i64),
            ColType::UByte => self.select_cast::<u8, i64>(ctx, mask, |v| v as i64),
            ColType::Short => self.select_cast::<i16, i64>(ctx, mask, |v| v as i64),
            ColType::UShort => self.select_cast::<u16, i64>(ctx, mask, |v| v as i64),
            ColType::Int => self.select_cast::<i32, i64>(ctx, mask, |v| v as i64),
            ColType::UInt | ColType::Category => {
                self.select_cast::<u32, i64>(ctx, mask, |v| v as i64)
            }
            ColType::Long => self.select_cast::<i64, i64>(ctx, mask, |v| v),
            ColType::ULong | ColType::Oid => self.select_cast::<u64, i64>(ctx, mask, |v| v as i64),
            _ => Err(self.unsupported()),
        }
    }

    pub fn select_floats(&self, ctx: PartCtx, mask: &Bitmap) -> PartResult<Vec<f32>> {
        match self.ctype {
            ColType::Byte => self.select_cast::<i8, f32>(ctx, mask, |v| v as f32),
            ColType::UByte => self.select_cast::<u8, f32>(ctx, mask, |v| v as f32),
            ColType::Short => self.select_cast::<i16, f32>(ctx, mask, |v| v as f32),
            ColType::UShort => self.select_cast::<u16, f32>(ctx, mask, |v| v as f32),
            ColType::Float => self.select_cast::<f32, f32>(ctx, mask, |v| v),
            _ => Err(self.unsupported()),
        }
    }

    pub fn select_doubles(&self, ctx: PartCtx, mask: &Bitmap) -> PartResult<Vec<f64>> {
        dispatch_scalar!(self.ctype, T => {
            self.select_cast::<T, f64>(ctx, mask, |v| v.to_f64())
        }, Err(self.unsupported()))
    }

    fn select_cast<T: ScanVal, U>(
        &self,
        ctx: PartCtx,
        mask: &Bitmap,
        cast: impl Fn(T) -> U,
    ) -> PartResult<Vec<U>> {
        Ok(self.masked_values::<T>(ctx, mask)?.into_iter().map(cast).collect())
    }

    // ---- text / category ----------------------------------------------

    /// Rows equal to `value`. Only Text and Category columns.
    pub fn search(&self, ctx: PartCtx, value: &str) -> PartResult<Bitmap> {
        match self.ctype {
            ColType::Category => {
                if let Some(ref constant) = self.virtual_value {
                    return Ok(if constant == value {
                        Bitmap::ones(ctx.rows)
                    } else {
                        Bitmap::new(ctx.rows)
                    });
                }
                let dict = self.read_dictionary(ctx)?;
                match dict.iter().position(|v| v == value) {
                    Some(i) => {
                        let pred = DiscretePred::new(&self.name, vec![(i + 1) as f64]);
                        self.evaluate_discrete(ctx, &pred, &Bitmap::ones(ctx.rows))
                    }
                    None => Ok(Bitmap::new(ctx.rows)),
                }
            }
            ColType::Text => {
                let mut out = Bitmap::new(ctx.rows);
                self.for_each_string(ctx, |row, s| {
                    if s == value {
                        out.set(row);
                    }
                })?;
                out.adjust_size(ctx.rows, false);
                Ok(out)
            }
            _ => Err(self.unsupported()),
        }
    }

    /// Rows equal to any of `values`.
    pub fn search_many(&self, ctx: PartCtx, values: &[&str]) -> PartResult<Bitmap> {
        match self.ctype {
            ColType::Category => {
                if let Some(ref constant) = self.virtual_value {
                    return Ok(if values.iter().any(|v| *v == constant.as_str()) {
                        Bitmap::ones(ctx.rows)
                    } else {
                        Bitmap::new(ctx.rows)
                    });
                }
                let dict = self.read_dictionary(ctx)?;
                let codes: Vec<f64> = values
                    .iter()
                    .filter_map(|value| dict.iter().position(|v| v == value))
                    .map(|i| (i + 1) as f64)
                    .collect();
                if codes.is_empty() {
                    return Ok(Bitmap::new(ctx.rows));
                }
                let pred = DiscretePred::new(&self.name, codes);
                self.evaluate_discrete(ctx, &pred, &Bitmap::ones(ctx.rows))
            }
            ColType::Text => {
                let mut out = Bitmap::new(ctx.rows);
                self.for_each_string(ctx, |row, s| {
                    if values.iter().any(|v| *v == s) {
                        out.set(row);
                    }
                })?;
                out.adjust_size(ctx.rows, false);
                Ok(out)
            }
            _ => Err(self.unsupported()),
        }
    }

    /// Substring match over Text columns; exact match elsewhere.
    pub fn keyword_search(&self, ctx: PartCtx, value: &str) -> PartResult<Bitmap> {
        if self.ctype != ColType::Text {
            return self.search(ctx, value);
        }
        let mut out = Bitmap::new(ctx.rows);
        self.for_each_string(ctx, |row, s| {
            if s.contains(value) {
                out.set(row);
            }
        })?;
        out.adjust_size(ctx.rows, false);
        Ok(out)
    }

    fn read_dictionary(&self, ctx: PartCtx) -> PartResult<Vec<String>> {
        let raw = std::fs::read_to_string(self.dictionary_file(ctx.dir))?;
        Ok(raw.lines().map(|l| l.to_string()).collect())
    }

    fn for_each_string(
        &self,
        ctx: PartCtx,
        mut visit: impl FnMut(usize, &str),
    ) -> PartResult<()> {
        if let Some(ref constant) = self.virtual_value {
            for row in 0..ctx.rows {
                visit(row, constant);
            }
            return Ok(());
        }
        let data = std::fs::read(self.data_file(ctx.dir))?;
        let sp = std::fs::read(self.offsets_file(ctx.dir))?;
        if sp.len() != (ctx.rows + 1) * 8 {
            return Err(PartError::BadFileSize {
                path: self.offsets_file(ctx.dir),
                size: sp.len() as u64,
                expected: ((ctx.rows + 1) * 8) as u64,
            });
        }
        let offset = |i: usize| -> usize {
            u64::from_le_bytes(sp[i * 8..(i + 1) * 8].try_into().unwrap()) as usize
        };
        for row in 0..ctx.rows {
            let start = offset(row);
            let end = offset(row + 1).saturating_sub(1); // trailing NUL
            if end > data.len() || start > end {
                return Err(PartError::Inconsistent(format!(
                    "string offsets of column {} out of range at row {}",
                    self.name, row
                )));
            }
            visit(row, &String::from_utf8_lossy(&data[start..end]));
        }
        Ok(())
    }

    // ---- header block -------------------------------------------------

    /// Parses a `Begin Column` block. Unknown keys warn and are skipped.
    pub fn from_header_block(lines: &[(String, String)]) -> PartResult<Column> {
        let mut name = None;
        let mut ctype = None;
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        let mut spec = String::new();
        for (key, value) in lines {
            if key.eq_ignore_ascii_case("name") {
                name = Some(unquote(value).to_string());
            } else if key.eq_ignore_ascii_case("data_type") || key.eq_ignore_ascii_case("type") {
                ctype = Some(ColType::parse(value).ok_or_else(|| PartError::ParseError {
                    field: "data_type".to_string(),
                    value: value.clone(),
                })?);
            } else if key.eq_ignore_ascii_case("minimum") {
                lo = value.parse().map_err(|_| PartError::ParseError {
                    field: "minimum".to_string(),
                    value: value.clone(),
                })?;
            } else if key.eq_ignore_ascii_case("maximum") {
                hi = value.parse().map_err(|_| PartError::ParseError {
                    field: "maximum".to_string(),
                    value: value.clone(),
                })?;
            } else if key.eq_ignore_ascii_case("index") {
                spec = unquote(value).to_string();
            } else {
                warn!("ignoring unknown column key {:?}", key);
            }
        }
        let name = name.ok_or_else(|| PartError::ParseError {
            field: "name".to_string(),
            value: String::new(),
        })?;
        let ctype = ctype.ok_or_else(|| PartError::ParseError {
            field: "data_type".to_string(),
            value: name.clone(),
        })?;
        let col = Column::new(&name, ctype);
        col.set_bounds(lo, hi);
        col.set_index_spec(&spec);
        Ok(col)
    }

    pub fn write_header_block(&self, w: &mut impl Write) -> std::io::Result<()> {
        writeln!(w, "Begin Column")?;
        writeln!(w, "name = \"{}\"", self.name)?;
        writeln!(w, "data_type = {}", self.ctype.name())?;
        if let Some((lo, hi)) = self.bounds() {
            writeln!(w, "minimum = {}", lo)?;
            writeln!(w, "maximum = {}", hi)?;
        }
        let spec = self.index_spec();
        if !spec.is_empty() {
            writeln!(w, "index = {}", spec)?;
        }
        writeln!(w, "End Column")
    }
}

/// Wraps a concrete value vector in the matching [`TypedArray`] variant.
pub trait IntoTypedArray: Sized {
    fn into_typed(values: Vec<Self>) -> TypedArray;
}

macro_rules! impl_into_typed {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(impl IntoTypedArray for $t {
            fn into_typed(values: Vec<$t>) -> TypedArray {
                TypedArray::$variant(values)
            }
        })*
    };
}

impl_into_typed!(
    i8 => Byte, u8 => UByte, i16 => Short, u16 => UShort, i32 => Int,
    u32 => UInt, i64 => Long, u64 => ULong, f32 => Float, f64 => Double,
);

fn typed_array_from<T: ScanVal + IntoTypedArray>(values: Vec<T>) -> TypedArray {
    T::into_typed(values)
}

fn decode_f64(ctype: ColType) -> fn(&[u8]) -> f64 {
    match ctype {
        ColType::Byte => |b| i8::from_le_bytes(b.try_into().unwrap()) as f64,
        ColType::UByte => |b| u8::from_le_bytes(b.try_into().unwrap()) as f64,
        ColType::Short => |b| i16::from_le_bytes(b.try_into().unwrap()) as f64,
        ColType::UShort => |b| u16::from_le_bytes(b.try_into().unwrap()) as f64,
        ColType::Int => |b| i32::from_le_bytes(b.try_into().unwrap()) as f64,
        ColType::UInt | ColType::Category => |b| u32::from_le_bytes(b.try_into().unwrap()) as f64,
        ColType::Long => |b| i64::from_le_bytes(b.try_into().unwrap()) as f64,
        ColType::ULong | ColType::Oid => |b| u64::from_le_bytes(b.try_into().unwrap()) as f64,
        ColType::Float => |b| f32::from_le_bytes(b.try_into().unwrap()) as f64,
        ColType::Double => |b| f64::from_le_bytes(b.try_into().unwrap()),
        ColType::Text => |_| f64::NAN,
    }
}

pub(crate) fn unquote(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}
