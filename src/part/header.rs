//! The partition's persistent metadata header: a hand-written, line-oriented
//! text file with case-insensitive keys, followed by one block per column.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use itertools::Itertools;

use crate::errors::{PartError, PartResult};
use crate::part::column::{unquote, Column};

pub const HEADER_FILE: &str = "-part.txt";
/// Accepted on read for old partitions, never written.
pub const LEGACY_HEADER_FILE: &str = "table.tdc";
pub const MASK_FILE: &str = "-part.msk";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PartState {
    Unknown = 0,
    Stable = 1,
    PreTransition = 2,
    Transitioning = 3,
    PostTransition = 4,
}

impl PartState {
    pub fn from_code(code: u32) -> Option<PartState> {
        match code {
            0 => Some(PartState::Unknown),
            1 => Some(PartState::Stable),
            2 => Some(PartState::PreTransition),
            3 => Some(PartState::Transitioning),
            4 => Some(PartState::PostTransition),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MeshDim {
    pub name: Option<String>,
    pub size: u64,
}

/// Everything the header file holds.
pub struct HeaderInfo {
    pub name: String,
    pub description: String,
    pub rows: u64,
    pub timestamp: u64,
    pub state: PartState,
    pub alt_dir: Option<PathBuf>,
    pub meta_tags: Vec<(String, String)>,
    pub shape: Option<Vec<MeshDim>>,
    pub index_spec: String,
    pub columns: Vec<Arc<Column>>,
    /// Presentation order, present when a column selection was applied.
    pub selected: Option<Vec<String>>,
    pub tot_props: Option<u32>,
    pub max_name_len: usize,
}

impl Default for HeaderInfo {
    fn default() -> HeaderInfo {
        HeaderInfo {
            name: String::new(),
            description: String::new(),
            rows: 0,
            timestamp: 0,
            state: PartState::Unknown,
            alt_dir: None,
            meta_tags: vec![],
            shape: None,
            index_spec: String::new(),
            columns: vec![],
            selected: None,
            tot_props: None,
            max_name_len: 0,
        }
    }
}

pub fn header_path(dir: &Path) -> Option<PathBuf> {
    let primary = dir.join(HEADER_FILE);
    if primary.exists() {
        return Some(primary);
    }
    let legacy = dir.join(LEGACY_HEADER_FILE);
    if legacy.exists() {
        debug!("using legacy header name in {:?}", dir);
        return Some(legacy);
    }
    None
}

enum Selector {
    Ordinal(usize),
    Range(usize, usize),
    Name(String),
}

/// Consumes the whole comma/semicolon-separated entry list.
fn parse_selectors(value: &str) -> PartResult<Vec<Selector>> {
    let mut out = Vec::new();
    for entry in value.split([',', ';']) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if let Some((a, b)) = entry.split_once('-') {
            if let (Ok(a), Ok(b)) = (a.trim().parse::<usize>(), b.trim().parse::<usize>()) {
                if a == 0 || b < a {
                    return Err(PartError::ParseError {
                        field: "Columns_Selected".to_string(),
                        value: entry.to_string(),
                    });
                }
                out.push(Selector::Range(a, b));
                continue;
            }
        }
        match entry.parse::<usize>() {
            Ok(0) => {
                return Err(PartError::ParseError {
                    field: "Columns_Selected".to_string(),
                    value: entry.to_string(),
                })
            }
            Ok(n) => out.push(Selector::Ordinal(n)),
            Err(_) => out.push(Selector::Name(entry.to_string())),
        }
    }
    Ok(out)
}

fn parse_meta_tags(value: &str) -> Vec<(String, String)> {
    let mut tags: Vec<(String, String)> = Vec::new();
    for entry in value.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        match entry.split_once('=') {
            Some((k, v)) => {
                let k = unquote(k).to_string();
                let v = unquote(v).to_string();
                if tags.iter().any(|(name, _)| name.eq_ignore_ascii_case(&k)) {
                    warn!("duplicate meta tag {:?} ignored", k);
                } else {
                    tags.push((k, v));
                }
            }
            None => warn!("meta tag entry without '=': {:?}", entry),
        }
    }
    tags
}

fn parse_shape(value: &str) -> PartResult<Vec<MeshDim>> {
    let inner = value
        .trim()
        .trim_start_matches('(')
        .trim_end_matches(')');
    let mut dims = Vec::new();
    for entry in inner.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (name, size) = match entry.split_once('=') {
            Some((n, s)) => (Some(unquote(n).to_string()), s.trim()),
            None => (None, entry),
        };
        let size = size.parse::<u64>().map_err(|_| PartError::ParseError {
            field: "columnShape".to_string(),
            value: entry.to_string(),
        })?;
        dims.push(MeshDim { name, size });
    }
    Ok(dims)
}

/// Reads and validates the header of `dir`. Count mismatches between the
/// declaration and the observed column blocks are logged; the observed
/// blocks win.
pub fn read_header(dir: &Path) -> PartResult<HeaderInfo> {
    let path = header_path(dir).ok_or_else(|| PartError::HeaderNotFound(dir.to_path_buf()))?;
    let reader = BufReader::new(File::open(&path)?);
    let mut info = HeaderInfo::default();
    let mut declared_columns: Option<u32> = None;
    let mut selectors: Option<Vec<Selector>> = None;
    let mut in_header = false;
    let mut column_block: Option<Vec<(String, String)>> = None;

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.eq_ignore_ascii_case("BEGIN HEADER") {
            in_header = true;
            continue;
        }
        if line.eq_ignore_ascii_case("END HEADER") {
            in_header = false;
            continue;
        }
        if line.eq_ignore_ascii_case("Begin Column") || line.eq_ignore_ascii_case("Begin Property")
        {
            column_block = Some(Vec::new());
            continue;
        }
        if line.eq_ignore_ascii_case("End Column") || line.eq_ignore_ascii_case("End Property") {
            if let Some(block) = column_block.take() {
                match Column::from_header_block(&block) {
                    Ok(col) => info.columns.push(Arc::new(col)),
                    Err(e) => warn!("skipping malformed column block in {:?}: {}", path, e),
                }
            }
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => {
                warn!("ignoring header line without '=': {:?}", line);
                continue;
            }
        };
        if let Some(ref mut block) = column_block {
            block.push((key.to_string(), value.to_string()));
            continue;
        }
        if !in_header {
            warn!("ignoring stray line outside header: {:?}", line);
            continue;
        }
        if key.eq_ignore_ascii_case("Name") {
            info.name = unquote(value).to_string();
        } else if key.eq_ignore_ascii_case("Description") {
            info.description = unquote(value).to_string();
        } else if key.eq_ignore_ascii_case("Number_of_rows")
            || key.eq_ignore_ascii_case("Number_of_events")
        {
            info.rows = value.parse().map_err(|_| PartError::ParseError {
                field: "Number_of_rows".to_string(),
                value: value.to_string(),
            })?;
        } else if key.eq_ignore_ascii_case("Number_of_columns")
            || key.eq_ignore_ascii_case("Number_of_properties")
        {
            declared_columns = Some(value.parse().map_err(|_| PartError::ParseError {
                field: "Number_of_columns".to_string(),
                value: value.to_string(),
            })?);
        } else if key.eq_ignore_ascii_case("Tot_num_of_prop") {
            info.tot_props = value.parse().ok();
        } else if key.eq_ignore_ascii_case("Columns_Selected") {
            selectors = Some(parse_selectors(value)?);
        } else if key.eq_ignore_ascii_case("Timestamp") {
            info.timestamp = value.parse().map_err(|_| PartError::ParseError {
                field: "Timestamp".to_string(),
                value: value.to_string(),
            })?;
        } else if key.eq_ignore_ascii_case("State") {
            let code: u32 = value.parse().map_err(|_| PartError::ParseError {
                field: "State".to_string(),
                value: value.to_string(),
            })?;
            info.state = PartState::from_code(code).ok_or_else(|| PartError::ParseError {
                field: "State".to_string(),
                value: value.to_string(),
            })?;
        } else if key.eq_ignore_ascii_case("Alternative_Directory") {
            let dir = unquote(value);
            if !dir.is_empty() {
                info.alt_dir = Some(PathBuf::from(dir));
            }
        } else if key.eq_ignore_ascii_case("metaTags")
            || key.eq_ignore_ascii_case("Table.metaTags")
            || key.eq_ignore_ascii_case("Partition.metaTags")
        {
            info.meta_tags = parse_meta_tags(value);
        } else if key.eq_ignore_ascii_case("columnShape") || key.eq_ignore_ascii_case("meshShape") {
            info.shape = Some(parse_shape(value)?);
        } else if key.eq_ignore_ascii_case("index") {
            info.index_spec = unquote(value).to_string();
        } else {
            warn!("ignoring unknown header key {:?} in {:?}", key, path);
        }
    }

    if let Some(selectors) = selectors {
        let all = std::mem::take(&mut info.columns);
        let mut chosen: Vec<Arc<Column>> = Vec::new();
        let mut order = Vec::new();
        let mut keep = |col: Arc<Column>, order: &mut Vec<String>, chosen: &mut Vec<Arc<Column>>| {
            if !order.iter().any(|n: &String| n.eq_ignore_ascii_case(col.name())) {
                order.push(col.name().to_string());
                chosen.push(col);
            }
        };
        let mut all: Vec<Option<Arc<Column>>> = all.into_iter().map(Some).collect();
        for sel in &selectors {
            match sel {
                Selector::Ordinal(n) => {
                    if let Some(slot) = all.get_mut(n - 1) {
                        if let Some(col) = slot.take() {
                            keep(col, &mut order, &mut chosen);
                        }
                    }
                }
                Selector::Range(a, b) => {
                    for n in *a..=*b {
                        if let Some(slot) = all.get_mut(n - 1) {
                            if let Some(col) = slot.take() {
                                keep(col, &mut order, &mut chosen);
                            }
                        }
                    }
                }
                Selector::Name(name) => {
                    if let Some(slot) = all
                        .iter_mut()
                        .find(|c| c.as_ref().map(|c| c.name().eq_ignore_ascii_case(name)) == Some(true))
                    {
                        if let Some(col) = slot.take() {
                            keep(col, &mut order, &mut chosen);
                        }
                    }
                }
            }
        }
        let dropped = all.iter().filter(|c| c.is_some()).count();
        if dropped > 0 {
            debug!("column selection discarded {} columns", dropped);
        }
        info.columns = chosen;
        info.selected = Some(order);
    }

    // meta tags that name no column become single-value category columns
    for (tag, value) in info.meta_tags.clone() {
        if value != "*"
            && !info
                .columns
                .iter()
                .any(|c| c.name().eq_ignore_ascii_case(&tag))
        {
            debug!("synthesizing category column for meta tag {}", tag);
            info.columns.push(Arc::new(Column::synthesized(&tag, &value)));
        }
    }

    if let Some(declared) = declared_columns {
        if declared as usize != info.columns.len() {
            warn!(
                "{:?} declares {} columns but {} were observed; using {}",
                path,
                declared,
                info.columns.len(),
                info.columns.len()
            );
        }
    }
    if let Some(ref shape) = info.shape {
        let product: u64 = shape.iter().map(|d| d.size).product();
        if product != info.rows {
            let shape_str = shape.iter().map(|d| d.size).join("x");
            info.shape = None;
            return Err(PartError::BadMeshShape {
                shape: shape_str,
                rows: info.rows,
            });
        }
    }
    info.max_name_len = info
        .columns
        .iter()
        .map(|c| c.name().len())
        .max()
        .unwrap_or(0);
    Ok(info)
}

/// Stable placeholder for a nameless partition, derived from a checksum of
/// the directory path. The first character is normalized into a letter.
pub fn placeholder_name(dir: &Path) -> String {
    let hash = seahash::hash(dir.to_string_lossy().as_bytes());
    let mut name = format!("{:016x}", hash);
    let first = name.as_bytes()[0];
    if !first.is_ascii_alphabetic() {
        let letter = b'a' + (hash % 26) as u8;
        name.replace_range(0..1, std::str::from_utf8(&[letter]).unwrap());
    }
    name
}

/// Rewrites the header in canonical order, preceded by a UTC timestamp
/// comment. Always writes the current header name, never the legacy one.
pub fn write_header(dir: &Path, info: &HeaderInfo) -> PartResult<()> {
    let path = dir.join(HEADER_FILE);
    let mut w = BufWriter::new(File::create(&path)?);
    writeln!(w, "# header written {}", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"))?;
    writeln!(w, "BEGIN HEADER")?;
    let name = if info.name.is_empty() {
        placeholder_name(dir)
    } else {
        info.name.clone()
    };
    writeln!(w, "Name = \"{}\"", name)?;
    if !info.description.is_empty() {
        writeln!(w, "Description = \"{}\"", info.description)?;
    }
    writeln!(w, "Number_of_rows = {}", info.rows)?;
    writeln!(w, "Number_of_columns = {}", info.columns.len())?;
    if let Some(tot) = info.tot_props {
        if tot as usize > info.columns.len() {
            writeln!(w, "Tot_num_of_prop = {}", tot)?;
        }
    }
    if let Some(ref order) = info.selected {
        writeln!(w, "Columns_Selected = {}", order.iter().join(", "))?;
    }
    writeln!(w, "Timestamp = {}", info.timestamp)?;
    writeln!(w, "State = {}", info.state.code())?;
    if let Some(ref alt) = info.alt_dir {
        writeln!(w, "Alternative_Directory = \"{}\"", alt.display())?;
    }
    if !info.meta_tags.is_empty() {
        let tags = info
            .meta_tags
            .iter()
            .map(|(k, v)| format!("{} = {}", k, v))
            .join(", ");
        writeln!(w, "metaTags = {}", tags)?;
    }
    if let Some(ref shape) = info.shape {
        let dims = shape
            .iter()
            .map(|d| match d.name {
                Some(ref n) => format!("{}={}", n, d.size),
                None => format!("{}", d.size),
            })
            .join(", ");
        writeln!(w, "columnShape = ({})", dims)?;
    }
    if !info.index_spec.is_empty() {
        writeln!(w, "index = {}", info.index_spec)?;
    }
    writeln!(w, "END HEADER")?;
    for col in &info.columns {
        if col.is_virtual() {
            continue;
        }
        col.write_header_block(&mut w)?;
    }
    w.flush()?;
    Ok(())
}
