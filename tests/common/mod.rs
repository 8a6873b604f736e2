//! Shared fixtures: build partition directories on disk the way the
//! runtime expects to find them.
#![allow(dead_code)]

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};

use partdb::config::Config;
use partdb::part::header::{self, HeaderInfo};
use partdb::part::{ColType, Column, Partition};
use partdb::FileManager;

pub fn write_i32_column(dir: &Path, name: &str, values: &[i32]) {
    let mut w = BufWriter::new(File::create(dir.join(name)).unwrap());
    for &v in values {
        w.write_i32::<LittleEndian>(v).unwrap();
    }
    w.flush().unwrap();
}

pub fn write_i64_column(dir: &Path, name: &str, values: &[i64]) {
    let mut w = BufWriter::new(File::create(dir.join(name)).unwrap());
    for &v in values {
        w.write_i64::<LittleEndian>(v).unwrap();
    }
    w.flush().unwrap();
}

pub fn write_f64_column(dir: &Path, name: &str, values: &[f64]) {
    let mut w = BufWriter::new(File::create(dir.join(name)).unwrap());
    for &v in values {
        w.write_f64::<LittleEndian>(v).unwrap();
    }
    w.flush().unwrap();
}

pub fn write_u32_column(dir: &Path, name: &str, values: &[u32]) {
    let mut w = BufWriter::new(File::create(dir.join(name)).unwrap());
    for &v in values {
        w.write_u32::<LittleEndian>(v).unwrap();
    }
    w.flush().unwrap();
}

/// Text column: NUL-terminated strings plus the `.sp` offset sidecar.
pub fn write_text_column(dir: &Path, name: &str, values: &[&str]) {
    let mut data = Vec::new();
    let mut offsets = vec![0u64];
    for v in values {
        data.extend_from_slice(v.as_bytes());
        data.push(0);
        offsets.push(data.len() as u64);
    }
    std::fs::write(dir.join(name), &data).unwrap();
    let mut w = BufWriter::new(File::create(dir.join(format!("{}.sp", name))).unwrap());
    for off in offsets {
        w.write_u64::<LittleEndian>(off).unwrap();
    }
    w.flush().unwrap();
}

/// Category column: u32 codes (1-based) plus the `.dic` sidecar.
pub fn write_category_column(dir: &Path, name: &str, dictionary: &[&str], codes: &[u32]) {
    write_u32_column(dir, name, codes);
    let mut w = BufWriter::new(File::create(dir.join(format!("{}.dic", name))).unwrap());
    for entry in dictionary {
        writeln!(w, "{}", entry).unwrap();
    }
    w.flush().unwrap();
}

pub fn write_basic_header(dir: &Path, name: &str, rows: u64, columns: &[(&str, ColType)]) {
    let info = HeaderInfo {
        name: name.to_string(),
        rows,
        timestamp: 1_700_000_000,
        columns: columns
            .iter()
            .map(|&(n, t)| Arc::new(Column::new(n, t)))
            .collect(),
        ..HeaderInfo::default()
    };
    header::write_header(dir, &info).unwrap();
}

pub fn open_partition(dir: &Path) -> Arc<Partition> {
    Partition::from_dir(dir, &Config::new(), FileManager::new()).unwrap()
}

/// Partition with one Int column `x` = 1..=10, the shape most scenarios
/// start from.
pub fn ten_row_partition(dir: &Path) -> Arc<Partition> {
    let values: Vec<i32> = (1..=10).collect();
    write_i32_column(dir, "x", &values);
    write_basic_header(dir, "ten", 10, &[("x", ColType::Int)]);
    open_partition(dir)
}
