//! Read-mostly, column-oriented analytical partitions: binary column files
//! plus a textual header per directory, compressed-bitmap range queries,
//! row-identifier resolution, and multi-dimensional histograms.

#[macro_use]
extern crate log;

pub mod bitmap;
pub mod config;
pub mod errors;
pub mod eval;
pub mod file_manager;
pub mod hist;
pub mod index;
pub mod index_builder;
pub mod part;
pub mod rid;
pub mod scan;
pub mod selftest;

pub use crate::bitmap::Bitmap;
pub use crate::config::Config;
pub use crate::errors::{PartError, PartResult};
pub use crate::eval::Evaluator;
pub use crate::file_manager::FileManager;
pub use crate::hist::HistogramEngine;
pub use crate::part::{ColType, Column, PartState, Partition};
pub use crate::rid::Rid;
pub use crate::scan::predicate::{
    AnyAnyPred, ArithPred, Barrel, DiscretePred, Expr, Op, PredNode, RangePred, StringPred,
};
pub use crate::scan::AccessHint;
