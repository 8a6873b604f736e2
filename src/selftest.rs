//! Partition self-verification: file-size checks, optional index timing,
//! and randomized or recursive query tests cross-checked against
//! sequential scans. No panic escapes; problems increment the partition's
//! error count and are reported back as a total.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use scoped_threadpool::Pool;

use crate::config::Config;
use crate::eval::Evaluator;
use crate::part::column::Column;
use crate::part::partition::Partition;
use crate::scan::predicate::RangePred;

/// Partitions above this size use the bounded random test unless long
/// tests are requested.
const QUICK_TEST_ROW_LIMIT: usize = 1_000_000;
/// Recursion floor for the subdivision test.
const SUBDIVISION_MIN_COUNT: u64 = 16;

#[derive(Clone, Debug)]
pub struct SelfTestOptions {
    pub nqueries: usize,
    pub threads: usize,
    pub long_tests: bool,
    pub test_index_speed: bool,
    /// Fixed seed unless the randomized option is set.
    pub seed: u64,
}

impl Default for SelfTestOptions {
    fn default() -> SelfTestOptions {
        SelfTestOptions {
            nqueries: 128,
            threads: num_cpus::get().min(4),
            long_tests: false,
            test_index_speed: false,
            seed: 0x5eed_0f_u64,
        }
    }
}

impl SelfTestOptions {
    pub fn from_config(config: &Config, name: &str) -> SelfTestOptions {
        let prefix = Some(name);
        let mut opts = SelfTestOptions {
            long_tests: config.long_tests(prefix),
            test_index_speed: config.test_index_speed(prefix),
            ..SelfTestOptions::default()
        };
        if config.random_tests(prefix) {
            opts.seed = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(opts.seed);
        }
        opts
    }
}

/// Runs the verification routine and returns the number of problems found.
pub fn self_test(part: &Partition, opts: &SelfTestOptions) -> usize {
    let errors = AtomicUsize::new(0);
    check_file_sizes(part, &errors);
    if opts.test_index_speed {
        index_speed_test(part);
    }

    let numeric: Vec<Arc<Column>> = part
        .columns()
        .into_iter()
        .filter(|c| c.ctype().is_numeric() && !c.is_virtual())
        .collect();
    if numeric.is_empty() || part.nrows() == 0 {
        return errors.load(Ordering::SeqCst);
    }

    let workers = opts.threads.max(1);
    let shard = |shard_id: usize| {
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            run_shard(part, opts, &numeric, shard_id)
        }));
        match outcome {
            Ok(found) => {
                if found > 0 {
                    errors.fetch_add(found, Ordering::SeqCst);
                }
            }
            Err(_) => {
                error!("self-test worker {} panicked", shard_id);
                errors.fetch_add(1, Ordering::SeqCst);
                part.inc_errors();
            }
        }
    };
    if workers > 1 {
        let mut pool = Pool::new((workers - 1) as u32);
        pool.scoped(|scope| {
            let shard = &shard;
            for id in 1..workers {
                scope.execute(move || shard(id));
            }
            // the calling thread takes a shard as well
            shard(0);
        });
    } else {
        shard(0);
    }
    let total = errors.load(Ordering::SeqCst);
    if total > 0 {
        warn!("self-test of {} found {} problems", part.name(), total);
    } else {
        info!("self-test of {} passed", part.name());
    }
    total
}

/// Every fixed-size column file must hold exactly rows × element-size
/// bytes.
fn check_file_sizes(part: &Partition, errors: &AtomicUsize) {
    let ctx = part.ctx();
    for col in part.columns() {
        if col.is_virtual() || col.element_size() <= 0 {
            continue;
        }
        let expected = (part.nrows() * col.element_size() as usize) as u64;
        match std::fs::metadata(col.data_file(ctx.dir)) {
            Ok(meta) if meta.len() == expected => {}
            Ok(meta) => {
                warn!(
                    "column {} file has {} bytes, expected {}",
                    col.name(),
                    meta.len(),
                    expected
                );
                errors.fetch_add(1, Ordering::SeqCst);
                part.inc_errors();
            }
            Err(e) => {
                warn!("cannot stat column {} data file: {}", col.name(), e);
                errors.fetch_add(1, Ordering::SeqCst);
                part.inc_errors();
            }
        }
    }
}

/// Micro-benchmark: time one indexed evaluation per numeric column.
fn index_speed_test(part: &Partition) {
    let ctx = part.ctx();
    for col in part.columns() {
        if !col.ctype().is_numeric() || col.is_virtual() {
            continue;
        }
        if let Err(e) = col.compute_min_max(ctx) {
            warn!("cannot compute bounds of {}: {}", col.name(), e);
            continue;
        }
        let (lo, hi) = match col.bounds() {
            Some(b) => b,
            None => continue,
        };
        let spec = {
            let s = part.index_spec();
            if s.is_empty() {
                "equality".to_string()
            } else {
                s
            }
        };
        let start = Instant::now();
        if let Err(e) = col.load_index(ctx, &spec) {
            warn!("index load of {} failed: {}", col.name(), e);
            continue;
        }
        let load_time = start.elapsed();
        let probe = RangePred::between(col.name(), lo, (lo + hi) / 2.0);
        let start = Instant::now();
        let _ = col.estimate_range(ctx, &probe);
        info!(
            "index timing for {}: load {:?}, estimate {:?}",
            col.name(),
            load_time,
            start.elapsed()
        );
        col.unload_index();
    }
}

fn run_shard(
    part: &Partition,
    opts: &SelfTestOptions,
    numeric: &[Arc<Column>],
    shard_id: usize,
) -> usize {
    let mut rng = XorShiftRng::seed_from_u64(opts.seed ^ (shard_id as u64).wrapping_mul(0x9e37_79b9));
    let col = &numeric[rng.random_range(0..numeric.len())];
    let ctx = part.ctx();
    if let Err(e) = col.compute_min_max(ctx) {
        warn!("cannot compute bounds of {}: {}", col.name(), e);
        return 1;
    }
    let (lo, hi) = match col.bounds() {
        Some(b) if b.0 < b.1 => b,
        _ => return 0,
    };
    let quick = part.nrows() > QUICK_TEST_ROW_LIMIT && !opts.long_tests;
    if quick {
        quick_test(part, col, lo, hi, opts.nqueries, &mut rng)
    } else {
        query_test(part, col.name(), lo, hi)
    }
}

/// Bounded number of random ranges, each cross-checked two ways: the
/// counting scan must agree with the result popcount, and the negation
/// scan must complement it within the active mask.
fn quick_test(
    part: &Partition,
    col: &Arc<Column>,
    lo: f64,
    hi: f64,
    nqueries: usize,
    rng: &mut XorShiftRng,
) -> usize {
    let eval = Evaluator::new(part);
    let mut found = 0;
    for _ in 0..nqueries {
        let a = rng.random_range(lo..hi);
        let b = rng.random_range(lo..hi);
        let range = RangePred::half_open(col.name(), a.min(b), a.max(b));
        let mask = part.active_mask();
        let hits = match eval.evaluate_masked(&range.clone().into(), &mask) {
            Ok(hits) => hits,
            Err(e) => {
                warn!("evaluate {} failed: {}", range, e);
                found += 1;
                part.inc_errors();
                continue;
            }
        };
        let counted = eval.count_hits(&range).unwrap_or(u64::MAX);
        if counted != hits.count() as u64 {
            warn!(
                "count mismatch for {}: popcount {} vs counted {}",
                range,
                hits.count(),
                counted
            );
            found += 1;
            part.inc_errors();
        }
        match eval.negative_scan(&range, &mask) {
            Ok(misses) => {
                let mut union = hits.clone();
                union.or(&misses);
                let mut overlap = hits.clone();
                overlap.and(&misses);
                if union != mask || !overlap.is_empty() {
                    warn!("negation of {} does not complement the mask", range);
                    found += 1;
                    part.inc_errors();
                }
            }
            Err(e) => {
                warn!("negative scan of {} failed: {}", range, e);
                found += 1;
                part.inc_errors();
            }
        }
    }
    found
}

/// Recursive subdivision: counts over `[a, c)` must equal the sum of the
/// counts over `[a, b)` and `[b, c)` at the tri-section points.
fn query_test(part: &Partition, column: &str, lo: f64, hi: f64) -> usize {
    let eval = Evaluator::new(part);
    let total = match eval.count_hits(&RangePred::half_open(column, lo, hi)) {
        Ok(n) => n,
        Err(e) => {
            warn!("count over [{}, {}) failed: {}", lo, hi, e);
            part.inc_errors();
            return 1;
        }
    };
    subdivide(part, &eval, column, lo, hi, total)
}

fn subdivide(
    part: &Partition,
    eval: &Evaluator,
    column: &str,
    a: f64,
    c: f64,
    expected: u64,
) -> usize {
    if expected < SUBDIVISION_MIN_COUNT || c <= a {
        return 0;
    }
    let third = (c - a) / 3.0;
    let mut found = 0;
    // additivity must hold at both tri-section points; recursion descends
    // through the first split only
    for (i, b) in [a + third, a + 2.0 * third].into_iter().enumerate() {
        if b <= a || b >= c {
            continue;
        }
        let left = eval.count_hits(&RangePred::half_open(column, a, b));
        let right = eval.count_hits(&RangePred::half_open(column, b, c));
        match (left, right) {
            (Ok(l), Ok(r)) => {
                if l + r != expected {
                    warn!(
                        "split failure on {}: [{}, {}) has {} but [{}, {}) + [{}, {}) = {}",
                        column, a, c, expected, a, b, b, c, l + r
                    );
                    found += 1;
                    part.inc_errors();
                } else if i == 0 {
                    found += subdivide(part, eval, column, a, b, l);
                    found += subdivide(part, eval, column, b, c, r);
                }
            }
            _ => {
                warn!("count failed during subdivision of {}", column);
                found += 1;
                part.inc_errors();
            }
        }
    }
    found
}

/// Convenience wrapper reading every option from configuration.
pub fn self_test_with_config(part: &Partition, config: &Config) -> usize {
    let opts = SelfTestOptions::from_config(config, &part.name());
    self_test(part, &opts)
}
