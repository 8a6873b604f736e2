//! Parallel index construction. A shared atomic counter hands out column
//! positions; each worker computes missing bounds, builds and releases the
//! index, and tells the file manager to drop the column's buffers.

use std::sync::atomic::{AtomicUsize, Ordering};

use scoped_threadpool::Pool;

use crate::part::partition::Partition;

/// Builds indexes for all columns of `part` with `nthreads` workers.
/// Worker failures are logged by the joining thread and returned as a
/// count; they never propagate as panics.
pub fn build_indexes(part: &Partition, spec: &str, nthreads: usize) -> usize {
    let columns = part.columns();
    let next = AtomicUsize::new(0);
    let failures = AtomicUsize::new(0);
    let worker = |who: usize| loop {
        let i = next.fetch_add(1, Ordering::SeqCst);
        if i >= columns.len() {
            break;
        }
        let col = &columns[i];
        if col.is_virtual() || col.element_size() <= 0 {
            continue;
        }
        let ctx = part.ctx();
        let outcome = col
            .compute_min_max(ctx)
            .and_then(|()| col.load_index(ctx, spec));
        col.unload_index();
        part.file_manager().flush(&col.data_file(ctx.dir));
        match outcome {
            Ok(()) => debug!("worker {} built index for {}", who, col.name()),
            Err(e) => {
                warn!("worker {} failed on column {}: {}", who, col.name(), e);
                failures.fetch_add(1, Ordering::SeqCst);
                part.inc_errors();
            }
        }
    };

    let threads = nthreads.max(1);
    if threads > 1 {
        let mut pool = Pool::new(threads as u32);
        pool.scoped(|scope| {
            let worker = &worker;
            for who in 0..threads {
                scope.execute(move || worker(who));
            }
        });
    } else {
        worker(0);
    }

    let failed = failures.load(Ordering::SeqCst);
    if failed == 0 {
        // record fresh bounds and the spec in the header
        if let Err(e) = part.set_index_spec(spec) {
            warn!("cannot persist index spec: {}", e);
        }
    } else {
        warn!("{} columns failed to index", failed);
        let _ = part.write_header();
    }
    failed
}
