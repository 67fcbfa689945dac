//! Parallel Execution Layer
//!
//! A fixed-size worker pool dispatching per-user tasks. Worker count 0 runs
//! everything synchronously on the calling thread, which keeps debugging
//! simple. Tasks are chunked to amortize dispatch overhead.
//!
//! Determinism contract: `map` preserves input order in its output, and the
//! caller reduces results sequentially in that order. Totals are therefore
//! bit-for-bit identical regardless of worker count, chunk size, or the order
//! in which workers happen to finish. Task closures must be pure: they see
//! only shared read-only snapshots and return owned results.

use rayon::prelude::*;
use rayon::ThreadPool;

use crate::error::TrainError;

pub struct WorkerPool {
    pool: Option<ThreadPool>,
    chunk_size: usize,
}

impl WorkerPool {
    /// Builds a pool with `workers` threads; `workers == 0` selects
    /// synchronous execution.
    pub fn new(workers: usize, chunk_size: usize) -> Result<Self, TrainError> {
        let pool = if workers == 0 {
            None
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .build()
                .map_err(|e| TrainError::Pool(e.to_string()))?;
            Some(pool)
        };
        Ok(Self {
            pool,
            chunk_size: chunk_size.max(1),
        })
    }

    pub fn workers(&self) -> usize {
        self.pool.as_ref().map_or(0, ThreadPool::current_num_threads)
    }

    /// Applies `f` to every item, returning results in input order.
    ///
    /// `f` receives the item's index alongside the item so results can be
    /// keyed back to users without relying on completion order.
    pub fn map<T, R, F>(&self, items: &[T], f: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(usize, &T) -> R + Sync,
    {
        match &self.pool {
            None => items.iter().enumerate().map(|(i, t)| f(i, t)).collect(),
            Some(pool) => pool.install(|| {
                items
                    .par_iter()
                    .enumerate()
                    .with_min_len(self.chunk_size)
                    .map(|(i, t)| f(i, t))
                    .collect()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synchronous_pool_maps_in_order() {
        let pool = WorkerPool::new(0, 10).unwrap();
        assert_eq!(pool.workers(), 0);
        let items = vec![1.0_f64, 2.0, 3.0];
        let out = pool.map(&items, |i, &x| (i, x * 2.0));
        assert_eq!(out, vec![(0, 2.0), (1, 4.0), (2, 6.0)]);
    }

    #[test]
    fn test_parallel_pool_preserves_order() {
        let pool = WorkerPool::new(4, 2).unwrap();
        let items: Vec<usize> = (0..1000).collect();
        let out = pool.map(&items, |i, &x| {
            assert_eq!(i, x);
            x + 1
        });
        assert_eq!(out, (1..=1000).collect::<Vec<_>>());
    }

    #[test]
    fn test_reduction_identical_across_worker_counts_and_chunks() {
        let items: Vec<f64> = (0..513).map(|i| (i as f64) * 0.37 - 31.0).collect();
        let reduce = |pool: &WorkerPool| -> f64 {
            // Sequential in-order fold over order-preserved results.
            pool.map(&items, |_, &x| x.sin() * x).iter().sum()
        };

        let baseline = reduce(&WorkerPool::new(0, 1).unwrap());
        for workers in [1, 2, 4] {
            for chunk in [1, 7, 100, 1000] {
                let pool = WorkerPool::new(workers, chunk).unwrap();
                let total = reduce(&pool);
                assert_eq!(total.to_bits(), baseline.to_bits());
            }
        }
    }
}
