use rayon::{prelude::*, ThreadPoolBuildError, ThreadPoolBuilder};

/// Collects work items and runs them with a bounded degree of
/// parallelism. Items queued beyond the limit wait for a thread to
/// free up; completion order is unspecified.
#[derive(Debug)]
pub struct Batch<T> {
    items: Vec<T>,
}

impl<T> Default for Batch<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: Send> Batch<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, item: T) {
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Runs `f` over every queued item on a dedicated pool of exactly
    /// `max_concurrency` threads and waits for all of them. Failures
    /// are the closure's business, items are consumed either way.
    pub fn run<F>(self, max_concurrency: usize, f: F) -> Result<(), ThreadPoolBuildError>
    where
        F: Fn(T) + Send + Sync,
    {
        let pool = ThreadPoolBuilder::new()
            .num_threads(max_concurrency.max(1))
            .build()?;
        pool.install(|| self.items.into_par_iter().for_each(f));
        Ok(())
    }
}
