use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};

/// Worker pool shared by every stage of a learning run.
///
/// Built once before the first iteration; the threads are joined when the
/// value is dropped, whichever way the run ends.
pub struct Workers {
    pool: ThreadPool,
}

impl Workers {
    /// Pool with `n_jobs` threads; `0` lets rayon pick one per core.
    pub fn new(n_jobs: usize) -> Result<Self, ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(n_jobs)
            .thread_name(|i| format!("csc-worker-{i}"))
            .build()?;
        Ok(Self { pool })
    }

    pub fn n_jobs(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `op` inside the pool so rayon parallel iterators fan out over it.
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}

impl std::fmt::Debug for Workers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workers").field("n_jobs", &self.n_jobs()).finish()
    }
}
