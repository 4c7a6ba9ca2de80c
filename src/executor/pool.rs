use std::sync::atomic::{AtomicBool, Ordering};

use rayon::{ThreadPool, ThreadPoolBuilder};

use super::{Executor, Job};
use crate::context::AppContext;
use crate::error::EngineError;

const MIN_THREADS: usize = 4;
const MAX_THREADS: usize = 0x7fff;

/// Fixed-size pool of worker threads.
pub struct WorkerPool {
    pool: ThreadPool,
    shutdown: AtomicBool,
}

impl WorkerPool {
    /// Builds a pool with one thread per available core, but no fewer than
    /// four. Threads are named `<prefix>-worker-<n>` and announced to the
    /// host platform as they start.
    pub fn new(app: &AppContext, prefix: &str) -> Result<Self, EngineError> {
        let threads = std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(1)
            .clamp(MIN_THREADS, MAX_THREADS);

        let prefix = prefix.to_string();
        let app = app.clone();

        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("{prefix}-worker-{i}"))
            .start_handler(move |_| app.platform().on_worker_start())
            .build()?;

        tracing::debug!(threads, "Started worker pool");

        Ok(Self {
            pool,
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl Executor for WorkerPool {
    fn execute(&self, job: Job) -> Result<(), EngineError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(EngineError::ExecutorShutDown);
        }

        self.pool.spawn(job);
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.threads())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc::channel;

    use crate::context::Platform;

    #[derive(Default)]
    struct Counting(Arc<AtomicUsize>);

    impl Platform for Counting {
        fn on_worker_start(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_pool_size_and_names() {
        let started = Arc::new(AtomicUsize::new(0));
        let app = AppContext::new("test").with_platform(Counting(started.clone()));
        let pool = WorkerPool::new(&app, "hajime").unwrap();
        assert!(pool.threads() >= MIN_THREADS);

        let (tx, rx) = channel();
        pool.execute(Box::new(move || {
            let name = std::thread::current().name().map(str::to_string);
            tx.send(name).unwrap();
        }))
        .unwrap();

        let name = rx.recv().unwrap().unwrap();
        assert!(name.starts_with("hajime-worker-"));
        assert!(started.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_refuses_work_after_shutdown() {
        let pool = WorkerPool::new(&AppContext::new("test"), "hajime").unwrap();
        pool.shutdown();

        assert!(pool.is_shutdown());
        assert!(matches!(
            pool.execute(Box::new(|| {})),
            Err(EngineError::ExecutorShutDown)
        ));
    }
}
