mod pool;
mod ui;

pub use pool::WorkerPool;
pub use ui::{ScheduledTask, UiExecutor};

use crate::error::EngineError;

/// Unit of work handed to an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that runs jobs.
pub trait Executor: Send + Sync {
    /// Submits a job. Fails with [`EngineError::ExecutorShutDown`] once the
    /// executor has been shut down.
    fn execute(&self, job: Job) -> Result<(), EngineError>;

    /// Refuses any further work.
    fn shutdown(&self);

    fn is_shutdown(&self) -> bool;
}
