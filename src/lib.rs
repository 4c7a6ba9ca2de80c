#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod context;
mod descriptor;
mod engine;
mod error;
mod executor;
mod looper;
mod registry;
pub mod remote;
mod resolver;
mod store;
mod tracker;
mod value;

pub use crate::context::{AppContext, NoPlatform, Platform, SatelliteDecl};
pub use crate::descriptor::{
    ExecutorKind, HandlerDescriptor, TaskBody, TaskBuilder, TaskDescriptor, TaskId,
};
pub use crate::engine::{Diagnostics, Engine, EngineBuilder, Startup, TaskExecution, TaskStatus};
pub use crate::error::*;
pub use crate::executor::{Executor, Job, ScheduledTask, UiExecutor, WorkerPool};
pub use crate::looper::{Looper, Token};
pub use crate::registry::{Catalog, Module, Registry, SERVICE_FILE, ServiceFile};
#[cfg(unix)]
pub use crate::remote::RemoteServer;
pub use crate::remote::{RemoteException, StackFrame};
pub use crate::resolver::{ExceptionHandler, Rethrow};
pub use crate::store::Results;
#[cfg(feature = "progress")]
pub use crate::tracker::ProgressBarTracker;
pub use crate::tracker::{LogTracker, ProgressTracker};
pub use crate::value::Value;

/// Installs a global `tracing` subscriber filtered by `RUST_LOG`, defaulting
/// to `info`. Log lines are printed above any active progress bars.
#[cfg(feature = "logging")]
pub fn init_logging() -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init()
}
