use std::fmt::Write;

use thiserror::Error;

use crate::descriptor::TaskId;

/// Result from a single executed task body or exception handler.
pub type TaskResult<T> = anyhow::Result<T, anyhow::Error>;

fn format_path(path: &[TaskId]) -> String {
    let mut acc = String::new();

    for (i, id) in path.iter().enumerate() {
        if i > 0 {
            acc.push_str(" -> ");
        }
        let _ = write!(acc, "{id}");
    }

    acc
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Cyclic dependency detected: {}", format_path(path))]
    CyclicDependency { path: Vec<TaskId> },

    #[error("Malformed registry:\n{0}")]
    RegistryMalformed(#[from] RegistryError),

    #[error("Executor has already been shut down")]
    ExecutorShutDown,

    #[error("Unsupported delay of {} minutes", .0.as_secs() / 60)]
    DelayTooLong(std::time::Duration),

    #[error("Startup has already been started in this process")]
    AlreadyStarted,

    #[error("Task '{id}':\n{error}")]
    TaskFailed { id: TaskId, error: anyhow::Error },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to build the worker pool")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Failed to spawn a thread:\n{0}")]
    Spawn(#[from] std::io::Error),

    #[error("Scheduler thread panicked")]
    SchedulerPanicked,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Task '{0}' is declared more than once")]
    DuplicateTask(TaskId),

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnresolvedDependency { task: TaskId, dependency: TaskId },

    #[error("Couldn't read service file.\n{0}")]
    ServiceFile(#[from] std::io::Error),

    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Result for task '{0}' has already been written")]
    AlreadyWritten(TaskId),
}

#[derive(Debug, Error)]
pub enum ValueError {
    #[error("Couldn't encode value.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Couldn't decode value.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame ended before the envelope was complete")]
    Truncated,

    #[error("Frame of {0} bytes exceeds the maximum frame length")]
    FrameTooLarge(usize),

    #[error("Unknown envelope tag {0:#04x}")]
    UnknownTag(u8),

    #[error("Envelope string is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Unknown remote task '{0}'")]
    UnknownTask(TaskId),

    #[error("Satellite process '{process}' died before replying")]
    PeerLost { process: String },

    #[error("Satellite process '{process}' is unreachable: {reason}")]
    UnreachableRemote { process: String, reason: String },

    #[error(transparent)]
    Exception(#[from] crate::remote::RemoteException),

    #[error("Malformed envelope:\n{0}")]
    Codec(#[from] CodecError),

    #[error("Couldn't bind endpoint '{path}':\n{source}")]
    Bind {
        path: camino::Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Process '{0}' doesn't declare an endpoint")]
    NoEndpoint(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Runs a task callback, turning a panic into an ordinary failure.
pub(crate) fn catch_panic<T>(f: impl FnOnce() -> TaskResult<T>) -> TaskResult<T> {
    // Task callbacks only see cloned or immutable data, a panic can't leave
    // shared state half-updated.
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Task panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Task panicked: {s}")
            } else {
                String::from("Task panicked with unknown payload")
            };

            Err(anyhow::anyhow!(msg))
        }
    }
}
