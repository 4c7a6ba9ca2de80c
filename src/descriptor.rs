//! Task and exception handler descriptors.
//!
//! A [`TaskDescriptor`] is the immutable, type-erased description of a single
//! unit of startup work. Descriptors reference each other only by [`TaskId`],
//! the graph is never stored as a web of pointers. The body of a task is
//! produced on demand by a factory, so a descriptor can be shared freely
//! between threads and instantiated in whichever process ends up running it.

use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::fmt::{Debug, Display};
use std::sync::Arc;

use serde::Serialize;

use crate::context::AppContext;
use crate::error::TaskResult;
use crate::resolver::ExceptionHandler;
use crate::store::Results;
use crate::value::Value;

/// Stable identity of a task, unique within a registry.
///
/// By convention this is the fully-qualified path of the type implementing
/// the task, e.g. `my_app::startup::InitDatabase`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(Arc<str>);

impl TaskId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

impl Borrow<str> for TaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&*self.0, f)
    }
}

/// Where and how a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecutorKind {
    /// Runs on the exclusive UI executor.
    UiBlocking,
    /// Runs on the worker pool, the UI unlock does not wait for it.
    #[default]
    Async,
    /// Runs on the worker pool, the UI unlock waits for it.
    Await,
    /// Runs in a satellite process, the UI unlock does not wait for it.
    RemoteAsync,
    /// Runs in a satellite process, the UI unlock waits for it.
    RemoteAwait,
}

impl ExecutorKind {
    pub fn is_remote(self) -> bool {
        matches!(self, ExecutorKind::RemoteAsync | ExecutorKind::RemoteAwait)
    }

    /// Whether the UI thread may only be released after this task finished.
    pub fn requires_ui_unlock(self) -> bool {
        matches!(
            self,
            ExecutorKind::UiBlocking | ExecutorKind::Await | ExecutorKind::RemoteAwait
        )
    }

    /// The remote kind carried over the wire as a single `is_await` flag.
    pub(crate) fn remote(is_await: bool) -> Self {
        if is_await {
            ExecutorKind::RemoteAwait
        } else {
            ExecutorKind::RemoteAsync
        }
    }
}

/// The body of a task.
///
/// A body receives the host application handle and a read-only view of the
/// results produced so far, and may return a value for its dependents.
pub trait TaskBody: Send {
    fn run(&self, app: &AppContext, results: &Results) -> TaskResult<Option<Value>>;
}

impl<F> TaskBody for F
where
    F: Fn(&AppContext, &Results) -> TaskResult<Option<Value>> + Send,
{
    fn run(&self, app: &AppContext, results: &Results) -> TaskResult<Option<Value>> {
        (self)(app, results)
    }
}

type TaskFactory = Arc<dyn Fn() -> Box<dyn TaskBody> + Send + Sync>;

/// Immutable description of a startup task.
#[derive(Clone)]
pub struct TaskDescriptor {
    pub(crate) id: TaskId,
    pub(crate) name: String,
    pub(crate) kind: ExecutorKind,
    pub(crate) process: String,
    pub(crate) dependencies: BTreeSet<TaskId>,
    pub(crate) factory: TaskFactory,
}

impl TaskDescriptor {
    /// Starts describing a task with the given id. The display name defaults
    /// to the id.
    pub fn builder(id: impl Into<TaskId>) -> TaskBuilder {
        let id = id.into();
        TaskBuilder {
            name: id.to_string(),
            id,
            kind: ExecutorKind::default(),
            process: String::new(),
            dependencies: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ExecutorKind {
        self.kind
    }

    /// Satellite process of a remote task, empty for the current process.
    pub fn process(&self) -> &str {
        if self.kind.is_remote() {
            &self.process
        } else {
            ""
        }
    }

    pub fn dependencies(&self) -> &BTreeSet<TaskId> {
        &self.dependencies
    }

    /// Instantiates a fresh body for this task.
    pub fn instantiate(&self) -> Box<dyn TaskBody> {
        (self.factory)()
    }
}

impl Debug for TaskDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("process", &self.process())
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// Builder returned by [`TaskDescriptor::builder`].
pub struct TaskBuilder {
    id: TaskId,
    name: String,
    kind: ExecutorKind,
    process: String,
    dependencies: BTreeSet<TaskId>,
}

impl TaskBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn kind(mut self, kind: ExecutorKind) -> Self {
        self.kind = kind;
        self
    }

    /// Satellite process the task runs in. Only meaningful for remote kinds.
    pub fn process(mut self, process: impl Into<String>) -> Self {
        self.process = process.into();
        self
    }

    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    pub fn depends_on_all<I>(mut self, ids: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<TaskId>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Finishes the descriptor with a factory producing a fresh body per run.
    pub fn factory<F, B>(self, factory: F) -> TaskDescriptor
    where
        F: Fn() -> B + Send + Sync + 'static,
        B: TaskBody + 'static,
    {
        TaskDescriptor {
            id: self.id,
            name: self.name,
            kind: self.kind,
            process: self.process,
            dependencies: self.dependencies,
            factory: Arc::new(move || Box::new(factory())),
        }
    }

    /// Finishes the descriptor with a body returning an optional raw value.
    pub fn body<F>(self, body: F) -> TaskDescriptor
    where
        F: Fn(&AppContext, &Results) -> TaskResult<Option<Value>> + Send + Sync + 'static,
    {
        let body = Arc::new(body);
        self.factory(move || {
            let body = body.clone();
            move |app: &AppContext, results: &Results| body(app, results)
        })
    }

    /// Finishes the descriptor with a body that produces nothing.
    pub fn action<F>(self, action: F) -> TaskDescriptor
    where
        F: Fn(&AppContext, &Results) -> TaskResult<()> + Send + Sync + 'static,
    {
        self.body(move |app, results| {
            action(app, results)?;
            Ok(None)
        })
    }

    /// Finishes the descriptor with a body producing any serializable value.
    pub fn produce<T, F>(self, produce: F) -> TaskDescriptor
    where
        T: Serialize,
        F: Fn(&AppContext, &Results) -> TaskResult<T> + Send + Sync + 'static,
    {
        self.body(move |app, results| {
            let output = produce(app, results)?;
            Ok(Some(Value::encode(&output)?))
        })
    }

    /// Finishes the descriptor with an asynchronous body.
    ///
    /// Every run spawns a new single-threaded Tokio runtime on the executing
    /// thread and blocks on the returned future.
    #[cfg(feature = "tokio")]
    pub fn body_async<F, Fut>(self, body: F) -> TaskDescriptor
    where
        F: Fn(AppContext, Results) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = TaskResult<Option<Value>>> + Send + 'static,
    {
        self.body(move |app, results| {
            let executor = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;

            executor.block_on(body(app.clone(), results.clone()))
        })
    }
}

type HandlerFactory = Arc<dyn Fn() -> Box<dyn ExceptionHandler> + Send + Sync>;

/// Immutable description of an uncaught exception handler protecting a task.
#[derive(Clone)]
pub struct HandlerDescriptor {
    pub(crate) id: String,
    pub(crate) task_id: TaskId,
    pub(crate) priority: i32,
    pub(crate) factory: HandlerFactory,
}

impl HandlerDescriptor {
    /// Describes a handler for `task_id` with the highest possible priority.
    pub fn new<F, H>(id: impl Into<String>, task_id: impl Into<TaskId>, factory: F) -> Self
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: ExceptionHandler + 'static,
    {
        Self {
            id: id.into(),
            task_id: task_id.into(),
            priority: i32::MAX,
            factory: Arc::new(move || Box::new(factory())),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn instantiate(&self) -> Box<dyn ExceptionHandler> {
        (self.factory)()
    }
}

impl Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("id", &self.id)
            .field("task_id", &self.task_id)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let task = TaskDescriptor::builder("app::Init").action(|_, _| Ok(()));

        assert_eq!(task.id().as_str(), "app::Init");
        assert_eq!(task.name(), "app::Init");
        assert_eq!(task.kind(), ExecutorKind::Async);
        assert!(task.dependencies().is_empty());
    }

    #[test]
    fn test_process_ignored_for_local_kinds() {
        let local = TaskDescriptor::builder("a")
            .process(":remote")
            .action(|_, _| Ok(()));
        let remote = TaskDescriptor::builder("b")
            .kind(ExecutorKind::RemoteAsync)
            .process(":remote")
            .action(|_, _| Ok(()));

        assert_eq!(local.process(), "");
        assert_eq!(remote.process(), ":remote");
    }

    #[test]
    fn test_kind_classes() {
        assert!(ExecutorKind::UiBlocking.requires_ui_unlock());
        assert!(ExecutorKind::Await.requires_ui_unlock());
        assert!(ExecutorKind::RemoteAwait.requires_ui_unlock());
        assert!(!ExecutorKind::Async.requires_ui_unlock());
        assert!(!ExecutorKind::RemoteAsync.requires_ui_unlock());
        assert_eq!(ExecutorKind::remote(true), ExecutorKind::RemoteAwait);
    }

    #[test]
    fn test_produce_encodes_output() {
        let task = TaskDescriptor::builder("a").produce(|_, _| Ok(vec![1u8, 2, 3]));
        let value = task
            .instantiate()
            .run(&AppContext::new("test.app"), &Results::default())
            .unwrap()
            .unwrap();

        assert_eq!(value.decode::<Vec<u8>>().unwrap(), vec![1, 2, 3]);
    }
}
