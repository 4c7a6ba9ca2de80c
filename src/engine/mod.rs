mod graph;
mod runner;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::context::AppContext;
use crate::error::EngineError;
use crate::executor::{UiExecutor, WorkerPool};
use crate::looper::Looper;
use crate::registry::{Catalog, Registry, ServiceFile};
use crate::resolver::{DefaultHandler, ExceptionHandler, Resolver, Rethrow};
use crate::store::ResultStore;
use crate::tracker::{LogTracker, ProgressTracker};

use self::graph::TaskGraph;
use self::runner::Runtime;

pub use self::runner::{Diagnostics, TaskExecution, TaskStatus};

/// Startup may only ever be launched once per process.
static STARTED: AtomicBool = AtomicBool::new(false);

/// One-shot gate that stays open once opened.
#[derive(Default)]
pub(crate) struct Latch {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub fn open(&self) {
        let mut open = self.open.lock().unwrap_or_else(|e| e.into_inner());
        *open = true;
        self.cond.notify_all();
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn wait(&self) {
        let mut open = self.open.lock().unwrap_or_else(|e| e.into_inner());
        while !*open {
            open = self.cond.wait(open).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Configures an [`Engine`].
pub struct EngineBuilder {
    app: AppContext,
    looper: Option<Looper>,
    tracker: Arc<dyn ProgressTracker>,
    default_handler: DefaultHandler,
    catalog: Catalog,
    service_files: Vec<ServiceFile>,
    registry: Option<Registry>,
}

impl EngineBuilder {
    /// Looper of the host UI thread. Without one the engine spawns a
    /// dedicated thread standing in for it.
    pub fn looper(mut self, looper: Looper) -> Self {
        self.looper = Some(looper);
        self
    }

    pub fn tracker(mut self, tracker: impl ProgressTracker + 'static) -> Self {
        self.tracker = Arc::new(tracker);
        self
    }

    /// Handler for failing tasks no registered handler protects. The default
    /// one propagates the failure.
    pub fn default_handler(mut self, handler: impl ExceptionHandler + Sync + 'static) -> Self {
        self.default_handler = Arc::new(handler);
        self
    }

    /// Module providers resolving service file entries.
    pub fn catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn service_files(mut self, files: impl IntoIterator<Item = ServiceFile>) -> Self {
        self.service_files.extend(files);
        self
    }

    /// Uses an already materialized registry, skipping service files.
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Materializes the registry. Service files are discovered in the
    /// metadata directory of the application unless given explicitly.
    pub fn build(self) -> Result<Engine, EngineError> {
        let registry = match self.registry {
            Some(registry) => registry,
            None => {
                let mut files = self.service_files;
                if files.is_empty()
                    && let Some(dir) = self.app.metadata_dir()
                {
                    files = ServiceFile::discover(dir)?;
                }
                Registry::load(&self.catalog, &files)?
            }
        };

        tracing::debug!(tasks = registry.len(), "Materialized registry");

        Ok(Engine {
            app: self.app,
            looper: self.looper,
            tracker: self.tracker,
            default_handler: self.default_handler,
            registry,
        })
    }
}

/// Runs the startup tasks of an application.
pub struct Engine {
    app: AppContext,
    looper: Option<Looper>,
    tracker: Arc<dyn ProgressTracker>,
    default_handler: DefaultHandler,
    registry: Registry,
}

impl Engine {
    pub fn builder(app: AppContext) -> EngineBuilder {
        EngineBuilder {
            app,
            looper: None,
            tracker: Arc::new(LogTracker),
            default_handler: Arc::new(Rethrow),
            catalog: Catalog::new(),
            service_files: Vec::new(),
            registry: None,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Launches every task and returns immediately.
    ///
    /// Fails with [`EngineError::AlreadyStarted`] if startup has already been
    /// launched in this process, and with [`EngineError::CyclicDependency`]
    /// before any task runs if the dependencies contain a cycle.
    pub fn start(self) -> Result<Startup, EngineError> {
        if STARTED.swap(true, Ordering::AcqRel) {
            return Err(EngineError::AlreadyStarted);
        }

        self.launch()
    }

    fn launch(self) -> Result<Startup, EngineError> {
        let launched = Instant::now();
        let graph = TaskGraph::build(&self.registry)?;
        tracing::info!(tasks = graph.len(), "Launching startup");

        let pool = WorkerPool::new(&self.app, "hajime")?;
        let (looper, owned_looper) = match self.looper {
            Some(looper) => (looper, None),
            None => {
                let (looper, _) = Looper::spawn("hajime-ui")?;
                (looper.clone(), Some(looper))
            }
        };

        let unlocked = Arc::new(Latch::default());
        let runtime = Arc::new(Runtime {
            store: ResultStore::new(),
            resolver: Resolver::new(self.registry.handlers().clone(), self.default_handler),
            tracker: self.tracker,
            ui: UiExecutor::new(looper),
            pool,
            #[cfg(unix)]
            client: crate::remote::RemoteClient::new(self.app.clone()),
            app: self.app,
            owned_looper,
            unlocked: unlocked.clone(),
            launched,
        });

        let handle = std::thread::Builder::new()
            .name("hajime-scheduler".into())
            .spawn(move || runner::run(runtime, graph))?;

        Ok(Startup { handle, unlocked })
    }
}

/// Handle to a launched startup run.
pub struct Startup {
    handle: JoinHandle<Result<Diagnostics, EngineError>>,
    unlocked: Arc<Latch>,
}

impl Startup {
    /// Blocks until every task requiring the UI thread has finished. Calling
    /// it on the looper thread itself deadlocks.
    pub fn wait_ui_unlocked(&self) {
        self.unlocked.wait();
    }

    pub fn is_ui_unlocked(&self) -> bool {
        self.unlocked.is_open()
    }

    /// Blocks until every task has finished. Returns the first fatal task
    /// failure, if any.
    pub fn wait(self) -> Result<Diagnostics, EngineError> {
        self.handle
            .join()
            .map_err(|_| EngineError::SchedulerPanicked)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use anyhow::anyhow;

    use crate::descriptor::{ExecutorKind, HandlerDescriptor, TaskDescriptor, TaskId};
    use crate::error::TaskResult;
    use crate::value::Value;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Started(String),
        Finished(String),
        UiUnlocked,
        AllFinished,
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Event>>>);

    impl Recorder {
        fn push(&self, event: Event) {
            self.0.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<Event> {
            self.0.lock().unwrap().clone()
        }

        fn position(&self, event: &Event) -> usize {
            self.events()
                .iter()
                .position(|e| e == event)
                .unwrap_or_else(|| panic!("missing {event:?}"))
        }
    }

    impl ProgressTracker for Recorder {
        fn on_task_started(&self, id: &TaskId, _: &str) {
            self.push(Event::Started(id.to_string()));
        }

        fn on_task_finished(&self, id: &TaskId, _: &str, _: Duration) {
            self.push(Event::Finished(id.to_string()));
        }

        fn on_ui_unlocked(&self, _: Duration) {
            self.push(Event::UiUnlocked);
        }

        fn on_all_finished(&self, _: Duration) {
            self.push(Event::AllFinished);
        }
    }

    fn started(id: &str) -> Event {
        Event::Started(id.into())
    }

    fn finished(id: &str) -> Event {
        Event::Finished(id.into())
    }

    fn produce(id: &str, kind: ExecutorKind, deps: &[&str], value: &'static str) -> TaskDescriptor {
        TaskDescriptor::builder(id)
            .kind(kind)
            .depends_on_all(deps.iter().copied())
            .produce(move |_, _| Ok(value))
    }

    fn failing(id: &str) -> TaskDescriptor {
        TaskDescriptor::builder(id).body(|_, _| Err(anyhow!("boom")))
    }

    fn launch(
        tasks: Vec<TaskDescriptor>,
        handlers: Vec<HandlerDescriptor>,
        recorder: &Recorder,
    ) -> (Result<Startup, EngineError>, Looper) {
        let (looper, _) = Looper::spawn("test-ui").unwrap();
        let registry = Registry::new(tasks, handlers).unwrap();

        let engine = Engine::builder(AppContext::new("test.app"))
            .registry(registry)
            .looper(looper.clone())
            .tracker(recorder.clone())
            .build()
            .unwrap();

        (engine.launch(), looper)
    }

    #[test]
    fn test_diamond() {
        let recorder = Recorder::default();
        let threads = Arc::new(Mutex::new(Vec::new()));

        let d = TaskDescriptor::builder("D")
            .kind(ExecutorKind::Await)
            .depends_on("B")
            .depends_on("C")
            .action({
                let threads = threads.clone();
                move |_, results| {
                    let name = std::thread::current().name().map(str::to_string);
                    threads.lock().unwrap().push(name);

                    if results.get_as::<String>("B")?.as_deref() != Some("2")
                        || results.get_as::<String>("C")?.as_deref() != Some("3")
                    {
                        anyhow::bail!("dependencies missing from snapshot");
                    }
                    Ok(())
                }
            });

        let (startup, looper) = launch(
            vec![
                produce("A", ExecutorKind::Async, &[], "1"),
                produce("B", ExecutorKind::Async, &["A"], "2"),
                produce("C", ExecutorKind::Async, &["A"], "3"),
                d,
            ],
            vec![],
            &recorder,
        );

        let diagnostics = startup.unwrap().wait().unwrap();
        looper.quit();

        assert_eq!(recorder.events()[0], started("A"));
        for dependent in ["B", "C"] {
            assert!(recorder.position(&finished("A")) < recorder.position(&started(dependent)));
            assert!(recorder.position(&finished(dependent)) < recorder.position(&started("D")));
        }
        assert!(recorder.position(&finished("D")) < recorder.position(&Event::UiUnlocked));
        assert_eq!(recorder.events().last(), Some(&Event::AllFinished));
        assert_eq!(recorder.events().len(), 10);

        let thread = threads.lock().unwrap()[0].clone().unwrap();
        assert!(thread.starts_with("hajime-worker-"));
        assert_eq!(diagnostics.status("D"), TaskStatus::Done);
        assert_eq!(diagnostics.tasks.len(), 6);
    }

    #[test]
    fn test_cycle_starts_nothing() {
        let recorder = Recorder::default();
        let (startup, looper) = launch(
            vec![
                produce("X", ExecutorKind::Async, &["Y"], "x"),
                produce("Y", ExecutorKind::Async, &["X"], "y"),
            ],
            vec![],
            &recorder,
        );
        looper.quit();

        let Err(EngineError::CyclicDependency { path }) = startup else {
            panic!("expected a cycle");
        };
        assert!(path.contains(&TaskId::from("X")));
        assert!(path.contains(&TaskId::from("Y")));
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn test_ui_unlock_waits_for_ui_and_await() {
        let recorder = Recorder::default();
        let ui_thread = Arc::new(Mutex::new(None));

        let m = TaskDescriptor::builder("M")
            .kind(ExecutorKind::UiBlocking)
            .action({
                let ui_thread = ui_thread.clone();
                move |_, _| {
                    *ui_thread.lock().unwrap() = std::thread::current().name().map(str::to_string);
                    std::thread::sleep(Duration::from_millis(20));
                    Ok(())
                }
            });
        let n = TaskDescriptor::builder("N")
            .kind(ExecutorKind::Await)
            .action(|_, _| {
                std::thread::sleep(Duration::from_millis(40));
                Ok(())
            });

        let (startup, looper) = launch(vec![m, n], vec![], &recorder);
        let startup = startup.unwrap();

        startup.wait_ui_unlocked();
        assert!(startup.is_ui_unlocked());
        assert!(recorder.events().contains(&finished("M")));
        assert!(recorder.events().contains(&finished("N")));

        startup.wait().unwrap();
        looper.quit();

        let unlocked = recorder.position(&Event::UiUnlocked);
        assert!(recorder.position(&finished("M")) < unlocked);
        assert!(recorder.position(&finished("N")) < unlocked);
        assert_eq!(ui_thread.lock().unwrap().as_deref(), Some("test-ui"));
    }

    #[test]
    fn test_unlock_without_ui_tasks_is_immediate() {
        let recorder = Recorder::default();
        let slow = TaskDescriptor::builder("Slow").action(|_, _| {
            std::thread::sleep(Duration::from_millis(100));
            Ok(())
        });

        let (startup, looper) = launch(vec![slow], vec![], &recorder);
        startup.unwrap().wait().unwrap();
        looper.quit();

        assert!(recorder.position(&Event::UiUnlocked) < recorder.position(&finished("Slow")));
    }

    #[test]
    fn test_handler_substitutes_value() {
        let recorder = Recorder::default();
        let handler = HandlerDescriptor::new("H", "Q", || {
            |_: &TaskId, _: anyhow::Error| -> TaskResult<Option<Value>> {
                Ok(Some(Value::encode(&"safe")?))
            }
        })
        .with_priority(10);

        let reader = TaskDescriptor::builder("R")
            .depends_on("Q")
            .produce(|_, results| Ok(results.get_as::<String>("Q")?));

        let (startup, looper) = launch(vec![failing("Q"), reader], vec![handler], &recorder);
        let diagnostics = startup.unwrap().wait().unwrap();
        looper.quit();

        assert_eq!(diagnostics.status("Q"), TaskStatus::Done);
        assert!(recorder.events().contains(&finished("R")));
        assert_eq!(recorder.events().last(), Some(&Event::AllFinished));
    }

    #[test]
    fn test_default_rethrow() {
        let recorder = Recorder::default();
        let observed = Arc::new(Mutex::new(None));

        let dependent = TaskDescriptor::builder("T").depends_on("Q").action({
            let observed = observed.clone();
            move |_, results| {
                *observed.lock().unwrap() = Some(results.contains("Q"));
                Ok(())
            }
        });

        let (startup, looper) = launch(vec![failing("Q"), dependent], vec![], &recorder);
        let err = startup.unwrap().wait().unwrap_err();
        looper.quit();

        assert!(matches!(err, EngineError::TaskFailed { ref id, .. } if id.as_str() == "Q"));
        assert!(recorder.events().contains(&finished("Q")));
        assert!(recorder.events().contains(&Event::AllFinished));
        assert_eq!(*observed.lock().unwrap(), Some(false));
    }

    #[test]
    fn test_panic_is_failure() {
        let recorder = Recorder::default();
        let panicking = TaskDescriptor::builder("P").action(|_, _| panic!("kaboom"));

        let (startup, looper) = launch(vec![panicking], vec![], &recorder);
        let err = startup.unwrap().wait().unwrap_err();
        looper.quit();

        let EngineError::TaskFailed { error, .. } = err else {
            panic!("expected a task failure");
        };
        assert_eq!(error.to_string(), "Task panicked: kaboom");
        assert!(recorder.events().contains(&Event::AllFinished));
    }
}
