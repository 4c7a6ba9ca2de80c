mod diagnostics;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use petgraph::graph::NodeIndex;
use tracing::Level;

use super::Latch;
use super::graph::{Node, TaskGraph};
use crate::context::AppContext;
use crate::descriptor::{ExecutorKind, TaskDescriptor};
use crate::error::{EngineError, TaskResult, catch_panic};
use crate::executor::{Executor, Job, UiExecutor, WorkerPool};
use crate::looper::Looper;
use crate::resolver::Resolver;
use crate::store::{ResultStore, Results};
use crate::tracker::ProgressTracker;
use crate::value::Value;

pub use diagnostics::{Diagnostics, TaskExecution, TaskStatus};

/// State shared by every job of a single startup run.
pub(crate) struct Runtime {
    pub app: AppContext,
    pub store: ResultStore,
    pub resolver: Resolver,
    pub tracker: Arc<dyn ProgressTracker>,
    pub ui: UiExecutor,
    pub pool: WorkerPool,
    #[cfg(unix)]
    pub client: crate::remote::RemoteClient,
    /// Looper spawned by the engine itself, stopped after the run.
    pub owned_looper: Option<Looper>,
    pub unlocked: Arc<Latch>,
    pub launched: Instant,
}

struct Completion {
    index: NodeIndex,
    outcome: Result<(), EngineError>,
    start: Instant,
    duration: Duration,
    thread: String,
}

impl Runtime {
    /// Runs one node of the graph on the current thread.
    fn run_node(&self, node: &Node) -> Result<(), EngineError> {
        match node {
            Node::Task(task) => self.run_task(task),
            Node::UiUnlock => {
                self.ui.shutdown();
                self.unlocked.open();
                self.tracker.on_ui_unlocked(self.launched.elapsed());
                Ok(())
            }
            Node::AllFinished => {
                self.pool.shutdown();
                if let Some(looper) = &self.owned_looper {
                    looper.quit();
                }
                self.tracker.on_all_finished(self.launched.elapsed());
                Ok(())
            }
        }
    }

    fn run_task(&self, task: &TaskDescriptor) -> Result<(), EngineError> {
        let id = task.id();
        let results = self.store.snapshot();

        let span = tracing::span!(Level::INFO, "task", id = %id);
        let _enter = span.enter();

        self.tracker.on_task_started(id, task.name());
        let start = Instant::now();

        let output = catch_panic(|| self.invoke(task, &results));
        let elapsed = start.elapsed();

        let output = match output {
            Ok(value) => Ok(value),
            Err(error) => {
                tracing::warn!("Task failed: {error:#}");
                catch_panic(|| self.resolver.resolve(id, error))
            }
        };

        let outcome = match output {
            Ok(Some(value)) => self.store.put(id.clone(), value).map_err(|e| {
                tracing::error!("{e}");
                EngineError::from(e)
            }),
            Ok(None) => Ok(()),
            Err(error) => {
                tracing::error!("Task failed without recovery: {error:#}");
                Err(EngineError::TaskFailed {
                    id: id.clone(),
                    error,
                })
            }
        };

        self.tracker.on_task_finished(id, task.name(), elapsed);
        outcome
    }

    fn invoke(&self, task: &TaskDescriptor, results: &Results) -> TaskResult<Option<Value>> {
        if task.kind().is_remote() {
            #[cfg(unix)]
            return Ok(self.client.invoke(task, results)?);

            #[cfg(not(unix))]
            return Err(crate::error::RemoteError::UnreachableRemote {
                process: task.process().to_string(),
                reason: "remote tasks need Unix domain sockets".into(),
            }
            .into());
        }

        task.instantiate().run(&self.app, results)
    }
}

/// Executes the task graph. Tasks are dispatched as soon as all their
/// dependencies have completed.
///
/// The algorithm works as follows:
/// 1. The number of outstanding dependencies is counted for every node.
/// 2. Nodes without dependencies are dispatched, UI-blocking tasks to the UI
///    executor, everything else to the worker pool.
/// 3. Each job reports back over a channel after its result was stored.
/// 4. The coordinator decrements the counts of the dependents of every
///    completed node and dispatches those reaching zero.
/// 5. The loop continues until all nodes, terminators included, completed.
///
/// Failing tasks don't stop the run, their errors are collected and the
/// first one is returned once everything finished.
pub(crate) fn run(runtime: Arc<Runtime>, graph: TaskGraph) -> Result<Diagnostics, EngineError> {
    let mut diagnostics = Diagnostics {
        tasks: graph.graph.node_indices().map(|i| graph.graph[i].id()).collect(),
        edges: graph.edges(),
        ..Diagnostics::default()
    };

    let graph = Arc::new(graph.graph);

    let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
    for edge in graph.raw_edges() {
        dependents
            .entry(edge.source())
            .or_default()
            .push(edge.target());
    }

    let mut dependency_counts: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|i| {
            (
                i,
                graph
                    .neighbors_directed(i, petgraph::Direction::Incoming)
                    .count(),
            )
        })
        .collect();

    let total_tasks = graph.node_count();
    let mut completed_tasks = 0;

    let mut errors = Vec::new();

    let (sender, receiver) = channel::<Completion>();

    let dispatch = |index: NodeIndex, diagnostics: &mut Diagnostics| {
        let node = &graph[index];
        tracing::debug!(task = %node.id(), name = node.name(), "Dispatching");

        diagnostics.execution_times.insert(
            node.id(),
            TaskExecution {
                status: TaskStatus::Running,
                start: Instant::now(),
                duration: Duration::ZERO,
                thread: String::new(),
            },
        );

        let job: Job = {
            let runtime = runtime.clone();
            let graph = graph.clone();
            let sender = sender.clone();

            Box::new(move || {
                let node = &graph[index];
                let start = Instant::now();

                let outcome = catch_panic(|| Ok(runtime.run_node(node))).unwrap_or_else(|error| {
                    Err(EngineError::TaskFailed {
                        id: node.id(),
                        error,
                    })
                });

                let thread = std::thread::current().name().unwrap_or_default().to_string();
                let _ = sender.send(Completion {
                    index,
                    outcome,
                    start,
                    duration: start.elapsed(),
                    thread,
                });
            })
        };

        let accepted = match node {
            Node::Task(task) if task.kind() == ExecutorKind::UiBlocking => {
                runtime.ui.execute(job)
            }
            _ => runtime.pool.execute(job),
        };

        // A refused job completes at once, its dependents still have to run.
        if let Err(e) = accepted {
            let _ = sender.send(Completion {
                index,
                outcome: Err(e),
                start: Instant::now(),
                duration: Duration::ZERO,
                thread: String::new(),
            });
        }
    };

    for index in graph.node_indices() {
        if dependency_counts.get(&index).copied().unwrap_or(0) == 0 {
            dispatch(index, &mut diagnostics);
        }
    }

    while completed_tasks < total_tasks {
        let Ok(completion) = receiver.recv() else {
            return Err(EngineError::SchedulerPanicked);
        };

        let failed = completion.outcome.is_err();
        if let Err(e) = completion.outcome {
            errors.push(e);
        }

        diagnostics.execution_times.insert(
            graph[completion.index].id(),
            TaskExecution {
                status: if failed {
                    TaskStatus::Failed
                } else {
                    TaskStatus::Done
                },
                start: completion.start,
                duration: completion.duration,
                thread: completion.thread,
            },
        );
        completed_tasks += 1;

        if let Some(dependents_of_completed) = dependents.get(&completion.index) {
            for &index in dependents_of_completed {
                if let Some(count) = dependency_counts.get_mut(&index) {
                    *count -= 1;
                    if *count == 0 {
                        dispatch(index, &mut diagnostics);
                    }
                }
            }
        }
    }

    tracing::info!("Startup complete!");

    match errors.into_iter().next() {
        Some(error) => Err(error),
        None => Ok(diagnostics),
    }
}
