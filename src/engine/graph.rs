use std::collections::{BTreeSet, HashMap};

use petgraph::graph::Graph;

use crate::descriptor::{TaskDescriptor, TaskId};
use crate::error::EngineError;
use crate::registry::Registry;

pub(crate) const UI_UNLOCK: &str = "hajime::UiUnlock";
pub(crate) const ALL_FINISHED: &str = "hajime::AllFinished";

/// Node of the execution graph.
#[derive(Debug, Clone)]
pub(crate) enum Node {
    Task(TaskDescriptor),
    /// Releases the UI thread once every task requiring it has finished.
    UiUnlock,
    /// Runs after everything else.
    AllFinished,
}

impl Node {
    pub fn id(&self) -> TaskId {
        match self {
            Node::Task(task) => task.id().clone(),
            Node::UiUnlock => TaskId::from(UI_UNLOCK),
            Node::AllFinished => TaskId::from(ALL_FINISHED),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Node::Task(task) => task.name(),
            Node::UiUnlock => UI_UNLOCK,
            Node::AllFinished => ALL_FINISHED,
        }
    }
}

/// Execution graph, edges point from a dependency to its dependent.
pub(crate) struct TaskGraph {
    pub graph: Graph<Node, ()>,
}

impl TaskGraph {
    /// Builds the graph for a registry, adding both terminators. Fails if the
    /// dependencies contain a cycle.
    pub fn build(registry: &Registry) -> Result<Self, EngineError> {
        if let Some(path) = find_cycle(registry) {
            return Err(EngineError::CyclicDependency { path });
        }

        let mut graph = Graph::new();
        let mut indices = HashMap::new();

        for task in registry.tasks() {
            let index = graph.add_node(Node::Task(task.clone()));
            indices.insert(task.id().clone(), index);
        }

        for task in registry.tasks() {
            let target = indices[task.id()];
            for dependency in task.dependencies() {
                graph.add_edge(indices[dependency], target, ());
            }
        }

        let ui_unlock = graph.add_node(Node::UiUnlock);
        let all_finished = graph.add_node(Node::AllFinished);

        for task in registry.tasks() {
            let index = indices[task.id()];
            if task.kind().requires_ui_unlock() {
                graph.add_edge(index, ui_unlock, ());
            }
            graph.add_edge(index, all_finished, ());
        }
        graph.add_edge(ui_unlock, all_finished, ());

        Ok(Self { graph })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Edges as `(dependency, dependent)` id pairs, sorted.
    pub fn edges(&self) -> BTreeSet<(TaskId, TaskId)> {
        self.graph
            .raw_edges()
            .iter()
            .map(|edge| (self.graph[edge.source()].id(), self.graph[edge.target()].id()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Temporary,
    Permanent,
}

/// Depth-first search over the dependencies, visiting roots in id order.
/// Returns the first cycle found as a path starting and ending on the same
/// task.
fn find_cycle(registry: &Registry) -> Option<Vec<TaskId>> {
    let mut marks: HashMap<&TaskId, Mark> = HashMap::new();

    for root in registry.tasks() {
        if marks.contains_key(root.id()) {
            continue;
        }

        marks.insert(root.id(), Mark::Temporary);
        let mut stack = vec![(root, root.dependencies().iter())];

        while let Some(top) = stack.last_mut() {
            let task = top.0;
            let Some(dependency) = top.1.next() else {
                marks.insert(task.id(), Mark::Permanent);
                stack.pop();
                continue;
            };

            match marks.get(dependency) {
                Some(Mark::Permanent) => {}
                Some(Mark::Temporary) => {
                    let start = stack
                        .iter()
                        .position(|(task, _)| task.id() == dependency)
                        .unwrap_or(0);

                    let mut path: Vec<_> = stack[start..]
                        .iter()
                        .map(|(task, _)| task.id().clone())
                        .collect();
                    path.push(dependency.clone());
                    return Some(path);
                }
                None => {
                    let Some(next) = registry.get(dependency.as_str()) else {
                        continue;
                    };
                    marks.insert(next.id(), Mark::Temporary);
                    stack.push((next, next.dependencies().iter()));
                }
            }
        }
    }

    None
}
