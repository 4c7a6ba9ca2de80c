use std::collections::{BTreeSet, HashMap};
use std::fmt::Write;
use std::time::{Duration, Instant};

use crate::descriptor::TaskId;

/// Lifecycle of a task within a single startup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Never dispatched.
    Pending,
    Running,
    /// Finished, possibly with a value substituted by an exception handler.
    Done,
    /// Failed without recovery.
    Failed,
}

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub status: TaskStatus,
    pub start: Instant,
    pub duration: Duration,
    /// Name of the thread the task ran on.
    pub thread: String,
}

/// Startup diagnostics and performance metrics.
///
/// Returned by [`Startup::wait`](crate::Startup::wait), covers every task of
/// the run including the two synthetic terminators.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Execution metrics of every task that was dispatched.
    pub execution_times: HashMap<TaskId, TaskExecution>,
    /// Every task of the run, sorted.
    pub tasks: BTreeSet<TaskId>,
    /// Dependency edges as `(dependency, dependent)` pairs.
    pub edges: BTreeSet<(TaskId, TaskId)>,
}

impl Diagnostics {
    pub fn status(&self, id: &str) -> TaskStatus {
        self.execution_times
            .get(id)
            .map_or(TaskStatus::Pending, |exec| exec.status)
    }

    /// Renders the task graph as a Mermaid diagram, color-coded by execution duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Never ran
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let times = &self.execution_times;
        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;

        for t in times.values() {
            let secs = t.duration.as_secs_f64();
            min_time = min_time.min(secs);
            max_time = max_time.max(secs);
        }

        if min_time > max_time {
            // No tasks ran
            min_time = 0.0;
            max_time = 0.0;
        }

        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        let index: HashMap<&TaskId, usize> =
            self.tasks.iter().enumerate().map(|(i, id)| (id, i)).collect();

        for (i, id) in self.tasks.iter().enumerate() {
            let name = id.as_str().replace('"', "\\\"");

            let (label_extra, color_code) = match times.get(id) {
                Some(exec) if exec.status == TaskStatus::Failed => {
                    (format!("failed after {:.2?}", exec.duration), "#FF6961".to_string())
                }
                Some(exec) => {
                    let val = exec.duration.as_secs_f64();
                    let t = (val - min_time) / (max_time - min_time);

                    // 0.0 (Green) -> 0.5 (Yellow) -> 1.0 (Red)
                    let (r, g, b) = if t < 0.5 {
                        ((255.0 * t * 2.0) as u8, 255, 0)
                    } else {
                        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8, 0)
                    };

                    (
                        format!("{:.2?}", exec.duration),
                        format!("#{:02X}{:02X}{:02X}", r, g, b),
                    )
                }
                None => ("Never ran".to_string(), "#ADD8E6".to_string()), // Light Blue
            };

            let _ = writeln!(f, "    {i}[\"{name}\\n{label_extra}\"]");
            let _ = writeln!(f, "    style {i} fill:{color_code}");
        }

        for (source, target) in &self.edges {
            if let (Some(s), Some(t)) = (index.get(source), index.get(target)) {
                let _ = writeln!(f, "    {s} --> {t}");
            }
        }

        f
    }
}
