use std::time::Duration;

use crate::descriptor::TaskId;

/// Observer of a startup run.
///
/// Callbacks are invoked from whichever thread ran the task, implementations
/// have to synchronize themselves. Synthetic terminator tasks only ever emit
/// the aggregate callbacks.
pub trait ProgressTracker: Send + Sync {
    fn on_task_started(&self, id: &TaskId, name: &str);

    fn on_task_finished(&self, id: &TaskId, name: &str, elapsed: Duration);

    /// Every UI-blocking and awaited task has finished.
    fn on_ui_unlocked(&self, total: Duration);

    /// Every task has finished.
    fn on_all_finished(&self, total: Duration);
}

fn thread_name() -> String {
    std::thread::current()
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{:?}", std::thread::current().id()))
}

/// Reports progress through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTracker;

impl ProgressTracker for LogTracker {
    fn on_task_started(&self, id: &TaskId, name: &str) {
        tracing::debug!(task = %id, thread = thread_name(), "Started {name}");
    }

    fn on_task_finished(&self, id: &TaskId, name: &str, elapsed: Duration) {
        tracing::info!(task = %id, thread = thread_name(), "Finished {name} in {elapsed:.2?}");
    }

    fn on_ui_unlocked(&self, total: Duration) {
        tracing::info!("UI unlocked after {total:.2?}");
    }

    fn on_all_finished(&self, total: Duration) {
        tracing::info!("All startup tasks finished after {total:.2?}");
    }
}

#[cfg(feature = "progress")]
pub use self::bar::ProgressBarTracker;

#[cfg(feature = "progress")]
mod bar {
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use std::time::Duration;

    use console::Style;
    use indicatif::{ProgressBar, ProgressStyle};

    use super::ProgressTracker;
    use crate::descriptor::TaskId;

    fn format_active(active: &BTreeSet<String>) -> String {
        const MAX: usize = 5;
        let names: Vec<_> = active.iter().map(String::as_str).collect();

        if names.len() <= MAX {
            names.join(", ")
        } else {
            format!("{}… ({} total)", names[..MAX].join(", "), names.len())
        }
    }

    /// Renders a terminal progress bar listing the tasks currently running.
    pub struct ProgressBarTracker {
        bar: ProgressBar,
        active: Mutex<BTreeSet<String>>,
    }

    impl ProgressBarTracker {
        /// Creates a bar for `total` tasks.
        pub fn new(total: usize) -> Self {
            let bar = ProgressBar::new(total as u64);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            {
                bar.set_style(style.progress_chars("#>-"));
            }

            Self {
                bar,
                active: Mutex::new(BTreeSet::new()),
            }
        }

        fn update(&self, edit: impl FnOnce(&mut BTreeSet<String>)) {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            edit(&mut active);
            self.bar.set_message(format_active(&active));
        }
    }

    impl ProgressTracker for ProgressBarTracker {
        fn on_task_started(&self, _: &TaskId, name: &str) {
            self.update(|active| {
                active.insert(name.to_string());
            });
        }

        fn on_task_finished(&self, _: &TaskId, name: &str, _: Duration) {
            self.update(|active| {
                active.remove(name);
            });
            self.bar.inc(1);
        }

        fn on_ui_unlocked(&self, total: Duration) {
            let blue = Style::new().blue();
            self.bar
                .println(format!("UI unlocked {}", blue.apply_to(format!("(+{}ms)", total.as_millis()))));
        }

        fn on_all_finished(&self, total: Duration) {
            let blue = Style::new().blue();
            self.bar.finish_with_message(format!(
                "Finished startup {}",
                blue.apply_to(format!("(+{}ms)", total.as_millis()))
            ));
        }
    }

}
