use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use super::{Executor, Job};
use crate::error::EngineError;
use crate::looper::{Looper, Token};

/// Longest delay accepted by [`UiExecutor::schedule`].
const MAX_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Longest time a single drain pass blocks the looper while idle.
const IDLE_WAIT: Duration = Duration::from_millis(10);

static SEQUENCER: AtomicU64 = AtomicU64::new(0);

type Key = (Instant, u64);

struct Inner {
    looper: Looper,
    token: Token,
    queue: Mutex<BTreeMap<Key, Job>>,
    ready: Condvar,
    shutdown: AtomicBool,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<Key, Job>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn post_drain(self: &Arc<Self>) {
        let inner = self.clone();
        self.looper
            .post_token_at_front(self.token, move || inner.drain());
    }

    /// One pass of the drain loop. Reposts itself at the front of the looper
    /// before running at most one ready job, so nothing else posted to the
    /// looper runs until the executor is shut down.
    fn drain(self: Arc<Self>) {
        if self.shutdown.load(Ordering::Acquire) {
            self.looper.remove_callbacks(self.token);
            return;
        }

        self.post_drain();

        let job = {
            let mut queue = self.lock();
            let now = Instant::now();
            let next = queue.first_key_value().map(|(&(time, _), _)| time);

            match next {
                Some(time) if time <= now => queue.pop_first().map(|(_, job)| job),
                next => {
                    let wait = next
                        .map(|time| time - now)
                        .unwrap_or(IDLE_WAIT)
                        .min(IDLE_WAIT);
                    let _ = self.ready.wait_timeout(queue, wait);
                    None
                }
            }
        };

        if let Some(job) = job {
            job();
        }
    }

    fn enqueue(&self, time: Instant, job: Job) -> Result<Key, EngineError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(EngineError::ExecutorShutDown);
        }

        let key = (time, SEQUENCER.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(key, job);
        self.ready.notify_one();

        Ok(key)
    }
}

/// Runs jobs exclusively on the looper thread.
///
/// From construction until shutdown, the executor occupies the looper: its
/// drain callback keeps reposting itself at the front of the queue. Jobs are
/// ordered by fire time, then by submission order.
#[derive(Clone)]
pub struct UiExecutor {
    inner: Arc<Inner>,
}

impl UiExecutor {
    pub fn new(looper: Looper) -> Self {
        let inner = Arc::new(Inner {
            token: looper.new_token(),
            looper,
            queue: Mutex::new(BTreeMap::new()),
            ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        inner.post_drain();

        Self { inner }
    }

    /// Runs `job` on the looper thread after `delay`.
    pub fn schedule(
        &self,
        job: impl FnOnce() + Send + 'static,
        delay: Duration,
    ) -> Result<ScheduledTask, EngineError> {
        if delay > MAX_DELAY {
            return Err(EngineError::DelayTooLong(delay));
        }

        let key = self.inner.enqueue(Instant::now() + delay, Box::new(job))?;

        Ok(ScheduledTask {
            key,
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Number of jobs waiting to run.
    pub fn pending(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Executor for UiExecutor {
    fn execute(&self, job: Job) -> Result<(), EngineError> {
        self.inner.enqueue(Instant::now(), job).map(|_| ())
    }

    fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.lock().clear();
        self.inner.looper.remove_callbacks(self.inner.token);
        self.inner.ready.notify_all();
    }

    fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }
}

/// Handle to a job submitted with [`UiExecutor::schedule`].
#[derive(Debug)]
pub struct ScheduledTask {
    key: Key,
    inner: Weak<Inner>,
}

impl ScheduledTask {
    /// Removes the job if it hasn't started yet. Returns whether it was
    /// removed.
    pub fn cancel(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.lock().remove(&self.key).is_some())
    }
}
