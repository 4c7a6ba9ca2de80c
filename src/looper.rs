//! A message queue bound to a single thread.
//!
//! [`Looper`] models the queue of a host UI thread. Callbacks posted to it run
//! one at a time, in order, on the thread that called [`Looper::run`]. Hosts
//! without a native UI thread (command line tools, tests) can get one from
//! [`Looper::spawn`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

/// Identifies callbacks so they can be removed before they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

struct Message {
    token: Option<Token>,
    callback: Box<dyn FnOnce() + Send>,
}

#[derive(Default)]
struct State {
    messages: VecDeque<Message>,
    quit: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    ready: Condvar,
    tokens: AtomicU64,
}

/// Handle to a thread-bound message queue. Clones refer to the same queue.
#[derive(Clone, Default)]
pub struct Looper {
    shared: Arc<Shared>,
}

impl Looper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a dedicated thread running a fresh looper.
    pub fn spawn(name: impl Into<String>) -> std::io::Result<(Self, JoinHandle<()>)> {
        let looper = Self::new();
        let handle = std::thread::Builder::new().name(name.into()).spawn({
            let looper = looper.clone();
            move || looper.run()
        })?;

        Ok((looper, handle))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, message: Message, front: bool) {
        let mut state = self.lock();
        if state.quit {
            tracing::debug!("Dropping message posted to a looper that has quit");
            return;
        }
        if front {
            state.messages.push_front(message);
        } else {
            state.messages.push_back(message);
        }
        self.shared.ready.notify_one();
    }

    pub fn new_token(&self) -> Token {
        Token(self.shared.tokens.fetch_add(1, Ordering::Relaxed))
    }

    /// Appends a callback to the end of the queue.
    pub fn post(&self, callback: impl FnOnce() + Send + 'static) {
        let message = Message {
            token: None,
            callback: Box::new(callback),
        };
        self.push(message, false);
    }

    /// Inserts a callback before everything already queued.
    pub fn post_at_front(&self, callback: impl FnOnce() + Send + 'static) {
        let message = Message {
            token: None,
            callback: Box::new(callback),
        };
        self.push(message, true);
    }

    /// Inserts a tagged callback before everything already queued.
    pub fn post_token_at_front(&self, token: Token, callback: impl FnOnce() + Send + 'static) {
        let message = Message {
            token: Some(token),
            callback: Box::new(callback),
        };
        self.push(message, true);
    }

    /// Removes every pending callback tagged with `token`.
    pub fn remove_callbacks(&self, token: Token) {
        self.lock()
            .messages
            .retain(|message| message.token != Some(token));
    }

    /// Number of callbacks waiting in the queue.
    pub fn pending(&self) -> usize {
        self.lock().messages.len()
    }

    /// Stops the loop once the callback currently running returns. Pending
    /// callbacks are discarded.
    pub fn quit(&self) {
        let mut state = self.lock();
        state.quit = true;
        state.messages.clear();
        self.shared.ready.notify_all();
    }

    /// Runs callbacks on the current thread until [`Looper::quit`] is called.
    pub fn run(&self) {
        loop {
            let message = {
                let mut state = self.lock();
                loop {
                    if state.quit {
                        return;
                    }
                    if let Some(message) = state.messages.pop_front() {
                        break message;
                    }
                    state = self
                        .shared
                        .ready
                        .wait(state)
                        .unwrap_or_else(|e| e.into_inner());
                }
            };

            (message.callback)();
        }
    }
}

impl std::fmt::Debug for Looper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Looper")
            .field("pending", &self.pending())
            .finish()
    }
}
