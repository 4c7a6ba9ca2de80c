use std::fs;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use camino::{Utf8Path, Utf8PathBuf};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::Level;

use super::envelope::{Body, Envelope, Reply, Request, read_frame, write_frame};
use super::RemoteException;
use crate::context::AppContext;
use crate::descriptor::{TaskDescriptor, TaskId};
use crate::error::{CodecError, RemoteError, catch_panic};
use crate::executor::{Executor, WorkerPool};
use crate::registry::Registry;
use crate::store::Results;

/// A single execution of a remote task, shared by every caller.
#[derive(Default)]
struct Flight {
    outcome: Mutex<Option<Reply>>,
    done: Condvar,
}

impl Flight {
    fn complete(&self, reply: Reply) {
        let mut outcome = self.outcome.lock().unwrap_or_else(|e| e.into_inner());
        *outcome = Some(reply);
        self.done.notify_all();
    }

    fn wait(&self) -> Reply {
        let mut outcome = self.outcome.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(reply) = outcome.as_ref() {
                return reply.clone();
            }
            outcome = self.done.wait(outcome).unwrap_or_else(|e| e.into_inner());
        }
    }
}

struct Shared {
    app: AppContext,
    registry: Registry,
    pool: WorkerPool,
    flights: DashMap<TaskId, Arc<Flight>>,
}

/// Serves remote tasks from a satellite process.
///
/// Each remote task runs at most once in the lifetime of the server, the
/// outcome (a value or a failure) is replayed to every later caller.
pub struct RemoteServer {
    shared: Arc<Shared>,
    listener: UnixListener,
    path: Utf8PathBuf,
}

impl RemoteServer {
    /// Listens on the endpoint declared for the current process.
    pub fn bind(app: AppContext, registry: Registry) -> Result<Self, RemoteError> {
        let path = app
            .own_endpoint()
            .ok_or_else(|| RemoteError::NoEndpoint(app.process().to_string()))?;

        Self::bind_at(app, registry, path)
    }

    /// Listens on an explicit socket path.
    pub fn bind_at(
        app: AppContext,
        registry: Registry,
        path: impl Into<Utf8PathBuf>,
    ) -> Result<Self, RemoteError> {
        let path = path.into();
        let bind_err = |source| RemoteError::Bind {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(bind_err)?;
        }
        remove_stale_socket(&path).map_err(bind_err)?;

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        // Only processes of the same user may connect.
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).map_err(bind_err)?;

        let pool = WorkerPool::new(&app, "hajime-remote")?;

        tracing::info!(path = path.as_str(), "Serving remote tasks");

        Ok(Self {
            shared: Arc::new(Shared {
                app,
                registry,
                pool,
                flights: DashMap::new(),
            }),
            listener,
            path,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Accepts connections until the listener fails. Every connection is
    /// served by its own thread.
    pub fn serve_forever(&self) -> Result<(), RemoteError> {
        for stream in self.listener.incoming() {
            let stream = stream.map_err(CodecError::from)?;
            let shared = self.shared.clone();

            std::thread::Builder::new()
                .name("hajime-remote-conn".into())
                .spawn(move || shared.serve(stream))
                .map_err(CodecError::from)?;
        }

        Ok(())
    }

    /// Runs [`RemoteServer::serve_forever`] on a background thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<Result<(), RemoteError>>> {
        std::thread::Builder::new()
            .name("hajime-remote".into())
            .spawn(move || self.serve_forever())
    }
}

fn remove_stale_socket(path: &Utf8Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => fs::remove_file(path),
        _ => Ok(()),
    }
}

impl Shared {
    fn serve(self: Arc<Self>, mut stream: UnixStream) {
        loop {
            let payload = match read_frame(&mut stream) {
                Ok(Some(payload)) => payload,
                Ok(None) => return,
                Err(e) => {
                    tracing::debug!("Dropping connection: {e}");
                    return;
                }
            };

            let envelope = match Envelope::decode(payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!("Dropping connection after malformed envelope: {e}");
                    return;
                }
            };

            let Body::Request(request) = envelope.body else {
                tracing::warn!(call_id = envelope.call_id, "Ignoring unexpected reply");
                continue;
            };

            let reply = self.dispatch(request);
            let payload = Envelope::reply(envelope.call_id, reply).encode();

            // The caller may have died in the meantime, the reply is dropped.
            if let Err(e) = write_frame(&mut stream, &payload) {
                tracing::debug!(call_id = envelope.call_id, "Couldn't deliver reply: {e}");
                return;
            }
        }
    }

    fn dispatch(self: &Arc<Self>, request: Request) -> Reply {
        let Some(task) = self
            .registry
            .get(request.id.as_str())
            .filter(|task| request.matches(task))
            .cloned()
        else {
            let message = RemoteError::UnknownTask(request.id).to_string();
            return Reply::Exception(RemoteException::new(message, Vec::new()));
        };

        let (flight, leader) = match self.flights.entry(task.id().clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let flight = Arc::new(Flight::default());
                entry.insert(flight.clone());
                (flight, true)
            }
        };

        if leader {
            let results = Results::from_bundle(request.results);
            let job = {
                let shared = self.clone();
                let flight = flight.clone();
                let task = task.clone();
                Box::new(move || flight.complete(shared.execute(&task, &results)))
            };

            if let Err(e) = self.pool.execute(job) {
                let error = anyhow::Error::from(e);
                flight.complete(Reply::Exception(RemoteException::capture(&error)));
            }
        }

        flight.wait()
    }

    fn execute(&self, task: &TaskDescriptor, results: &Results) -> Reply {
        let span = tracing::span!(Level::INFO, "remote_task", id = %task.id());
        let _enter = span.enter();

        match catch_panic(|| task.instantiate().run(&self.app, results)) {
            Ok(value) => Reply::Completed(value),
            Err(error) => {
                tracing::warn!("Remote task failed: {error:#}");
                Reply::Exception(RemoteException::capture(&error))
            }
        }
    }
}
