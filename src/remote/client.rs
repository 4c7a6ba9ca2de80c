use std::collections::HashMap;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use camino::Utf8PathBuf;

use super::envelope::{Body, Envelope, Reply, Request, read_frame, write_frame};
use crate::context::AppContext;
use crate::descriptor::TaskDescriptor;
use crate::error::{CodecError, RemoteError};
use crate::store::Results;
use crate::value::Value;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Link to the endpoint of one satellite process.
struct Connection {
    process: String,
    path: Utf8PathBuf,
    /// Only one request may be in flight on a stream.
    stream: Mutex<Option<UnixStream>>,
    users: AtomicUsize,
}

/// Keeps track of callers currently using a connection.
struct Usage<'a>(&'a Connection);

impl<'a> Usage<'a> {
    fn acquire(connection: &'a Connection) -> Self {
        if connection.users.fetch_add(1, Ordering::AcqRel) == 0 {
            tracing::debug!(process = connection.process.as_str(), "Connection in use");
        }
        Self(connection)
    }
}

impl Drop for Usage<'_> {
    fn drop(&mut self) {
        if self.0.users.fetch_sub(1, Ordering::AcqRel) == 1 {
            // The stream stays open for the next caller.
            tracing::debug!(process = self.0.process.as_str(), "Connection idle");
        }
    }
}

impl Connection {
    fn unreachable(&self, reason: impl ToString) -> RemoteError {
        RemoteError::UnreachableRemote {
            process: self.process.clone(),
            reason: reason.to_string(),
        }
    }

    fn peer_lost(&self) -> RemoteError {
        RemoteError::PeerLost {
            process: self.process.clone(),
        }
    }

    fn connect(&self) -> Result<UnixStream, RemoteError> {
        UnixStream::connect(&self.path).map_err(|e| self.unreachable(e))
    }

    fn call(&self, call_id: u64, request: Request) -> Result<Option<Value>, RemoteError> {
        let _usage = Usage::acquire(self);
        let mut slot = lock(&self.stream);
        let payload = Envelope::request(call_id, request).encode();

        let mut stream = match slot.take() {
            Some(mut warm) => match write_frame(&mut warm, &payload) {
                Ok(()) => warm,
                Err(CodecError::Io(e)) => {
                    tracing::debug!(process = self.process.as_str(), "Reconnecting stale stream: {e}");
                    let mut fresh = self.connect()?;
                    write_frame(&mut fresh, &payload).map_err(|e| self.unreachable(e))?;
                    fresh
                }
                Err(e) => return Err(e.into()),
            },
            None => {
                let mut fresh = self.connect()?;
                write_frame(&mut fresh, &payload).map_err(|e| self.unreachable(e))?;
                fresh
            }
        };

        loop {
            let frame = match read_frame(&mut stream) {
                Ok(Some(frame)) => frame,
                Ok(None) | Err(CodecError::Truncated) => return Err(self.peer_lost()),
                Err(CodecError::Io(e)) if is_disconnect(e.kind()) => {
                    return Err(self.peer_lost());
                }
                Err(e) => return Err(e.into()),
            };

            let envelope = Envelope::decode(frame)?;
            match envelope.body {
                Body::Reply(reply) if envelope.call_id == call_id => {
                    *slot = Some(stream);
                    return match reply {
                        Reply::Completed(value) => Ok(value),
                        Reply::Exception(exception) => Err(exception.into()),
                    };
                }
                _ => tracing::debug!(
                    call_id = envelope.call_id,
                    "Skipping envelope for another call"
                ),
            }
        }
    }
}

fn is_disconnect(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    )
}

/// Invokes remote tasks in satellite processes.
///
/// Connections are created on first use and kept open for later calls.
pub(crate) struct RemoteClient {
    app: AppContext,
    connections: Mutex<Option<HashMap<String, Arc<Connection>>>>,
    calls: AtomicU64,
}

impl RemoteClient {
    pub fn new(app: AppContext) -> Self {
        Self {
            app,
            connections: Mutex::new(None),
            calls: AtomicU64::new(1),
        }
    }

    fn connection(&self, process: &str) -> Option<Arc<Connection>> {
        let mut connections = lock(&self.connections);
        let connections = connections.get_or_insert_with(|| {
            self.app
                .satellites()
                .iter()
                .filter(|decl| !decl.multiprocess)
                .map(|decl| {
                    let connection = Connection {
                        process: decl.process.clone(),
                        path: self.app.endpoint_path(decl),
                        stream: Mutex::new(None),
                        users: AtomicUsize::new(0),
                    };
                    (decl.process.clone(), Arc::new(connection))
                })
                .collect()
        });

        connections.get(process).cloned()
    }

    /// Runs `task` in its satellite process, handing it `results`.
    pub fn invoke(
        &self,
        task: &TaskDescriptor,
        results: &Results,
    ) -> Result<Option<Value>, RemoteError> {
        let process = task.process();
        let connection =
            self.connection(process)
                .ok_or_else(|| RemoteError::UnreachableRemote {
                    process: process.to_string(),
                    reason: "no endpoint declared".into(),
                })?;

        let call_id = self.calls.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(task = %task.id(), process, call_id, "Invoking remote task");

        connection.call(call_id, Request::new(task, results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::os::unix::net::UnixListener;

    use camino::Utf8Path;

    use crate::descriptor::ExecutorKind;
    use crate::registry::Registry;
    use crate::remote::RemoteServer;

    fn remote(id: &str) -> TaskDescriptor {
        TaskDescriptor::builder(id)
            .kind(ExecutorKind::RemoteAwait)
            .process(":remote")
            .depends_on("app::Local")
            .produce(|_, results| {
                let local: String = results.get_as("app::Local")?.unwrap_or_default();
                Ok(format!("{local}+remote"))
            })
    }

    fn local() -> TaskDescriptor {
        TaskDescriptor::builder("app::Local").produce(|_, _| Ok("local".to_string()))
    }

    fn app(dir: &tempfile::TempDir) -> AppContext {
        let root = Utf8Path::from_path(dir.path()).unwrap();
        AppContext::new("test.app")
            .with_runtime_dir(root)
            .with_satellite(":remote", "remote", false)
            .with_satellite(":per-caller", "per_caller", true)
    }

    #[test]
    fn test_invoke_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir);

        let registry = Registry::new([local(), remote("app::Remote")], []).unwrap();
        let server = RemoteServer::bind(app.clone().with_process(":remote"), registry).unwrap();
        server.spawn().unwrap();

        let client = RemoteClient::new(app);
        let results = Results::from_bundle([(
            "app::Local".into(),
            Value::encode("local").unwrap(),
        )]);

        for _ in 0..2 {
            let value = client.invoke(&remote("app::Remote"), &results).unwrap();
            assert_eq!(value.unwrap().decode::<String>().unwrap(), "local+remote");
        }
    }

    #[test]
    fn test_remote_failure_is_exception() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir);

        // The server only knows a task with a different shape.
        let registry = Registry::new([local(), remote("app::Other")], []).unwrap();
        let server = RemoteServer::bind(app.clone().with_process(":remote"), registry).unwrap();
        server.spawn().unwrap();

        let client = RemoteClient::new(app);
        let err = client
            .invoke(&remote("app::Remote"), &Results::default())
            .unwrap_err();

        assert!(matches!(err, RemoteError::Exception(ref e) if e.message().contains("app::Remote")));
    }

    #[test]
    fn test_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let client = RemoteClient::new(app(&dir));

        // Declared, but nothing listens.
        let err = client
            .invoke(&remote("app::Remote"), &Results::default())
            .unwrap_err();
        assert!(matches!(err, RemoteError::UnreachableRemote { .. }));

        // Multi-process satellites are never addressed.
        let per_caller = TaskDescriptor::builder("app::PerCaller")
            .kind(ExecutorKind::RemoteAsync)
            .process(":per-caller")
            .action(|_, _| Ok(()));
        let err = client
            .invoke(&per_caller, &Results::default())
            .unwrap_err();
        assert!(matches!(err, RemoteError::UnreachableRemote { ref reason, .. } if reason == "no endpoint declared"));
    }

    #[test]
    fn test_peer_lost() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir);
        let decl = app.satellite(":remote").unwrap().clone();
        let listener = UnixListener::bind(app.endpoint_path(&decl)).unwrap();

        // A satellite that reads the request and dies without replying.
        let dying = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_frame(&mut stream).unwrap();
        });

        let client = RemoteClient::new(app);
        let err = client
            .invoke(&remote("app::Remote"), &Results::default())
            .unwrap_err();

        dying.join().unwrap();
        assert!(matches!(err, RemoteError::PeerLost { ref process } if process == ":remote"));
    }
}
