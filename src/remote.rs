//! Cross-process tasks.
//!
//! Remote tasks are executed by a [`RemoteServer`] running in a satellite
//! process. The engine reaches it over a Unix domain socket using the framed
//! [`envelope`] protocol.

#[cfg(unix)]
mod client;
pub mod envelope;
#[cfg(unix)]
mod server;

#[cfg(unix)]
pub(crate) use client::RemoteClient;
pub use envelope::{RemoteException, StackFrame};
#[cfg(unix)]
pub use server::RemoteServer;
