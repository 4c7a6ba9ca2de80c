use std::fmt::Debug;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

/// Hooks into the host platform.
pub trait Platform: Send + Sync {
    /// Called once on every freshly started worker thread, before it picks up
    /// any task. Hosts use it to raise the thread to foreground priority.
    fn on_worker_start(&self) {}
}

/// Platform without any hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPlatform;

impl Platform for NoPlatform {}

/// A satellite process declared by the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatelliteDecl {
    /// Process name, as used by remote task descriptors.
    pub process: String,
    /// Authority of the endpoint the process serves.
    pub authority: String,
    /// Satellites instantiated once per calling process cannot be addressed
    /// by a single endpoint and are never connected to.
    pub multiprocess: bool,
}

#[derive(Clone)]
struct AppInner {
    app_id: String,
    process: String,
    runtime_dir: Utf8PathBuf,
    metadata_dir: Option<Utf8PathBuf>,
    satellites: Vec<SatelliteDecl>,
    platform: Arc<dyn Platform>,
}

/// Handle to the host application, passed to every task body.
///
/// Cloning is cheap, all clones share the same data.
#[derive(Clone)]
pub struct AppContext {
    inner: Arc<AppInner>,
}

impl AppContext {
    /// Describes the main process of the application `app_id`. Endpoint
    /// sockets default to the system temporary directory.
    pub fn new(app_id: impl Into<String>) -> Self {
        let runtime_dir = Utf8PathBuf::try_from(std::env::temp_dir())
            .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"));

        Self {
            inner: Arc::new(AppInner {
                app_id: app_id.into(),
                process: String::new(),
                runtime_dir,
                metadata_dir: None,
                satellites: Vec::new(),
                platform: Arc::new(NoPlatform),
            }),
        }
    }

    fn inner_mut(&mut self) -> &mut AppInner {
        Arc::make_mut(&mut self.inner)
    }

    /// Name of the current process, empty for the main process.
    pub fn with_process(mut self, process: impl Into<String>) -> Self {
        self.inner_mut().process = process.into();
        self
    }

    pub fn with_runtime_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.inner_mut().runtime_dir = dir.into();
        self
    }

    pub fn with_metadata_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.inner_mut().metadata_dir = Some(dir.into());
        self
    }

    pub fn with_satellite(
        mut self,
        process: impl Into<String>,
        authority: impl Into<String>,
        multiprocess: bool,
    ) -> Self {
        self.inner_mut().satellites.push(SatelliteDecl {
            process: process.into(),
            authority: authority.into(),
            multiprocess,
        });
        self
    }

    pub fn with_platform(mut self, platform: impl Platform + 'static) -> Self {
        self.inner_mut().platform = Arc::new(platform);
        self
    }

    pub fn app_id(&self) -> &str {
        &self.inner.app_id
    }

    pub fn process(&self) -> &str {
        &self.inner.process
    }

    pub fn runtime_dir(&self) -> &Utf8Path {
        &self.inner.runtime_dir
    }

    pub fn metadata_dir(&self) -> Option<&Utf8Path> {
        self.inner.metadata_dir.as_deref()
    }

    pub fn satellites(&self) -> &[SatelliteDecl] {
        &self.inner.satellites
    }

    pub fn platform(&self) -> &dyn Platform {
        &*self.inner.platform
    }

    /// Declaration of the given satellite process, if any.
    pub fn satellite(&self, process: &str) -> Option<&SatelliteDecl> {
        self.inner
            .satellites
            .iter()
            .find(|decl| decl.process == process)
    }

    /// Logical URL of a satellite endpoint, `hajime://<app_id>.<authority>`.
    pub fn endpoint_url(&self, decl: &SatelliteDecl) -> String {
        format!("hajime://{}.{}", self.inner.app_id, decl.authority)
    }

    /// Socket path of a satellite endpoint inside the runtime directory.
    pub fn endpoint_path(&self, decl: &SatelliteDecl) -> Utf8PathBuf {
        self.inner
            .runtime_dir
            .join(format!("{}.{}.sock", self.inner.app_id, decl.authority))
    }

    /// Socket path of the endpoint served by the current process.
    pub fn own_endpoint(&self) -> Option<Utf8PathBuf> {
        self.satellite(&self.inner.process)
            .map(|decl| self.endpoint_path(decl))
    }
}

impl Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("app_id", &self.inner.app_id)
            .field("process", &self.inner.process)
            .field("runtime_dir", &self.inner.runtime_dir)
            .field("metadata_dir", &self.inner.metadata_dir)
            .field("satellites", &self.inner.satellites)
            .finish_non_exhaustive()
    }
}
