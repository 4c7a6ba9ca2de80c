//! Discovery and validation of task descriptors.
//!
//! Tasks are grouped into [`Module`]s. Modules are found through *service
//! files*, plain text files listing one module name per line, which are
//! resolved against a [`Catalog`] of module providers compiled into the
//! binary. A service file may contain blank lines and `#` comments.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use glob::glob;

use crate::descriptor::{HandlerDescriptor, TaskDescriptor, TaskId};
use crate::error::RegistryError;

/// Conventional location of service files, relative to a metadata root.
pub const SERVICE_FILE: &str = "META-INF/services/hajime.modules";

/// A group of task and handler descriptors contributed by one component of
/// the application.
pub trait Module: Send + Sync {
    fn tasks(&self) -> Vec<TaskDescriptor>;

    fn handlers(&self) -> Vec<HandlerDescriptor> {
        Vec::new()
    }
}

type Provider = Arc<dyn Fn() -> Box<dyn Module> + Send + Sync>;

/// Named module providers known to the binary.
#[derive(Clone, Default)]
pub struct Catalog {
    providers: HashMap<String, Provider>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, M>(mut self, name: impl Into<String>, provider: F) -> Self
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: Module + 'static,
    {
        self.providers
            .insert(name.into(), Arc::new(move || Box::new(provider())));
        self
    }

    pub fn provide(&self, name: &str) -> Option<Box<dyn Module>> {
        self.providers.get(name).map(|provider| provider())
    }
}

/// Parsed contents of a single service file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFile {
    path: Option<Utf8PathBuf>,
    entries: Vec<String>,
}

impl ServiceFile {
    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .map(|line| line.split('#').next().unwrap_or_default().trim())
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        Self {
            path: None,
            entries,
        }
    }

    pub fn read(path: impl AsRef<Utf8Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        Ok(Self {
            path: Some(path.to_owned()),
            ..Self::parse(&content)
        })
    }

    /// Reads every service file found under `root`, sorted by path.
    pub fn discover(root: impl AsRef<Utf8Path>) -> Result<Vec<Self>, RegistryError> {
        let pattern = root.as_ref().join("**").join(SERVICE_FILE);

        let mut paths = Vec::new();
        for path in glob(pattern.as_str())? {
            paths.push(Utf8PathBuf::try_from(path?)?);
        }
        paths.sort();

        paths.iter().map(Self::read).collect()
    }

    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

/// Immutable, validated set of descriptors, sorted by task id.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    tasks: BTreeMap<TaskId, TaskDescriptor>,
    handlers: HashMap<TaskId, HandlerDescriptor>,
}

impl Registry {
    /// Materializes the registry from service files. Entries naming a module
    /// the catalog doesn't know are skipped.
    pub fn load(catalog: &Catalog, files: &[ServiceFile]) -> Result<Self, RegistryError> {
        let mut modules = Vec::new();

        for file in files {
            for name in file.entries() {
                match catalog.provide(name) {
                    Some(module) => modules.push(module),
                    None => tracing::warn!(
                        module = name.as_str(),
                        file = file.path().map(Utf8Path::as_str),
                        "Skipping unknown module"
                    ),
                }
            }
        }

        Self::from_modules(modules)
    }

    /// Materializes the registry from modules listed in code.
    pub fn from_modules<I, M>(modules: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = M>,
        M: AsRef<dyn Module>,
    {
        let mut tasks = Vec::new();
        let mut handlers = Vec::new();

        for module in modules {
            let module = module.as_ref();
            tasks.extend(module.tasks());
            handlers.extend(module.handlers());
        }

        Self::new(tasks, handlers)
    }

    /// Validates the given descriptors.
    ///
    /// When several handlers protect the same task, the one with the highest
    /// priority is kept, ties going to the one listed first.
    pub fn new(
        tasks: impl IntoIterator<Item = TaskDescriptor>,
        handlers: impl IntoIterator<Item = HandlerDescriptor>,
    ) -> Result<Self, RegistryError> {
        let mut map = BTreeMap::new();
        for task in tasks {
            if map.contains_key(task.id()) {
                return Err(RegistryError::DuplicateTask(task.id().clone()));
            }
            map.insert(task.id().clone(), task);
        }

        for task in map.values() {
            for dependency in task.dependencies() {
                if !map.contains_key(dependency) {
                    return Err(RegistryError::UnresolvedDependency {
                        task: task.id().clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        let mut merged: HashMap<TaskId, HandlerDescriptor> = HashMap::new();
        for handler in handlers {
            if let Some(existing) = merged.get(handler.task_id())
                && existing.priority() >= handler.priority()
            {
                continue;
            }
            merged.insert(handler.task_id().clone(), handler);
        }

        Ok(Self {
            tasks: map,
            handlers: merged,
        })
    }

    pub fn get(&self, id: &str) -> Option<&TaskDescriptor> {
        self.tasks.get(id)
    }

    pub fn handler(&self, id: &str) -> Option<&HandlerDescriptor> {
        self.handlers.get(id)
    }

    /// Descriptors sorted by id.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskDescriptor> {
        self.tasks.values()
    }

    pub fn handlers(&self) -> &HashMap<TaskId, HandlerDescriptor> {
        &self.handlers
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::resolver::Rethrow;

    struct Fixed(Vec<TaskDescriptor>, Vec<HandlerDescriptor>);

    impl Module for Fixed {
        fn tasks(&self) -> Vec<TaskDescriptor> {
            self.0.clone()
        }

        fn handlers(&self) -> Vec<HandlerDescriptor> {
            self.1.clone()
        }
    }

    fn task(id: &str, deps: &[&str]) -> TaskDescriptor {
        TaskDescriptor::builder(id)
            .depends_on_all(deps.iter().copied())
            .action(|_, _| Ok(()))
    }

    fn handler(id: &str, priority: i32) -> HandlerDescriptor {
        HandlerDescriptor::new(id, "a", || Rethrow).with_priority(priority)
    }

    #[test]
    fn test_sorted_by_id() {
        let registry = Registry::new([task("c", &[]), task("a", &[]), task("b", &["a"])], [])
            .unwrap();

        let ids: Vec<_> = registry.tasks().map(|t| t.id().as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert!(registry.get("b").is_some());
    }

    #[test]
    fn test_duplicate_task() {
        let err = Registry::new([task("a", &[]), task("a", &[])], []).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateTask(id) if id.as_str() == "a"));
    }

    #[test]
    fn test_unresolved_dependency() {
        let err = Registry::new([task("a", &["ghost"])], []).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::UnresolvedDependency { task, dependency }
                if task.as_str() == "a" && dependency.as_str() == "ghost"
        ));
    }

    #[test]
    fn test_handler_merge() {
        let registry = Registry::new(
            [task("a", &[])],
            [handler("low", 1), handler("high", 5), handler("tie", 5)],
        )
        .unwrap();

        assert_eq!(registry.handler("a").unwrap().id(), "high");
        assert!(registry.handler("b").is_none());
    }

    #[test]
    fn test_service_file_parse() {
        let file = ServiceFile::parse("# modules\napp::Core\n\n  app::Net # trailing\n");
        assert_eq!(file.entries(), ["app::Core", "app::Net"]);
    }

    #[test]
    fn test_load_skips_unknown_modules() {
        let catalog = Catalog::new()
            .register("core", || Fixed(vec![task("a", &[])], vec![]))
            .register("net", || Fixed(vec![task("b", &["a"])], vec![]));

        let files = [
            ServiceFile::parse("core\nmissing"),
            ServiceFile::parse("net"),
        ];
        let registry = Registry::load(&catalog, &files).unwrap();

        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_discover() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();

        for module in ["one", "two"] {
            let path = root.join(module).join(SERVICE_FILE);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, format!("{module}\n")).unwrap();
        }

        let files = ServiceFile::discover(root).unwrap();
        let entries: Vec<_> = files.iter().flat_map(|f| f.entries()).collect();
        assert_eq!(entries, ["one", "two"]);
        assert!(files[0].path().unwrap().ends_with(SERVICE_FILE));
    }
}
