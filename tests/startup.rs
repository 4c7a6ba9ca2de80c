use std::fs;
use std::sync::{Arc, Mutex};

use camino::Utf8Path;
use hajime::{
    AppContext, Catalog, Engine, EngineError, ExecutorKind, Module, SERVICE_FILE, TaskDescriptor,
};

struct Core {
    log: Arc<Mutex<Vec<String>>>,
}

impl Module for Core {
    fn tasks(&self) -> Vec<TaskDescriptor> {
        let log = self.log.clone();
        let settings = TaskDescriptor::builder("core::Settings")
            .name("Settings")
            .produce(|_, _| Ok(42u32));

        let window = TaskDescriptor::builder("core::Window")
            .kind(ExecutorKind::UiBlocking)
            .depends_on("core::Settings")
            .action(move |_, results| {
                let settings: Option<u32> = results.get_as("core::Settings")?;
                log.lock().unwrap().push(format!("window {settings:?}"));
                Ok(())
            });

        vec![settings, window]
    }
}

#[test]
fn startup_runs_once_per_process() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8Path::from_path(dir.path()).unwrap();

    let services = root.join("core").join(SERVICE_FILE);
    fs::create_dir_all(services.parent().unwrap()).unwrap();
    fs::write(&services, "# modules\ncore\n\nmissing # unknown, skipped\n").unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let catalog = Catalog::new().register("core", {
        let log = log.clone();
        move || Core { log: log.clone() }
    });

    let app = AppContext::new("test.app").with_metadata_dir(root);
    let engine = Engine::builder(app.clone())
        .catalog(catalog.clone())
        .build()
        .unwrap();
    assert_eq!(engine.registry().len(), 2);

    let startup = engine.start().unwrap();
    startup.wait_ui_unlocked();
    assert!(startup.is_ui_unlocked());
    assert_eq!(*log.lock().unwrap(), ["window Some(42)"]);

    let diagnostics = startup.wait().unwrap();
    assert!(diagnostics.render_mermaid().contains("core::Settings"));

    let again = Engine::builder(app).catalog(catalog).build().unwrap().start();
    assert!(matches!(again, Err(EngineError::AlreadyStarted)));
}
