//! Tests for the module container lifecycle

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use basenode::module::host::ModuleHost;
use basenode::module::router::ModuleRouter;
use basenode::module::traits::{LifecycleState, Module, ModuleContext, PostInitContext};
use basenode::module::{ModuleContainer, ModuleFactories};
use basenode::ErrorCode;

// Records lifecycle calls into a shared journal.
struct JournalModule {
    name: String,
    journal: Arc<Mutex<Vec<String>>>,
    fail_init: bool,
    panic_on_tick: bool,
}

impl JournalModule {
    fn new(name: &str, journal: &Arc<Mutex<Vec<String>>>) -> Box<Self> {
        Box::new(JournalModule {
            name: name.to_string(),
            journal: Arc::clone(journal),
            fail_init: false,
            panic_on_tick: false,
        })
    }

    fn log(&self, event: &str) {
        self.journal
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.name, event));
    }
}

impl Module for JournalModule {
    fn class_name(&self) -> &str {
        &self.name
    }

    fn do_init(&mut self, _ctx: &ModuleContext) -> Result<(), ErrorCode> {
        self.log("init");
        if self.fail_init {
            return Err(ErrorCode::InvalidArguments);
        }
        Ok(())
    }

    fn do_post_init(&mut self, _ctx: &PostInitContext) -> Result<(), ErrorCode> {
        self.log("post_init");
        Ok(())
    }

    fn do_tick(&mut self) -> Result<(), ErrorCode> {
        if self.panic_on_tick {
            panic!("buggy module");
        }
        self.log("tick");
        Ok(())
    }

    fn do_uninit(&mut self) -> Result<(), ErrorCode> {
        self.log("uninit");
        Ok(())
    }
}

fn journal_entries(journal: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    journal.lock().unwrap().clone()
}

// ===== Loading =====

#[test]
fn unknown_package_aborts_loading() {
    let mut factories = ModuleFactories::new();
    let journal = Arc::new(Mutex::new(Vec::new()));
    let registered = Arc::clone(&journal);
    factories.register("known", move || JournalModule::new("Known", &registered));

    let mut container = ModuleContainer::new(ModuleRouter::new());
    let names = vec!["known".to_string(), "missing".to_string()];
    assert!(container.load_packages(&factories, &names).is_err());
}

#[test]
fn packages_load_in_declared_order() {
    let mut factories = ModuleFactories::new();
    let journal = Arc::new(Mutex::new(Vec::new()));
    for name in ["first", "second"] {
        let journal = Arc::clone(&journal);
        let class = format!("Pkg{name}");
        factories.register(name, move || JournalModule::new(&class, &journal));
    }
    assert!(factories.contains("first"));

    let mut container = ModuleContainer::new(ModuleRouter::new());
    container
        .load_packages(
            &factories,
            &["second".to_string(), "first".to_string()],
        )
        .unwrap();
    let classes: Vec<&str> = container
        .modules()
        .iter()
        .map(|module| module.class_name())
        .collect();
    assert_eq!(classes, vec!["Pkgsecond", "Pkgfirst"]);
}

// ===== Lifecycle =====

#[test]
fn init_failure_aborts_startup() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let mut container = ModuleContainer::new(ModuleRouter::new());

    let mut failing = JournalModule::new("Failing", &journal);
    failing.fail_init = true;
    container.add_module(ModuleHost::new(failing));
    container.add_module(ModuleHost::new(JournalModule::new("Later", &journal)));

    assert_eq!(container.init_all(), Err(ErrorCode::InvalidArguments));
    // The failing module ran its init; the later one was never reached.
    assert_eq!(journal_entries(&journal), vec!["Failing:init"]);
    assert_eq!(
        container.modules()[0].state(),
        LifecycleState::Registered
    );
}

#[test]
fn full_lifecycle_runs_in_order() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let mut container = ModuleContainer::new(ModuleRouter::new());
    container.add_module(ModuleHost::new(JournalModule::new("Alpha", &journal)));
    container.add_module(ModuleHost::new(JournalModule::new("Beta", &journal)));

    container.init_all().unwrap();
    container.post_all_init().unwrap();
    container.tick_all();
    container.uninit_all();

    let entries = journal_entries(&journal);
    assert_eq!(entries[0], "Alpha:init");
    assert_eq!(entries[1], "Beta:init");
    // Post-init order across modules is unspecified.
    assert!(entries[2..4].contains(&"Alpha:post_init".to_string()));
    assert!(entries[2..4].contains(&"Beta:post_init".to_string()));
    assert_eq!(entries[4], "Alpha:tick");
    assert_eq!(entries[5], "Beta:tick");
    assert_eq!(entries[6], "Alpha:uninit");
    assert_eq!(entries[7], "Beta:uninit");

    for module in container.modules() {
        assert_eq!(module.state(), LifecycleState::Uninitialized);
    }
}

#[test]
fn panicking_tick_does_not_stop_the_loop() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let mut container = ModuleContainer::new(ModuleRouter::new());

    let mut buggy = JournalModule::new("Buggy", &journal);
    buggy.panic_on_tick = true;
    container.add_module(ModuleHost::new(buggy));
    container.add_module(ModuleHost::new(JournalModule::new("Healthy", &journal)));
    container.init_all().unwrap();

    container.tick_all();
    container.tick_all();

    let ticks = journal_entries(&journal)
        .iter()
        .filter(|entry| entry.as_str() == "Healthy:tick")
        .count();
    assert_eq!(ticks, 2);
}

#[test]
fn uninit_always_deregisters() {
    let journal = Arc::new(Mutex::new(Vec::new()));
    let router = ModuleRouter::new();
    let mut container = ModuleContainer::new(Arc::clone(&router));
    container.add_module(ModuleHost::new(JournalModule::new("Gone", &journal)));
    container.init_all().unwrap();

    let id = container.modules()[0].module_id();
    assert!(router.module_by_id(id).is_some());
    container.uninit_all();
    assert!(router.module_by_id(id).is_none());
}

// ===== Shutdown signal =====

#[tokio::test]
async fn run_stops_on_shutdown_signal() {
    let ticked = Arc::new(AtomicBool::new(false));

    struct TickFlag {
        ticked: Arc<AtomicBool>,
    }
    impl Module for TickFlag {
        fn class_name(&self) -> &str {
            "TickFlag"
        }
        fn do_tick(&mut self) -> Result<(), ErrorCode> {
            self.ticked.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    let mut container = ModuleContainer::new(ModuleRouter::new())
        .with_tick_interval(std::time::Duration::from_millis(5));
    container.add_module(ModuleHost::new(Box::new(TickFlag {
        ticked: Arc::clone(&ticked),
    })));
    container.init_all().unwrap();

    let (tx, rx) = tokio::sync::watch::channel(false);
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        tx.send(true).unwrap();
    });

    container.run(rx).await;
    stopper.await.unwrap();
    assert!(ticked.load(Ordering::SeqCst));
}
