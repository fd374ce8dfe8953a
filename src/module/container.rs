//! Module container
//!
//! Builds modules from named package factories in declared order, drives
//! init / post-init / tick / uninit, and isolates each tick so a panicking
//! module cannot take the process down with it.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::error::ErrorCode;
use crate::module::host::ModuleHost;
use crate::module::router::ModuleRouter;
use crate::module::traits::Module;

/// Default interval between container ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1000);

type FactoryFn = Box<dyn Fn() -> Box<dyn Module> + Send + Sync>;

/// In-process registry of module packages: a name maps to a factory that
/// builds the module. Stands in for a dynamic-library loader; the container
/// contract is identical either way.
#[derive(Default)]
pub struct ModuleFactories {
    factories: HashMap<String, FactoryFn>,
}

impl ModuleFactories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a package under `name`.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Module> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Build the named package, if registered.
    pub fn build(&self, name: &str) -> Option<Box<dyn Module>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

/// Owns the loaded modules and drives their lifecycle on one tick thread.
pub struct ModuleContainer {
    router: Arc<ModuleRouter>,
    modules: Vec<Arc<ModuleHost>>,
    tick_interval: Duration,
}

impl ModuleContainer {
    pub fn new(router: Arc<ModuleRouter>) -> Self {
        ModuleContainer {
            router,
            modules: Vec::new(),
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn router(&self) -> &Arc<ModuleRouter> {
        &self.router
    }

    pub fn modules(&self) -> &[Arc<ModuleHost>] {
        &self.modules
    }

    /// Build and stage the configured packages in declared order. An
    /// unknown package name aborts startup.
    pub fn load_packages(
        &mut self,
        factories: &ModuleFactories,
        names: &[String],
    ) -> anyhow::Result<()> {
        for name in names {
            let module = factories
                .build(name)
                .ok_or_else(|| anyhow::anyhow!("unknown module package: {name}"))?;
            info!(package = %name, class = module.class_name(), "loaded module package");
            self.add_module(ModuleHost::new(module));
        }
        Ok(())
    }

    /// Stage an already-hosted module (tests, embedders).
    pub fn add_module(&mut self, host: Arc<ModuleHost>) {
        self.modules.push(host);
    }

    /// Initialize every module in load order; the first failure aborts.
    pub fn init_all(&self) -> Result<(), ErrorCode> {
        for module in &self.modules {
            if let Err(code) = module.init(&self.router) {
                error!(
                    class = module.class_name(),
                    ?code,
                    "module init failed, aborting startup"
                );
                return Err(code);
            }
            info!(class = module.class_name(), id = module.module_id(), "module initialized");
        }
        Ok(())
    }

    /// Run the post-init pass once every module has initialized.
    pub fn post_all_init(&self) -> Result<(), ErrorCode> {
        self.router.post_all_init()
    }

    /// Tick every module once, in insertion order, isolating panics.
    pub fn tick_all(&self) {
        for module in &self.modules {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| module.tick()));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(code)) => {
                    // Tick failures are logged, never propagated.
                    warn!(class = module.class_name(), ?code, "module tick failed");
                }
                Err(_) => {
                    error!(
                        class = module.class_name(),
                        "module tick panicked, continuing with next module"
                    );
                }
            }
        }
    }

    /// Main loop: tick on the configured interval until shutdown flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.tick_interval.as_millis() as u64, "container loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick_all(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("container loop stopped");
    }

    /// Uninitialize every module in load order; failures are logged.
    pub fn uninit_all(&self) {
        for module in &self.modules {
            if module.uninit(&self.router).is_err() {
                warn!(class = module.class_name(), "module uninit reported an error");
            }
        }
    }
}
