//! Node orchestration
//!
//! Wires the router, the network boundary, the coordination client and the
//! built-in module packages into a runnable node, then drives the container
//! lifecycle until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;

use crate::cluster::ClusterRouterModule;
use crate::config::NodeConfig;
use crate::discovery::{
    CoordinationClient, CoordinationPaths, DiscoveryModule, MemoryCoordinationClient,
    ServiceDiscovery, ServiceRegistry,
};
use crate::module::{ModuleContainer, ModuleFactories, ModuleRouter};
use crate::net::{NetworkModule, TcpBoundary};
use crate::utils::create_shutdown_receiver;

/// A runnable BaseNode process.
pub struct BaseNode {
    container: ModuleContainer,
    router: Arc<ModuleRouter>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl BaseNode {
    /// Build a node from configuration with the default coordination
    /// backend. A real deployment substitutes a client for `zk.hosts`.
    pub fn new(config: NodeConfig) -> anyhow::Result<Self> {
        Self::with_coordination_client(config, MemoryCoordinationClient::new())
    }

    /// Build a node against an explicit coordination client.
    pub fn with_coordination_client(
        config: NodeConfig,
        client: Arc<dyn CoordinationClient>,
    ) -> anyhow::Result<Self> {
        let router = ModuleRouter::new();
        let factories = builtin_factories(&config, &router, &client);

        let mut container = ModuleContainer::new(Arc::clone(&router))
            .with_tick_interval(Duration::from_millis(config.tick_interval_ms.max(1)));
        container
            .load_packages(&factories, &config.modules)
            .context("failed to load configured modules")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(BaseNode {
            container,
            router,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn router(&self) -> &Arc<ModuleRouter> {
        &self.router
    }

    pub fn container(&self) -> &ModuleContainer {
        &self.container
    }

    /// Handle for programmatic shutdown (tests, embedders).
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Init, post-init, tick until SIGINT or a shutdown signal, then
    /// uninit in load order and close transports.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.container
            .init_all()
            .map_err(|code| anyhow::anyhow!("module init failed: {code}"))?;
        self.container
            .post_all_init()
            .map_err(|code| anyhow::anyhow!("post-init failed: {code}"))?;
        info!("node started");

        let mut signal_rx = create_shutdown_receiver();
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            if signal_rx.changed().await.is_ok() && *signal_rx.borrow() {
                let _ = shutdown_tx.send(true);
            }
        });

        self.container.run(self.shutdown_rx.clone()).await;

        info!("shutting down: draining mailboxes and uninitializing modules");
        self.container.tick_all();
        self.container.uninit_all();
        info!("node stopped");
        Ok(())
    }
}

/// The built-in module packages selectable from `modules` in the config.
fn builtin_factories(
    config: &NodeConfig,
    router: &Arc<ModuleRouter>,
    client: &Arc<dyn CoordinationClient>,
) -> ModuleFactories {
    use crate::module::Module;

    let mut factories = ModuleFactories::new();
    let paths = CoordinationPaths::new(config.zk.root.clone());
    let process_id = format!("basenode-{}", std::process::id());

    // network: listen boundary, router ingress, cross-node egress fallback.
    {
        let router = Arc::downgrade(router);
        let listen = config.network.listen.clone();
        let worker_threads = config.network.worker_threads;
        factories.register("network", move || -> Box<dyn Module> {
            let boundary = TcpBoundary::new();
            let router = router.clone();
            let ingress = Arc::new(move |frame: bytes::Bytes| {
                if let Some(router) = router.upgrade() {
                    if let Err(code) = router.route_protocol_packet(frame) {
                        tracing::warn!(?code, "failed to route inbound frame");
                    }
                }
            });
            Box::new(NetworkModule::new(
                boundary,
                ingress,
                listen.ip.clone(),
                listen.port,
                worker_threads,
            ))
        });
    }

    // discovery: registry session + roster publication at post-init.
    {
        let client = Arc::clone(client);
        let paths = paths.clone();
        let process_id = process_id.clone();
        let (host, port) = config.advertised_address();
        let auth = config
            .zk
            .auth
            .as_ref()
            .map(|auth| (auth.username.clone(), auth.password.clone()));
        factories.register("discovery", move || -> Box<dyn Module> {
            let registry =
                ServiceRegistry::new(Arc::clone(&client), paths.clone(), process_id.clone());
            Box::new(DiscoveryModule::new(
                Arc::clone(&client),
                registry,
                host.clone(),
                port,
                auth.clone(),
            ))
        });
    }

    // cluster_router: the dedicated router process's single module.
    {
        let client = Arc::clone(client);
        let paths = paths.clone();
        let worker_threads = config.network.worker_threads;
        factories.register("cluster_router", move || -> Box<dyn Module> {
            let boundary = TcpBoundary::new();
            let discovery = ServiceDiscovery::new(Arc::clone(&client), paths.clone());
            Box::new(ClusterRouterModule::new(boundary, discovery, worker_threads))
        });
    }

    factories
}
