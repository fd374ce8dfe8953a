//! BaseNode entry point
//!
//! `basenode [config_file]` - loads the node configuration (default
//! `config/basenode.json`), sizes the runtime from it and runs the module
//! container until SIGINT.

use std::path::Path;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use basenode::config::NodeConfig;
use basenode::node::BaseNode;

const DEFAULT_CONFIG_PATH: &str = "config/basenode.json";

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config_path = args
        .get(1)
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);

    let config = match NodeConfig::load(Path::new(config_path)) {
        Ok(config) => config,
        Err(err) => {
            error!(path = config_path, %err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    info!(path = config_path, modules = ?config.modules, "configuration loaded");

    let worker_threads = config.network.worker_threads.max(1);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let node = BaseNode::new(config)?;
        node.run().await
    })
}
