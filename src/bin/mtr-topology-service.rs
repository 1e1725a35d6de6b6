//! Thin example binary wiring `Controller` end to end: load config, start
//! the scheduler and periodic scanner, seed a few targets, and print
//! topology/path-change summaries until interrupted.
//!
//! Not itself part of the library's contract — a real deployment's HTTP
//! façade, CLI, and target-source discovery are external collaborators
//! (see `SPEC_FULL.md` §1); this only proves the pieces fit together the
//! way the teacher's `main.rs` proved its own session wiring.

use std::sync::Arc;
use std::time::Duration;

use mtr_topology_core::{Controller, ServiceConfig};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("mtr_topology_core=info")
        .init();

    let config = load_config()?;
    info!(vantage = %config.vantage, "starting mtr-topology-service");

    let controller = Arc::new(Controller::init(config)?);
    controller.seed_targets(std::env::args().skip(1).filter_map(|a| a.parse().ok()));
    controller.start();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        _ = report_loop(controller.clone()) => {}
    }

    controller.stop(Duration::from_secs(5)).await;
    Ok(())
}

fn load_config() -> anyhow::Result<ServiceConfig> {
    let Some(path) = std::env::var_os("MTR_TOPOLOGY_CONFIG") else {
        return Ok(ServiceConfig::default());
    };
    let text = std::fs::read_to_string(&path)?;
    Ok(toml::from_str(&text)?)
}

async fn report_loop(controller: Arc<Controller>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    loop {
        ticker.tick().await;
        let links = controller.topology(Duration::from_secs(3600), None);
        info!(link_count = links.len(), "topology snapshot");
        for event in controller.path_changes(None, Duration::from_secs(3600)) {
            info!(target = %event.target, old = %event.old_signature, new = %event.new_signature, "recent path change");
        }
    }
}
