// # Tidepool node
//
// Entry point for a cluster node. Loads configuration, assembles the core,
// and serves the node API (peer websocket endpoint included).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tidepool::cluster::{CommandProvisioner, Core, Provisioner};
use tidepool::{api, NodeConfig, Result, VERSION};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    info!("tidepool node {}", VERSION);

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let mut config = NodeConfig::from_file(&cwd.join("tidepool.json"))?;
    if config.confdir.is_relative() {
        config.confdir = cwd.join(&config.confdir);
    }
    info!(confdir = %config.confdir.display(), "configuration loaded");

    let provisioner: Arc<dyn Provisioner> =
        Arc::new(CommandProvisioner::new(&config.provisioner_program));
    let core = Arc::new(Core::new(config.clone(), provisioner).await?);
    core.start().await;

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "serving node api");
    axum::serve(
        listener,
        api::router(Arc::clone(&core)).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    core.shutdown().await;
    Ok(())
}
