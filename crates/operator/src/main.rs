use std::sync::Arc;

use kube::Client;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use daemonjob_operator::{
    config::Config,
    controllers::DaemonJobController,
    kubernetes::KubePlatformClient,
    server::Server,
    Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = Config::load()?;
    info!("Loaded configuration: {:?}", config);

    let client = Client::try_default().await?;

    let controller = Arc::new(DaemonJobController::new(
        Arc::new(KubePlatformClient::new(client.clone())),
        config.controller.clone(),
    ));

    let server = Server::new(&config);

    tokio::select! {
        _ = controller.run(client) => {
            info!("Controller exited, shutting down");
        }
        res = server.start() => {
            if let Err(e) = &res {
                error!("Server failed: {}", e);
            }
            res?;
        }
    }

    Ok(())
}
