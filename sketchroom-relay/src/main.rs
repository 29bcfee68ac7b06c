use log::{error, info};
use sketchroom_sync::relay::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!(
        "Starting sketchroom relay (max {} peers per room, capacity {})",
        config.max_peers_per_room, config.broadcast_capacity
    );

    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
