//! Runs a standalone rendezvous server.
//!
//! ```sh
//! cargo run -p beamdrop-rendezvous --example serve
//! BEAMDROP_PORT=4000 cargo run -p beamdrop-rendezvous --example serve
//! ```

use beamdrop_rendezvous::{RendezvousServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut config = ServerConfig::default();
    if let Ok(port) = std::env::var("BEAMDROP_PORT") {
        config.port = port.parse()?;
    }

    let server = RendezvousServer::new(config);
    let runner = std::sync::Arc::clone(&server);
    let handle = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c().await?;
    server.shutdown();
    handle.await??;
    Ok(())
}
