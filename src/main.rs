// Headless runner: connect to a simulator and stream session events to
// the log until interrupted.

use anyhow::{Context, Result};
use slipstream::networking::Client;
use slipstream::utils::logging::init_logging;
use slipstream::world::NullSink;
use std::net::SocketAddr;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let peer: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9000".to_string())
        .parse()
        .context("peer address")?;

    let config = slipstream::config::load_settings();
    let mut client = Client::connect(peer, config, Box::new(NullSink::default()))
        .await
        .context("connect")?;

    let mut events = client.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => tracing::info!(?event, "client event"),
                Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, disconnecting");
                client.disconnect().await;
                break;
            }
        }
    }

    client.shutdown();
    Ok(())
}
