//! Watch - connect to a gateway and print what happens.
//!
//! This example demonstrates:
//! - Building a client from `ClientConfig::from_env()`
//! - Following connection state changes
//! - Consuming the typed event feed
//! - Reading column state from the registry
//!
//! # Running
//!
//! ```sh
//! GATEWAY_URL=ws://127.0.0.1:18789 GATEWAY_TOKEN=... \
//!     RUST_LOG=gateway_client=debug cargo run --example watch
//! ```

use gateway_client::registry;
use gateway_client::{ClientBuilder, ClientConfig, GatewayEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = ClientConfig::from_env();
    println!("Connecting to {}", config.url);

    let client = ClientBuilder::from_config(config)
        .column("main", "main")
        .start()
        .await?;

    let mut state = client.subscribe_state();
    let mut events = client.subscribe_events();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("state: {:?}", *state.borrow_and_update());
            }
            event = events.recv() => match event {
                Ok(GatewayEvent::Tick) => {}
                Ok(GatewayEvent::Agent(agent)) => {
                    let registry = registry::lock(client.registry());
                    if let Some(column) = registry.column("main") {
                        println!(
                            "agent run {}: main is {:?} ({} messages)",
                            agent.run_id,
                            column.status,
                            column.messages.len()
                        );
                    }
                }
                Ok(other) => println!("event: {}", other.name()),
                Err(RecvError::Lagged(n)) => println!("missed {} events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.shutdown().await;
    Ok(())
}
