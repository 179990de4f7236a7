//! # gateway-client
//!
//! Control-plane client for multi-agent gateways.
//!
//! The crate keeps one multiplexed websocket to a gateway that runs
//! conversational agents, turns it into request/response calls plus an
//! event feed, and reconciles the events into per-conversation state.
//!
//! ## Architecture
//!
//! - **Transport** ([`connection`], [`writer`], [`transport`]): connect,
//!   handshake, read loop, single writer task, reconnect with backoff
//! - **Correlation** ([`correlation`]): pending calls keyed by request id
//! - **State** ([`registry`], [`router`]): columns, subagent logs and
//!   delegation, updated by routing typed events
//! - **Facade** ([`GatewayClient`]): guarded outbound calls and column
//!   operations
//! - **Persistence** ([`persistence`]): debounced transcript saving
//!
//! ## Example
//!
//! ```ignore
//! use gateway_client::GatewayClient;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> gateway_client::Result<()> {
//!     let client = GatewayClient::builder()
//!         .url("ws://127.0.0.1:18789")
//!         .column("main", "main")
//!         .start()
//!         .await?;
//!
//!     client.wait_connected(Duration::from_secs(10)).await?;
//!     let run = client
//!         .run_agent("main", "hello", &client.column_session_key("main"), None)
//!         .await?;
//!     println!("started run {}", run.run_id);
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod correlation;
pub mod error;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod transport;
pub mod writer;

mod client;

pub use client::{methods, AgentSpec, ClientBuilder, GatewayClient, ModelInfo, RunAccepted};
pub use config::ClientConfig;
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{DelegationError, GatewayError, Result};
pub use protocol::GatewayEvent;
pub use registry::{AgentSession, AgentStatus, ChatMessage, SessionRegistry, SharedRegistry};
pub use router::EventRouter;
