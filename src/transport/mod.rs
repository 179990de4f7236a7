//! Transport module - websocket connection to the gateway.
//!
//! Provides:
//! - [`connect`]: open a websocket with a timeout and split it into a sink
//!   (owned by the writer task) and a stream (owned by the read loop)
//! - [`Backoff`]: exponential reconnect delay with a cap

mod backoff;
mod websocket;

pub use backoff::Backoff;
pub use websocket::{connect, WsSink, WsStream};
