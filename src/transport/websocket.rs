//! Websocket dialing.
//!
//! # Example
//!
//! ```ignore
//! use gateway_client::transport::connect;
//! use std::time::Duration;
//!
//! let (sink, stream) = connect("ws://127.0.0.1:18789", Duration::from_secs(10)).await?;
//! ```

use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{GatewayError, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of a gateway connection.
pub type WsSink = SplitSink<Socket, Message>;

/// Read half of a gateway connection.
pub type WsStream = SplitStream<Socket>;

/// Open a websocket to `url`, failing with a connectivity error if the
/// upgrade does not complete within `timeout`.
pub async fn connect(url: &str, timeout: Duration) -> Result<(WsSink, WsStream)> {
    tracing::debug!("Connecting to {}", url);

    let (socket, response) = match tokio::time::timeout(timeout, connect_async(url)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(GatewayError::connectivity(format!(
                "connect to {} timed out after {:?}",
                url, timeout
            )))
        }
    };

    tracing::debug!("Websocket upgrade to {} answered {}", url, response.status());
    Ok(socket.split())
}
