//! Dedicated writer task for outbound frames.
//!
//! All outbound frames are serialized onto the single gateway connection by
//! one task that owns the websocket sink. Callers hold a cloneable
//! [`WriterHandle`] and push encoded frames through an mpsc channel.
//!
//! # Architecture
//!
//! ```text
//! Caller 1 ─┐
//! Caller 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► WebSocket sink
//! Caller N ─┘
//! ```
//!
//! Ready frames are batched: each is fed to the sink and the batch is
//! flushed once. A pending counter provides backpressure with a timeout.

use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{GatewayError, Result};
use crate::protocol::{Frame, FrameCodec};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch before a flush.
const MAX_BATCH_SIZE: usize = 64;

/// An encoded frame ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    text: String,
}

impl OutboundFrame {
    /// Encode a frame.
    pub fn encode(frame: &Frame) -> Result<Self> {
        Ok(Self {
            text: FrameCodec::encode(frame)?,
        })
    }

    /// Wrap already encoded text.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Encoded text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    fn into_message(self) -> Message {
        Message::text(self.text)
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone, PartialEq)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundFrame>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
        }
    }

    /// Send a frame to the writer task, waiting out backpressure.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            GatewayError::ConnectionClosed
        })
    }

    /// Encode and send a protocol frame.
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.send(OutboundFrame::encode(frame)?).await
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_millis(1);

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }
            if self.is_closed() {
                return Err(GatewayError::ConnectionClosed);
            }
            if start.elapsed() > self.timeout {
                return Err(GatewayError::BackpressureTimeout);
            }
            tokio::time::sleep(check_interval).await;
        }
    }

    /// Whether the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether both handles feed the same writer task.
    pub fn same_channel(&self, other: &WriterHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// Whether backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Spawn the writer task over a websocket sink.
///
/// The task ends cleanly once every handle is dropped, and with an error
/// when the sink fails.
pub fn spawn_writer_task<S>(sink: S, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        config.max_pending_frames,
        config.backpressure_timeout,
    );

    let task = tokio::spawn(writer_loop(rx, sink, pending));

    (handle, task)
}

async fn writer_loop<S>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut sink: S,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    loop {
        let first = match rx.recv().await {
            Some(frame) => frame,
            None => {
                // All handles dropped: say goodbye and stop.
                let _ = sink.close().await;
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        let written = write_batch(&mut sink, batch).await;
        pending.fetch_sub(batch_size, Ordering::Release);

        if let Err(e) = written {
            rx.close();
            return Err(e);
        }
    }
}

async fn write_batch<S>(sink: &mut S, batch: Vec<OutboundFrame>) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    for frame in batch {
        sink.feed(frame.into_message())
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
    }
    sink.flush()
        .await
        .map_err(|e| GatewayError::Transport(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestFrame;
    use futures::channel::mpsc as fmpsc;
    use futures::StreamExt;

    fn text_of(msg: Message) -> String {
        match msg {
            Message::Text(text) => text.as_str().to_string(),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending_frames, DEFAULT_MAX_PENDING_FRAMES);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.backpressure_timeout, DEFAULT_BACKPRESSURE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_frames_are_written_in_order() {
        let (sink, mut stream) = fmpsc::unbounded::<Message>();
        let (handle, _task) = spawn_writer_task(sink, WriterConfig::default());

        for i in 0..10 {
            handle
                .send(OutboundFrame::from_text(format!("frame-{i}")))
                .await
                .unwrap();
        }

        for i in 0..10 {
            let msg = stream.next().await.unwrap();
            assert_eq!(text_of(msg), format!("frame-{i}"));
        }
    }

    #[tokio::test]
    async fn test_send_frame_encodes_json() {
        let (sink, mut stream) = fmpsc::unbounded::<Message>();
        let (handle, _task) = spawn_writer_task(sink, WriterConfig::default());

        let frame = Frame::Request(RequestFrame::with_id("1", "models.list", None));
        handle.send_frame(&frame).await.unwrap();

        let text = text_of(stream.next().await.unwrap());
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["method"], "models.list");
    }

    #[tokio::test]
    async fn test_pending_count_drains() {
        let (sink, mut stream) = fmpsc::unbounded::<Message>();
        let (handle, _task) = spawn_writer_task(sink, WriterConfig::default());

        handle.send(OutboundFrame::from_text("x")).await.unwrap();
        stream.next().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(handle.pending_count(), 0);
        assert!(!handle.is_backpressure_active());
    }

    #[tokio::test]
    async fn test_send_fails_when_at_capacity() {
        let (tx, _rx) = mpsc::channel::<OutboundFrame>(10);
        let pending = Arc::new(AtomicUsize::new(4));
        let handle = WriterHandle::new(tx, pending, 4, Duration::from_millis(20));

        let result = handle.send(OutboundFrame::from_text("x")).await;
        assert!(matches!(result, Err(GatewayError::BackpressureTimeout)));
    }

    #[tokio::test]
    async fn test_send_after_sink_failure_reports_closed() {
        let (sink, stream) = fmpsc::unbounded::<Message>();
        drop(stream);
        let (handle, task) = spawn_writer_task(sink, WriterConfig::default());

        let _ = handle.send(OutboundFrame::from_text("x")).await;
        let result = task.await.unwrap();
        assert!(matches!(result, Err(GatewayError::Transport(_))));

        let err = handle.send(OutboundFrame::from_text("y")).await.unwrap_err();
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_handle_drop() {
        let (sink, _stream) = fmpsc::unbounded::<Message>();
        let (handle, task) = spawn_writer_task(sink, WriterConfig::default());

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }
}
