//! Bounded in-process FIFO carrying parsed frames from the proxy pump to the
//! response emitter. One producer and one consumer at a time; the worker
//! drains it at request boundaries so residue cannot leak between requests.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

/// One accumulated tool call observed on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    /// Decoded parameter object.
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameError {
    pub status: u16,
    pub message: String,
}

/// Response state so far. `body` and `reason` are cumulative snapshots, not
/// deltas; the emitter computes deltas against its previous snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamFrame {
    pub body: String,
    pub reason: String,
    pub function: Vec<ToolInvocation>,
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FrameError>,
}

impl StreamFrame {
    pub fn done_marker() -> Self {
        StreamFrame {
            done: true,
            ..Default::default()
        }
    }

    /// Synthetic frame for the internal idle timeout.
    pub fn internal_timeout() -> Self {
        StreamFrame {
            reason: "internal_timeout".to_string(),
            done: true,
            ..Default::default()
        }
    }

    pub fn upstream_error(status: u16, message: impl Into<String>) -> Self {
        StreamFrame {
            done: true,
            error: Some(FrameError {
                status,
                message: message.into(),
            }),
            ..Default::default()
        }
    }

    pub fn is_internal_timeout(&self) -> bool {
        self.done && self.reason == "internal_timeout"
    }
}

/// The stream bus. Bounded: a full bus blocks the publisher (backpressure);
/// frames are never dropped.
pub struct StreamBus {
    tx: mpsc::Sender<StreamFrame>,
    rx: AsyncMutex<mpsc::Receiver<StreamFrame>>,
}

impl StreamBus {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        StreamBus {
            tx,
            rx: AsyncMutex::new(rx),
        }
    }

    /// Sender handle for the proxy pump.
    pub fn publisher(&self) -> mpsc::Sender<StreamFrame> {
        self.tx.clone()
    }

    pub async fn publish(&self, frame: StreamFrame) {
        // Only fails when the bus itself is gone, i.e. at shutdown.
        let _ = self.tx.send(frame).await;
    }

    pub async fn recv(&self) -> Option<StreamFrame> {
        self.rx.lock().await.recv().await
    }

    /// Receive with a deadline. `Ok(None)` means the channel closed,
    /// `Err(())` means the timeout elapsed.
    pub async fn recv_timeout(
        &self,
        wait: std::time::Duration,
    ) -> Result<Option<StreamFrame>, ()> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(wait, rx.recv()).await.map_err(|_| ())
    }

    /// Discard everything currently buffered. Returns the number of frames
    /// dropped.
    pub async fn drain(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}
