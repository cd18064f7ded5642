//! Message queue abstraction
//!
//! The outbound side of the core hands serialized messages to a queue and
//! gets them back, possibly delayed, in a single listener callback. The
//! queue owns durability; the core only relies on the delay hint being
//! honored within a reasonable tolerance.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::{FederationError, Result};

/// Consumer callback invoked at-least-once per enqueued message
pub type MessageHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Durable-ish transport for outbox messages
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueue a message, optionally delaying its delivery
    async fn enqueue(&self, message: Vec<u8>, delay: Option<Duration>) -> Result<()>;

    /// Register the single consumer
    ///
    /// # Errors
    /// A second `listen` call fails; the queue has one consumer.
    fn listen(&self, handler: MessageHandler) -> Result<()>;
}

/// In-process queue on an unbounded channel
///
/// Not durable across restarts; fine for tests and single-node setups
/// where the host accepts losing in-flight retries on shutdown. Delayed
/// messages sleep on a detached task before entering the channel, so
/// delivery order across messages is unspecified.
pub struct InProcessQueue {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl Default for InProcessQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }
}

#[async_trait]
impl MessageQueue for InProcessQueue {
    async fn enqueue(&self, message: Vec<u8>, delay: Option<Duration>) -> Result<()> {
        match delay.filter(|d| !d.is_zero()) {
            Some(delay) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    // The consumer may be gone by the time the delay ends.
                    if tx.send(message).is_err() {
                        tracing::debug!("delayed message dropped: queue closed");
                    }
                });
                Ok(())
            }
            None => self
                .tx
                .send(message)
                .map_err(|_| FederationError::Queue("queue closed".to_string())),
        }
    }

    fn listen(&self, handler: MessageHandler) -> Result<()> {
        let mut slot = self
            .rx
            .lock()
            .map_err(|_| FederationError::Queue("queue poisoned".to_string()))?;
        let mut rx = slot
            .take()
            .ok_or_else(|| FederationError::Queue("a listener is already registered".to_string()))?;

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                handler(message).await;
            }
        });
        Ok(())
    }
}
