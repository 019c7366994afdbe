//! Queue contract required by the worker: long-poll receive, acknowledge
//! by delivery token, and optional visibility extension. Leaving a message
//! unacknowledged is the only negative acknowledgment; the broker makes it
//! visible again once the visibility window lapses.

use std::fmt;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

pub mod rabbitmq;
pub mod sqs;

/// Opaque handle returned with a received message. Only the queue that
/// issued it can interpret it.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DeliveryToken(String);

impl DeliveryToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Receipt handles are long and only meaningful to the broker.
impl fmt::Debug for DeliveryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown: String = self.0.chars().take(12).collect();
        write!(f, "DeliveryToken({shown}…)")
    }
}

#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub body: Vec<u8>,
    pub token: DeliveryToken,
    /// How many times the broker has handed this message out, if it tracks it.
    pub receive_count: Option<u32>,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Waits up to the configured long-poll bound. `Ok(None)` means the
    /// wait elapsed with nothing to do.
    async fn receive_next(&self) -> Result<Option<QueueMessage>>;

    /// Deletes the message permanently.
    async fn acknowledge(&self, token: &DeliveryToken) -> Result<()>;

    /// Pushes the redelivery deadline out by `timeout` from now.
    async fn extend_visibility(&self, _token: &DeliveryToken, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}
