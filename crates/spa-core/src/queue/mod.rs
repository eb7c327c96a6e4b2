//! Review queue transports
//!
//! At-least-once delivery with a visibility timeout and receive counts.
//! A received message stays invisible until the timeout passes; deleting it
//! settles it, leaving it alone lets it be delivered again. Intents are
//! stored in their versioned wire form so a queue outlives the process
//! that wrote it.
//!
//! Deleting a pending intent with [`IntentQueue::cancel`] is the human
//! cancellation path.

mod file;
mod memory;

pub use file::FileQueue;
pub use memory::InMemoryQueue;

use crate::error::QueueError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spa_model::{CategoryId, IdempotencyToken, IntentDecodeError, PurchaseIntent};
use std::fmt::{self, Display};
use std::time::Duration;

/// Default visibility timeout for received messages
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

/// Opaque handle identifying one received message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    /// Create from raw handle
    #[inline]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Raw handle
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One received message
#[derive(Debug)]
pub struct Delivery {
    /// Handle used to delete or dead-letter the message
    pub receipt: ReceiptHandle,
    /// Number of times the message has been received, this one included
    pub receive_count: u32,
    /// Decoded intent, or why it could not be decoded
    pub body: Result<PurchaseIntent, IntentDecodeError>,
}

/// Pending intent as listed for review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedIntent {
    /// Intent
    pub intent: PurchaseIntent,
    /// Deliveries so far
    pub receive_count: u32,
    /// Enqueue time
    pub enqueued_at: DateTime<Utc>,
}

/// Message moved off the main queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Raw message body
    pub body: String,
    /// Deliveries before dead-lettering
    pub receive_count: u32,
    /// Why the message was dead-lettered
    pub reason: String,
    /// Dead-letter time
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Decode the dead-lettered intent, if possible
    ///
    /// # Errors
    /// Returns [`IntentDecodeError`] if the body is not a supported intent
    pub fn intent(&self) -> Result<PurchaseIntent, IntentDecodeError> {
        PurchaseIntent::from_json(self.body.as_bytes())
    }
}

/// Durable review queue
#[async_trait]
pub trait IntentQueue: Send + Sync {
    /// Enqueue an intent
    async fn publish(&self, intent: &PurchaseIntent) -> Result<(), QueueError>;

    /// Receive up to `max` visible messages, hiding them for the visibility timeout
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError>;

    /// Settle a received message; deleting an already deleted message is a no-op
    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;

    /// Move a received message to the dead-letter path
    async fn dead_letter(&self, receipt: &ReceiptHandle, reason: &str) -> Result<(), QueueError>;

    /// Remove every pending intent for a category, returning how many were removed
    async fn purge(&self, category: &CategoryId) -> Result<usize, QueueError>;

    /// Remove a pending intent by token, returning whether it existed
    async fn cancel(&self, token: &IdempotencyToken) -> Result<bool, QueueError>;

    /// Decodable pending intents, oldest first
    async fn list(&self) -> Result<Vec<QueuedIntent>, QueueError>;

    /// Dead-lettered messages
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError>;
}
