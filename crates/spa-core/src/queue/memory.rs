//! In-process queue
//!
//! Visibility is tracked on the tokio clock so paused-time tests can step
//! through timeouts deterministically.

use super::{DeadLetter, Delivery, IntentQueue, QueuedIntent, ReceiptHandle, DEFAULT_VISIBILITY_TIMEOUT};
use crate::error::QueueError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use spa_model::{CategoryId, IdempotencyToken, PurchaseIntent};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Message {
    id: u64,
    body: String,
    category: Option<CategoryId>,
    token: Option<IdempotencyToken>,
    receive_count: u32,
    enqueued_at: DateTime<Utc>,
    invisible_until: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    messages: Vec<Message>,
    dead: Vec<DeadLetter>,
}

impl State {
    fn take(&mut self, receipt: &ReceiptHandle) -> Option<Message> {
        let id: u64 = receipt.as_str().parse().ok()?;
        let index = self.messages.iter().position(|m| m.id == id)?;
        Some(self.messages.remove(index))
    }
}

/// Queue held in process memory
#[derive(Debug)]
pub struct InMemoryQueue {
    visibility_timeout: Duration,
    state: Mutex<State>,
}

impl InMemoryQueue {
    /// Create an empty queue with the default visibility timeout
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    /// Create an empty queue
    #[inline]
    #[must_use]
    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            visibility_timeout,
            state: Mutex::new(State::default()),
        }
    }

    /// Enqueue a raw body without decoding it
    pub fn publish_raw(&self, body: impl Into<String>) {
        let body = body.into();
        let decoded = PurchaseIntent::from_json(body.as_bytes()).ok();
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.messages.push(Message {
            id,
            category: decoded.as_ref().map(|i| i.category_id.clone()),
            token: decoded.map(|i| i.idempotency_token),
            body,
            receive_count: 0,
            enqueued_at: Utc::now(),
            invisible_until: None,
        });
    }

    /// Messages on the main queue, in flight or not
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    /// Check if the main queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages currently hidden by a visibility timeout
    #[must_use]
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .messages
            .iter()
            .filter(|m| m.invisible_until.is_some_and(|until| until > now))
            .count()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IntentQueue for InMemoryQueue {
    async fn publish(&self, intent: &PurchaseIntent) -> Result<(), QueueError> {
        let body = String::from_utf8_lossy(&intent.to_json()?).into_owned();
        self.publish_raw(body);
        Ok(())
    }

    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let now = Instant::now();
        let hidden_until = now + self.visibility_timeout;
        let mut state = self.state.lock();
        let deliveries = state
            .messages
            .iter_mut()
            .filter(|m| m.invisible_until.map_or(true, |until| until <= now))
            .take(max)
            .map(|m| {
                m.receive_count += 1;
                m.invisible_until = Some(hidden_until);
                Delivery {
                    receipt: ReceiptHandle::new(m.id.to_string()),
                    receive_count: m.receive_count,
                    body: PurchaseIntent::from_json(m.body.as_bytes()),
                }
            })
            .collect();
        Ok(deliveries)
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.state.lock().take(receipt);
        Ok(())
    }

    async fn dead_letter(&self, receipt: &ReceiptHandle, reason: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if let Some(message) = state.take(receipt) {
            state.dead.push(DeadLetter {
                body: message.body,
                receive_count: message.receive_count,
                reason: reason.to_string(),
                dead_lettered_at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn purge(&self, category: &CategoryId) -> Result<usize, QueueError> {
        let mut state = self.state.lock();
        let before = state.messages.len();
        state.messages.retain(|m| m.category.as_ref() != Some(category));
        Ok(before - state.messages.len())
    }

    async fn cancel(&self, token: &IdempotencyToken) -> Result<bool, QueueError> {
        let mut state = self.state.lock();
        let before = state.messages.len();
        state.messages.retain(|m| m.token.as_ref() != Some(token));
        Ok(state.messages.len() < before)
    }

    async fn list(&self) -> Result<Vec<QueuedIntent>, QueueError> {
        let state = self.state.lock();
        Ok(state
            .messages
            .iter()
            .filter_map(|m| {
                let intent = PurchaseIntent::from_json(m.body.as_bytes()).ok()?;
                Some(QueuedIntent {
                    intent,
                    receive_count: m.receive_count,
                    enqueued_at: m.enqueued_at,
                })
            })
            .collect())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        Ok(self.state.lock().dead.clone())
    }
}
