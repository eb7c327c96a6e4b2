//! Directory-backed queue
//!
//! Layout:
//! ```text
//! <root>/pending/<token>.json       one envelope per pending intent
//! <root>/dead-letter/<token>.json   one dead-letter record per message
//! ```
//!
//! Envelopes are rewritten through a temporary file and a rename, so a crash
//! never leaves a half-written envelope behind. Every mutation holds
//! `<root>/.lock`, so processes sharing the directory never receive the same
//! message twice within its visibility timeout.

use super::{DeadLetter, Delivery, IntentQueue, QueuedIntent, ReceiptHandle, DEFAULT_VISIBILITY_TIMEOUT};
use crate::error::QueueError;
use crate::lockfile::LockFile;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spa_model::{CategoryId, IdempotencyToken, PurchaseIntent};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;

const PENDING_DIR: &str = "pending";
const DEAD_LETTER_DIR: &str = "dead-letter";
const LOCK_FILE: &str = ".lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    body: String,
    receive_count: u32,
    enqueued_at: DateTime<Utc>,
    #[serde(default)]
    invisible_until: Option<DateTime<Utc>>,
}

impl Envelope {
    fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.invisible_until.map_or(true, |until| until <= now)
    }
}

/// Queue persisted as JSON files under a root directory
#[derive(Debug)]
pub struct FileQueue {
    root: PathBuf,
    visibility_timeout: chrono::Duration,
    // Serialises read-modify-write cycles within this process; the lock file
    // extends that to other processes
    write_guard: Mutex<()>,
}

impl FileQueue {
    /// Open (creating if needed) a queue rooted at `root`
    ///
    /// # Errors
    /// Returns [`QueueError::Io`] if the directories cannot be created
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(PENDING_DIR)).await?;
        tokio::fs::create_dir_all(root.join(DEAD_LETTER_DIR)).await?;
        Ok(Self {
            root,
            visibility_timeout: to_chrono(DEFAULT_VISIBILITY_TIMEOUT),
            write_guard: Mutex::new(()),
        })
    }

    /// With visibility timeout
    #[inline]
    #[must_use]
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = to_chrono(timeout);
        self
    }

    /// Root directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pending_path(&self, stem: &str) -> PathBuf {
        self.root.join(PENDING_DIR).join(format!("{stem}.json"))
    }

    fn dead_letter_path(&self, stem: &str) -> PathBuf {
        self.root.join(DEAD_LETTER_DIR).join(format!("{stem}.json"))
    }

    async fn pending(&self) -> Result<Vec<(String, Envelope)>, QueueError> {
        let mut entries = Vec::new();
        for (stem, bytes) in read_json_files(&self.root.join(PENDING_DIR)).await? {
            match serde_json::from_slice::<Envelope>(&bytes) {
                Ok(envelope) => entries.push((stem, envelope)),
                Err(e) => tracing::warn!(file = %stem, error = %e, "skipping unreadable envelope"),
            }
        }
        entries.sort_by(|a, b| a.1.enqueued_at.cmp(&b.1.enqueued_at).then_with(|| a.0.cmp(&b.0)));
        Ok(entries)
    }

    async fn lock(&self) -> Result<LockFile, QueueError> {
        Ok(LockFile::acquire(self.root.join(LOCK_FILE)).await?)
    }

    async fn read_envelope(&self, stem: &str) -> Result<Option<Envelope>, QueueError> {
        match tokio::fs::read(self.pending_path(stem)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl IntentQueue for FileQueue {
    async fn publish(&self, intent: &PurchaseIntent) -> Result<(), QueueError> {
        let stem = intent.idempotency_token.as_str();
        if !is_safe_stem(stem) {
            return Err(QueueError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("token {stem:?} cannot name a queue file"),
            )));
        }
        let _guard = self.write_guard.lock().await;
        let _lock = self.lock().await?;
        if self.read_envelope(stem).await?.is_some() {
            tracing::debug!(token = intent.idempotency_token.short(), "intent already queued");
            return Ok(());
        }
        let envelope = Envelope {
            body: String::from_utf8_lossy(&intent.to_json()?).into_owned(),
            receive_count: 0,
            enqueued_at: Utc::now(),
            invisible_until: None,
        };
        write_atomic(&self.pending_path(stem), &serde_json::to_vec_pretty(&envelope)?).await
    }

    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let _guard = self.write_guard.lock().await;
        let _lock = self.lock().await?;
        let now = Utc::now();
        let mut deliveries = Vec::new();
        for (stem, mut envelope) in self.pending().await? {
            if deliveries.len() >= max {
                break;
            }
            if !envelope.is_visible(now) {
                continue;
            }
            envelope.receive_count += 1;
            envelope.invisible_until = Some(now + self.visibility_timeout);
            write_atomic(&self.pending_path(&stem), &serde_json::to_vec_pretty(&envelope)?).await?;
            deliveries.push(Delivery {
                receipt: ReceiptHandle::new(stem),
                receive_count: envelope.receive_count,
                body: PurchaseIntent::from_json(envelope.body.as_bytes()),
            });
        }
        Ok(deliveries)
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        if !is_safe_stem(receipt.as_str()) {
            return Ok(());
        }
        let _guard = self.write_guard.lock().await;
        let _lock = self.lock().await?;
        remove_if_present(&self.pending_path(receipt.as_str())).await?;
        Ok(())
    }

    async fn dead_letter(&self, receipt: &ReceiptHandle, reason: &str) -> Result<(), QueueError> {
        let stem = receipt.as_str();
        if !is_safe_stem(stem) {
            return Ok(());
        }
        let _guard = self.write_guard.lock().await;
        let _lock = self.lock().await?;
        let Some(envelope) = self.read_envelope(stem).await? else {
            return Ok(());
        };
        let record = DeadLetter {
            body: envelope.body,
            receive_count: envelope.receive_count,
            reason: reason.to_string(),
            dead_lettered_at: Utc::now(),
        };
        write_atomic(&self.dead_letter_path(stem), &serde_json::to_vec_pretty(&record)?).await?;
        remove_if_present(&self.pending_path(stem)).await?;
        Ok(())
    }

    async fn purge(&self, category: &CategoryId) -> Result<usize, QueueError> {
        let _guard = self.write_guard.lock().await;
        let _lock = self.lock().await?;
        let mut removed = 0;
        for (stem, envelope) in self.pending().await? {
            let matches = PurchaseIntent::from_json(envelope.body.as_bytes())
                .is_ok_and(|intent| &intent.category_id == category);
            if matches && remove_if_present(&self.pending_path(&stem)).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn cancel(&self, token: &IdempotencyToken) -> Result<bool, QueueError> {
        if !is_safe_stem(token.as_str()) {
            return Ok(false);
        }
        let _guard = self.write_guard.lock().await;
        let _lock = self.lock().await?;
        remove_if_present(&self.pending_path(token.as_str())).await
    }

    async fn list(&self) -> Result<Vec<QueuedIntent>, QueueError> {
        Ok(self
            .pending()
            .await?
            .into_iter()
            .filter_map(|(_, envelope)| {
                let intent = PurchaseIntent::from_json(envelope.body.as_bytes()).ok()?;
                Some(QueuedIntent {
                    intent,
                    receive_count: envelope.receive_count,
                    enqueued_at: envelope.enqueued_at,
                })
            })
            .collect())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        let mut records = Vec::new();
        for (_, bytes) in read_json_files(&self.root.join(DEAD_LETTER_DIR)).await? {
            records.push(serde_json::from_slice::<DeadLetter>(&bytes)?);
        }
        records.sort_by(|a, b| a.dead_lettered_at.cmp(&b.dead_lettered_at));
        Ok(records)
    }
}

/// Timeouts beyond chrono's range are capped at a year
fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration)
        .unwrap_or_else(|_| chrono::Duration::days(365))
        .min(chrono::Duration::days(365))
}

/// Tokens and receipts are hex; anything else never names a queue file
fn is_safe_stem(stem: &str) -> bool {
    !stem.is_empty() && stem.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

async fn read_json_files(dir: &Path) -> Result<Vec<(String, Vec<u8>)>, QueueError> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => files.push((stem, bytes)),
            // Deleted between listing and reading
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(files)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), QueueError> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_present(path: &Path) -> Result<bool, QueueError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
