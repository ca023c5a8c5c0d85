//! Self-throttling delivery of queued notifications.
//!
//! A drain handles one bounded batch. When the batch was full it cools down
//! and pushes a trigger for the next batch, so a backlog is worked through by
//! a chain of short drains rather than a long-lived worker.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::error::{DeliveryError, StoreError};
use crate::models::Email;
use crate::notify::{NotificationQueue, QueuedEmail};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DrainSettings {
    pub batch_size: usize,
    pub send_delay_ms: u64,
    pub cooldown_ms: u64,
    /// Deliveries attempted before a job is dropped.
    pub max_deliveries: u32,
    pub visibility_ms: u64,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            batch_size: 20,
            send_delay_ms: 2_500,
            cooldown_ms: 60_000,
            max_deliveries: 5,
            visibility_ms: 2_500,
        }
    }
}

impl DrainSettings {
    #[cfg(test)]
    pub fn immediate() -> Self {
        Self {
            send_delay_ms: 0,
            cooldown_ms: 0,
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, sender: &str, email: &Email) -> Result<(), DeliveryError>;
}

/// Writes each message as JSON into a directory picked up by the SMTP relay.
pub struct OutboxTransport {
    dir: PathBuf,
}

impl OutboxTransport {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboxMessage<'a> {
    from: &'a str,
    #[serde(flatten)]
    email: &'a Email,
}

#[async_trait]
impl MailTransport for OutboxTransport {
    async fn send(&self, sender: &str, email: &Email) -> Result<(), DeliveryError> {
        if email.to.trim().is_empty() {
            return Err(DeliveryError::Transport("message has no recipient".to_string()));
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        let message = OutboxMessage { from: sender, email };
        let body = serde_json::to_vec_pretty(&message)?;
        let path = self.dir.join(format!("{}.json", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, body).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another drain holds the gate.
    Busy,
    /// The queue ran dry within the batch.
    Drained { processed: usize },
    /// A full batch was processed and a follow-up trigger was queued.
    Chained { processed: usize },
}

pub struct Drain<'a> {
    queue: &'a dyn NotificationQueue,
    transport: &'a dyn MailTransport,
    gate: &'a Semaphore,
    settings: DrainSettings,
    sender: &'a str,
}

impl<'a> Drain<'a> {
    /// `gate` must be a single-permit semaphore shared by all drains.
    pub fn new(
        queue: &'a dyn NotificationQueue,
        transport: &'a dyn MailTransport,
        gate: &'a Semaphore,
        settings: DrainSettings,
        sender: &'a str,
    ) -> Self {
        Self {
            queue,
            transport,
            gate,
            settings,
            sender,
        }
    }

    pub async fn run(&self) -> Result<DrainOutcome, StoreError> {
        let Ok(permit) = self.gate.try_acquire() else {
            info!("chained email drain already in progress");
            return Ok(DrainOutcome::Busy);
        };

        let visibility = Duration::from_millis(self.settings.visibility_ms);
        let mut processed = 0;
        while processed < self.settings.batch_size {
            let Some(job) = self.queue.dequeue(visibility).await? else {
                break;
            };
            self.deliver(&job).await?;
            processed += 1;
            tokio::time::sleep(Duration::from_millis(self.settings.send_delay_ms)).await;
        }
        info!(processed, "email drain finished batch");

        if processed < self.settings.batch_size {
            return Ok(DrainOutcome::Drained { processed });
        }

        tokio::time::sleep(Duration::from_millis(self.settings.cooldown_ms)).await;
        drop(permit);
        self.queue.push_trigger().await?;
        Ok(DrainOutcome::Chained { processed })
    }

    async fn deliver(&self, job: &QueuedEmail) -> Result<(), StoreError> {
        let result = match serde_json::from_str::<Email>(&job.payload) {
            Ok(email) => self
                .transport
                .send(self.sender, &email)
                .await
                .map(|()| email.to),
            Err(err) => Err(DeliveryError::Payload(err)),
        };
        match result {
            Ok(to) => {
                self.queue.complete(job).await?;
                info!(%to, "email sent");
            }
            Err(err) => {
                error!(job = job.id, attempts = job.dequeue_count, error = %err, "failed to send email");
                if job.dequeue_count >= self.settings.max_deliveries {
                    warn!(job = job.id, "dropping email after repeated failures");
                    self.queue.complete(job).await?;
                }
            }
        }
        Ok(())
    }
}
