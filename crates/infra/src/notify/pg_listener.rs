//! Postgres LISTEN/NOTIFY-backed notification bus.
//!
//! NOTIFY is not durable: a notification sent while a listener is
//! reconnecting is lost. Workers poll as a fallback, so a lost wake-up only
//! costs latency.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use listingsync_events::{JobNotification, NotificationBus, NotificationError, Subscription};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("postgres notify error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Payload(#[from] NotificationError),
}

/// Publishes and subscribes to job notifications on one Postgres channel.
#[derive(Debug, Clone)]
pub struct PgNotificationBus {
    pool: PgPool,
    channel: String,
}

impl PgNotificationBus {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl NotificationBus<JobNotification> for PgNotificationBus {
    type Error = NotifyError;

    async fn publish(&self, message: JobNotification) -> Result<(), Self::Error> {
        let payload = message.to_payload()?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription<JobNotification>, Self::Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;
        debug!(channel = %self.channel, "listening for job notifications");

        let (tx, rx) = mpsc::unbounded_channel();
        let channel = self.channel.clone();

        // Forward until the subscriber goes away or the listener fails for good.
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = tx.closed() => break,
                    received = listener.try_recv() => received,
                };
                match received {
                    Ok(Some(notification)) => {
                        match JobNotification::from_payload(notification.payload()) {
                            Ok(message) => {
                                if tx.send(message).is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(channel = %channel, error = %err, "ignoring malformed notification");
                            }
                        }
                    }
                    // Connection dropped; sqlx reconnects on the next call.
                    Ok(None) => {
                        debug!(channel = %channel, "notification listener reconnecting");
                    }
                    Err(err) => {
                        warn!(channel = %channel, error = %err, "notification listener failed");
                        break;
                    }
                }
            }
        });

        Ok(Subscription::new(rx))
    }
}
