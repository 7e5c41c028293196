use std::sync::Arc;

use anyhow::Result;
use futures_util::{stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::errors::WireResult;
use crate::feed_actor::FeedActors;
use crate::model::{FeedEntry, FeedSource};
use crate::queue::{Delivery, FanoutMessage, Queue};
use crate::user_actor::UserActors;

/// Per-delivery result: how many timelines were attempted and which of them
/// still need the event.
struct DeliveryOutcome {
    attempted: usize,
    failed: Vec<String>,
}

/// Consumes fan-out messages and distributes post events into follower
/// timelines. Entry adds and removals are idempotent, so at-least-once
/// delivery with retries is safe.
pub struct FanoutWorker {
    queue: Arc<dyn Queue>,
    users: UserActors,
    feeds: FeedActors,
    batch_size: usize,
    concurrency: usize,
    poll_interval: chrono::Duration,
    cancellation_token: CancellationToken,
}

impl FanoutWorker {
    pub fn new(
        queue: Arc<dyn Queue>,
        users: UserActors,
        feeds: FeedActors,
        batch_size: usize,
        concurrency: usize,
        poll_interval: chrono::Duration,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            queue,
            users,
            feeds,
            batch_size,
            concurrency: concurrency.max(1),
            poll_interval,
            cancellation_token,
        }
    }

    pub async fn run_background(&self) -> Result<()> {
        tracing::debug!("FanoutWorker started");

        let interval = self.poll_interval.to_std()?;
        let sleeper = tokio::time::sleep(interval);
        tokio::pin!(sleeper);

        loop {
            tokio::select! {
                () = self.cancellation_token.cancelled() => {
                    break;
                },
                () = &mut sleeper => {
                    match self.drain().await {
                        Ok(processed) if processed > 0 => {
                            tracing::debug!(processed, "fan-out batch complete");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::error!("FanoutWorker task failed: {}", err);
                        }
                    }
                    sleeper.as_mut().reset(tokio::time::Instant::now() + interval);
                }
            }
        }

        tracing::debug!("FanoutWorker stopped");
        Ok(())
    }

    /// Process batches until the queue runs dry. Returns how many messages
    /// were settled (acked outright or replaced by a tail message).
    pub async fn drain(&self) -> WireResult<usize> {
        let mut processed = 0;
        loop {
            let batch = self.queue.receive(self.batch_size).await?;
            if batch.is_empty() {
                return Ok(processed);
            }
            for delivery in batch {
                if self.process(&delivery).await? {
                    processed += 1;
                }
            }
        }
    }

    /// Settle one delivery. A clean run acks. A partial failure acks the
    /// original and re-enqueues only the unprocessed tail, so timelines
    /// that already took the event are not redone on the next attempt. Only
    /// when nothing at all succeeded does the message go back whole, via
    /// the queue's backoff.
    pub(crate) async fn process(&self, delivery: &Delivery) -> WireResult<bool> {
        let outcome = match self.deliver(&delivery.message).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(
                    attempts = delivery.attempts,
                    error = ?err,
                    "fan-out target enumeration failed, scheduling redelivery"
                );
                self.queue.retry(delivery).await?;
                return Ok(false);
            }
        };

        if outcome.failed.is_empty() {
            self.queue.ack(delivery).await?;
            return Ok(true);
        }

        if outcome.failed.len() == outcome.attempted {
            tracing::warn!(
                attempts = delivery.attempts,
                failed = outcome.failed.len(),
                "fan-out made no progress, scheduling redelivery"
            );
            self.queue.retry(delivery).await?;
            return Ok(false);
        }

        tracing::warn!(
            failed = outcome.failed.len(),
            attempted = outcome.attempted,
            "fan-out partially failed, re-enqueueing unprocessed tail"
        );
        self.queue
            .send(&delivery.message.with_targets(outcome.failed))
            .await?;
        self.queue.ack(delivery).await?;
        Ok(true)
    }

    async fn deliver(&self, message: &FanoutMessage) -> WireResult<DeliveryOutcome> {
        match message {
            FanoutMessage::NewPost {
                post_id,
                author_id,
                timestamp,
                targets,
            } => {
                let targets = match targets {
                    Some(targets) => targets.clone(),
                    None => self.users.followers(author_id).await?.into_iter().collect(),
                };
                let entry = FeedEntry {
                    post_id: post_id.clone(),
                    author_id: author_id.clone(),
                    timestamp: *timestamp,
                    source: FeedSource::Follow,
                };

                let attempted = targets.len();
                let failed: Vec<String> = stream::iter(targets)
                    .map(|target| {
                        let feeds = self.feeds.clone();
                        let entry = entry.clone();
                        async move {
                            let result = feeds.add_entry(&target, entry).await;
                            (target, result.is_err())
                        }
                    })
                    .buffer_unordered(self.concurrency)
                    .filter_map(|(target, failed)| {
                        futures_util::future::ready(failed.then_some(target))
                    })
                    .collect()
                    .await;

                Ok(DeliveryOutcome { attempted, failed })
            }
            FanoutMessage::DeletePost {
                post_id,
                author_id,
                targets,
            } => {
                let targets = match targets {
                    Some(targets) => targets.clone(),
                    None => {
                        let mut followers = self.users.followers(author_id).await?;
                        followers.insert(author_id.clone());
                        followers.into_iter().collect()
                    }
                };

                let attempted = targets.len();
                let failed: Vec<String> = stream::iter(targets)
                    .map(|target| {
                        let feeds = self.feeds.clone();
                        let post_id = post_id.clone();
                        async move {
                            let result = feeds.remove_entry(&target, &post_id).await;
                            (target, result.is_err())
                        }
                    })
                    .buffer_unordered(self.concurrency)
                    .filter_map(|(target, failed)| {
                        futures_util::future::ready(failed.then_some(target))
                    })
                    .collect()
                    .await;

                Ok(DeliveryOutcome { attempted, failed })
            }
        }
    }
}
