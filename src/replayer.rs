//! DLQReplayer (spec §4.11): drains the DLQ, re-publishing messages that
//! still have retry budget left with a computed backoff delay, and
//! leaving exhausted ones parked. Concurrency note from the spec: only
//! one replayer instance should run at a time, since two would
//! double-publish — enforced by callers taking a leader-election lock or
//! a mutex around the backing store, not by this type itself.

use lapin::options::{BasicAckOptions, BasicGetOptions, BasicNackOptions};
use lapin::Channel;
use tracing::{info, warn};

use crate::broker::{self, DLQ_QUEUE};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub replayed: usize,
    pub parked: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DlqStats {
    pub count: usize,
    pub oldest_message_timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

pub struct DlqReplayer {
    channel: Channel,
    max_attempts: u32,
}

impl DlqReplayer {
    pub fn new(channel: Channel, max_attempts: u32) -> Self {
        Self { channel, max_attempts }
    }

    /// Pulls up to `limit` messages from the DLQ. For each: if its retry
    /// count is still under `max_attempts`, republish to the retry
    /// exchange with a computed delay and ack the DLQ copy; otherwise
    /// nack-without-requeue so it remains parked (spec §4.11).
    pub async fn replay(&self, limit: usize) -> Result<ReplayOutcome, lapin::Error> {
        let mut outcome = ReplayOutcome::default();

        for _ in 0..limit {
            let Some(delivery) = self.channel.basic_get(DLQ_QUEUE, BasicGetOptions::default()).await? else {
                break;
            };

            let retry_count = header_u32(&delivery, "x-retry-count").unwrap_or(0);

            if retry_count < self.max_attempts {
                let delay_ms = RetryPolicy::dlq_replay_delay_ms(retry_count);
                let retry_header = crate::model::RetryHeader {
                    retry_count: retry_count + 1,
                    retry_delay_ms: Some(delay_ms),
                    last_error: None,
                    final_retry: false,
                };
                let original_headers = delivery.properties.headers().clone().unwrap_or_default();
                match broker::republish_from_replayer(&self.channel, &delivery.data, &original_headers, &retry_header).await {
                    Ok(()) => {
                        delivery.ack(BasicAckOptions::default()).await?;
                        outcome.replayed += 1;
                    }
                    Err(e) => {
                        warn!(error = %e, "replayer failed to republish, leaving message in DLQ");
                        delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await?;
                    }
                }
            } else {
                info!(retry_count, "message exhausted retry budget, leaving parked in DLQ");
                delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await?;
                outcome.parked += 1;
            }
        }

        Ok(outcome)
    }

    /// Peeks DLQ depth and oldest timestamp without permanently consuming
    /// any message: each peeked delivery is nacked back to the queue.
    pub async fn stats(&self) -> Result<DlqStats, lapin::Error> {
        let mut count = 0usize;
        let mut oldest = None;

        loop {
            let Some(delivery) = self.channel.basic_get(DLQ_QUEUE, BasicGetOptions::default()).await? else {
                break;
            };
            count += 1;
            if let Some(ts) = header_timestamp(&delivery, "x-timestamp") {
                oldest = Some(match oldest {
                    Some(current) if current < ts => current,
                    _ => ts,
                });
            }
            delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await?;
        }

        Ok(DlqStats { count, oldest_message_timestamp: oldest })
    }
}

fn header_u32(delivery: &lapin::message::Delivery, name: &str) -> Option<u32> {
    let headers = delivery.properties.headers().as_ref()?;
    match headers.inner().get(name)? {
        lapin::types::AMQPValue::LongUInt(v) => Some(*v),
        lapin::types::AMQPValue::LongInt(v) => Some(*v as u32),
        _ => None,
    }
}

fn header_timestamp(delivery: &lapin::message::Delivery, name: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    let headers = delivery.properties.headers().as_ref()?;
    match headers.inner().get(name)? {
        lapin::types::AMQPValue::LongString(v) => chrono::DateTime::parse_from_rfc3339(v.as_str()).ok().map(|dt| dt.with_timezone(&chrono::Utc)),
        _ => None,
    }
}
