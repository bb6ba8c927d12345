//! BrokerTopology / Producer (spec §4.8, §4.9, §6 — the interop surface).
//!
//! Exchange/queue/routing-key names and header names below are bit-exact
//! per spec §6 and must not be renamed without a wire-compatibility break.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, ExchangeKind};
use rand::RngCore;
use uuid::Uuid;

use crate::codec::{self};
use crate::error::PipelineError;
use crate::hmac_auth::HmacSigner;
use crate::model::{EnvelopeHeaders, HmacAlgorithm, RawSignal, RetryHeader, SignedEnvelope};

pub const PRIMARY_EXCHANGE: &str = "iot.xray";
pub const DLX_EXCHANGE: &str = "iot.xray.dlx";

pub const PRIMARY_QUEUE: &str = "xray.raw.v1";
pub const RETRY_QUEUE: &str = "xray.raw.v1.retry";
pub const DLQ_QUEUE: &str = "xray.raw.v1.dlq";

pub const ROUTING_KEY_PRIMARY: &str = "xray.raw.v1";
pub const ROUTING_KEY_RETRY: &str = "xray.raw.v1.retry";
pub const ROUTING_KEY_DLQ: &str = "xray.raw.v1.dlq";
pub const ROUTING_KEY_DEVICE_STATUS: &str = "device.status.v1";

const QUEUE_MESSAGE_TTL_MS: i32 = 3_600_000;

const SERVICE_NAME: &str = "xrayiot-ingest";
const SCHEMA_VERSION: &str = "1";

/// Declares the full topology (spec §4.8/§6): primary exchange + queue
/// (with DLX args pointing at the dead-letter exchange), DLX + its two
/// queues. Idempotent — safe to call on every process start.
pub async fn declare_topology(channel: &Channel) -> Result<(), lapin::Error> {
    channel
        .exchange_declare(
            PRIMARY_EXCHANGE,
            ExchangeKind::Topic,
            ExchangeDeclareOptions { durable: true, ..Default::default() },
            FieldTable::default(),
        )
        .await?;

    channel
        .exchange_declare(
            DLX_EXCHANGE,
            ExchangeKind::Topic,
            ExchangeDeclareOptions { durable: true, ..Default::default() },
            FieldTable::default(),
        )
        .await?;

    let mut primary_args = FieldTable::default();
    primary_args.insert(
        ShortString::from("x-dead-letter-exchange"),
        AMQPValue::LongString(LongString::from(DLX_EXCHANGE)),
    );
    primary_args.insert(
        ShortString::from("x-dead-letter-routing-key"),
        AMQPValue::LongString(LongString::from(ROUTING_KEY_DLQ)),
    );
    primary_args.insert(ShortString::from("x-message-ttl"), AMQPValue::LongInt(QUEUE_MESSAGE_TTL_MS));

    channel
        .queue_declare(PRIMARY_QUEUE, QueueDeclareOptions { durable: true, ..Default::default() }, primary_args)
        .await?;
    channel
        .queue_bind(
            PRIMARY_QUEUE,
            PRIMARY_EXCHANGE,
            ROUTING_KEY_PRIMARY,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    let mut retry_args = FieldTable::default();
    retry_args.insert(
        ShortString::from("x-dead-letter-exchange"),
        AMQPValue::LongString(LongString::from(PRIMARY_EXCHANGE)),
    );
    retry_args.insert(
        ShortString::from("x-dead-letter-routing-key"),
        AMQPValue::LongString(LongString::from(ROUTING_KEY_PRIMARY)),
    );

    channel
        .queue_declare(RETRY_QUEUE, QueueDeclareOptions { durable: true, ..Default::default() }, retry_args)
        .await?;
    channel
        .queue_bind(RETRY_QUEUE, DLX_EXCHANGE, ROUTING_KEY_RETRY, QueueBindOptions::default(), FieldTable::default())
        .await?;

    channel
        .queue_declare(DLQ_QUEUE, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
        .await?;
    channel
        .queue_bind(DLQ_QUEUE, DLX_EXCHANGE, ROUTING_KEY_DLQ, QueueBindOptions::default(), FieldTable::default())
        .await?;

    Ok(())
}

fn hex_nonce(len_bytes: usize) -> String {
    let mut bytes = vec![0u8; len_bytes];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Builds the header table attached to every publish (spec §4.8).
#[allow(clippy::too_many_arguments)]
fn build_headers(
    correlation_id: Uuid,
    device_id: &str,
    hmac_signature: &str,
    auth_timestamp: chrono::DateTime<Utc>,
    nonce: &str,
    algorithm: HmacAlgorithm,
    retry: &RetryHeader,
) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert("x-correlation-id".into(), AMQPValue::LongString(correlation_id.to_string().into()));
    headers.insert("x-timestamp".into(), AMQPValue::LongString(Utc::now().to_rfc3339().into()));
    headers.insert("x-service".into(), AMQPValue::LongString(SERVICE_NAME.into()));
    headers.insert("x-schema-version".into(), AMQPValue::LongString(SCHEMA_VERSION.into()));
    headers.insert("x-device-id".into(), AMQPValue::LongString(device_id.into()));
    headers.insert("x-hmac-signature".into(), AMQPValue::LongString(hmac_signature.into()));
    headers.insert("x-timestamp-auth".into(), AMQPValue::LongString(auth_timestamp.to_rfc3339().into()));
    headers.insert("x-nonce".into(), AMQPValue::LongString(nonce.into()));
    headers.insert("x-algorithm".into(), AMQPValue::LongString(algorithm.as_str().into()));
    headers.insert("x-retry-count".into(), AMQPValue::LongUInt(retry.retry_count));
    if let Some(delay) = retry.retry_delay_ms {
        headers.insert("x-retry-delay".into(), AMQPValue::LongLongInt(delay as i64));
    }
    if let Some(err) = &retry.last_error {
        headers.insert("x-error".into(), AMQPValue::LongString(err.as_str().into()));
    }
    if retry.final_retry {
        headers.insert("x-final-retry".into(), AMQPValue::Boolean(true));
    }
    headers
}

/// The subset of [`Producer`] the consumer's retry/DLQ routing needs
/// (spec §4.10). Split out as a trait so the hot path can be exercised
/// in tests without a live AMQP connection.
#[async_trait::async_trait]
pub trait EnvelopePublisher: Send + Sync {
    async fn publish_retry(&self, envelope: &SignedEnvelope, retry: &RetryHeader) -> Result<(), PipelineError>;
    async fn publish_dlq(&self, envelope: &SignedEnvelope, retry: &RetryHeader) -> Result<(), PipelineError>;
}

/// Validate -> sign -> publish with the header set above (spec §4.9).
/// Safe to call concurrently: every call owns its own correlation id and
/// nonce, and `lapin::Channel` is internally `Clone`/`Send`/`Sync`.
pub struct Producer {
    channel: Channel,
    signer: HmacSigner,
    nonce_length_bytes: usize,
    published: AtomicU64,
}

impl Producer {
    pub fn new(channel: Channel, signer: HmacSigner, nonce_length_bytes: usize) -> Self {
        Self { channel, signer, nonce_length_bytes, published: AtomicU64::new(0) }
    }

    fn build_envelope(&self, signal: &RawSignal) -> Result<SignedEnvelope, PipelineError> {
        codec::validate(signal).map_err(PipelineError::Validation)?;

        let now = Utc::now();
        let nonce = hex_nonce(self.nonce_length_bytes);
        let payload = codec::normalize(signal);
        let signature = self.signer.sign(&signal.device_id, &payload, now, &nonce);

        Ok(SignedEnvelope {
            headers: EnvelopeHeaders {
                correlation_id: Uuid::new_v4(),
                schema_version: SCHEMA_VERSION.to_string(),
                device_id: signal.device_id.clone(),
                hmac_signature: signature,
                auth_timestamp: now,
                nonce,
                algorithm: self.signer.algorithm(),
                retry_count: 0,
            },
            body: signal.clone(),
        })
    }

    async fn publish_envelope(
        &self,
        envelope: &SignedEnvelope,
        exchange: &str,
        routing_key: &str,
        retry: &RetryHeader,
    ) -> Result<(), PipelineError> {
        let body = serde_json::to_vec(&envelope.body).map_err(|e| PipelineError::Transport(e.to_string()))?;
        let headers = build_headers(
            envelope.headers.correlation_id,
            &envelope.headers.device_id,
            &envelope.headers.hmac_signature,
            envelope.headers.auth_timestamp,
            &envelope.headers.nonce,
            envelope.headers.algorithm,
            retry,
        );
        let mut properties = BasicProperties::default().with_headers(headers).with_delivery_mode(2);
        if let Some(delay) = retry.retry_delay_ms {
            properties = properties.with_expiration(ShortString::from(delay.to_string()));
        }

        self.channel
            .basic_publish(exchange, routing_key, BasicPublishOptions::default(), &body, properties)
            .await
            .map_err(|e| PipelineError::Transport(e.to_string()))?
            .await
            .map_err(|e| PipelineError::Transport(e.to_string()))?;

        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn publish(&self, signal: &RawSignal) -> Result<(), PipelineError> {
        let envelope = self.build_envelope(signal)?;
        self.publish_envelope(&envelope, PRIMARY_EXCHANGE, ROUTING_KEY_PRIMARY, &RetryHeader::default()).await
    }

    /// All-or-nothing: if any signal in `signals` fails validation, the
    /// entire batch is rejected without publishing any of it (spec §4.9).
    pub async fn publish_batch(&self, signals: &[RawSignal]) -> Result<(), PipelineError> {
        let envelopes: Vec<SignedEnvelope> =
            signals.iter().map(|s| self.build_envelope(s)).collect::<Result<_, _>>()?;

        for envelope in &envelopes {
            self.publish_envelope(envelope, PRIMARY_EXCHANGE, ROUTING_KEY_PRIMARY, &RetryHeader::default()).await?;
        }
        Ok(())
    }

    pub async fn publish_status(&self, device_id: &str, status: &str, health: Option<&str>) -> Result<(), PipelineError> {
        let now = Utc::now();
        let nonce = hex_nonce(self.nonce_length_bytes);
        let mut body = serde_json::json!({ "deviceId": device_id, "status": status });
        if let Some(health) = health {
            body["health"] = serde_json::Value::String(health.to_string());
        }
        let payload_bytes = serde_json::to_vec(&body).map_err(|e| PipelineError::Transport(e.to_string()))?;
        let signature = self.signer.sign(device_id, &payload_bytes, now, &nonce);

        let headers = build_headers(
            Uuid::new_v4(),
            device_id,
            &signature,
            now,
            &nonce,
            self.signer.algorithm(),
            &RetryHeader::default(),
        );
        let properties = BasicProperties::default().with_headers(headers);

        self.channel
            .basic_publish(PRIMARY_EXCHANGE, ROUTING_KEY_DEVICE_STATUS, BasicPublishOptions::default(), &payload_bytes, properties)
            .await
            .map_err(|e| PipelineError::Transport(e.to_string()))?
            .await
            .map_err(|e| PipelineError::Transport(e.to_string()))?;

        Ok(())
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/// Republishes a DLQ delivery's original body to the retry exchange,
/// reusing its existing header table but overwriting `x-retry-count` /
/// `x-retry-delay` (spec §4.11). [`crate::replayer::DlqReplayer`] forwards
/// already-signed messages pulled off the DLQ, so it never re-signs —
/// only the retry bookkeeping headers change.
pub async fn republish_from_replayer(
    channel: &Channel,
    body: &[u8],
    original_headers: &FieldTable,
    retry: &RetryHeader,
) -> Result<(), PipelineError> {
    let mut headers = FieldTable::default();
    for (key, value) in original_headers.inner() {
        let name = key.as_str();
        if matches!(name, "x-retry-count" | "x-retry-delay" | "x-error" | "x-final-retry") {
            continue;
        }
        headers.insert(key.clone(), value.clone());
    }
    headers.insert("x-retry-count".into(), AMQPValue::LongUInt(retry.retry_count));
    if let Some(delay) = retry.retry_delay_ms {
        headers.insert("x-retry-delay".into(), AMQPValue::LongLongInt(delay as i64));
    }

    let mut properties = BasicProperties::default().with_headers(headers).with_delivery_mode(2);
    if let Some(delay) = retry.retry_delay_ms {
        properties = properties.with_expiration(ShortString::from(delay.to_string()));
    }

    channel
        .basic_publish(DLX_EXCHANGE, ROUTING_KEY_RETRY, BasicPublishOptions::default(), body, properties)
        .await
        .map_err(|e| PipelineError::Transport(e.to_string()))?
        .await
        .map_err(|e| PipelineError::Transport(e.to_string()))?;
    Ok(())
}

#[async_trait::async_trait]
impl EnvelopePublisher for Producer {
    /// Republishes `payload` to the retry exchange with `retry` headers —
    /// the consumer's explicit retry-via-header strategy (spec §4.10).
    async fn publish_retry(&self, envelope: &SignedEnvelope, retry: &RetryHeader) -> Result<(), PipelineError> {
        self.publish_envelope(envelope, DLX_EXCHANGE, ROUTING_KEY_RETRY, retry).await
    }

    async fn publish_dlq(&self, envelope: &SignedEnvelope, retry: &RetryHeader) -> Result<(), PipelineError> {
        self.publish_envelope(envelope, DLX_EXCHANGE, ROUTING_KEY_DLQ, retry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DataPoint;

    fn sample_signal() -> RawSignal {
        RawSignal {
            device_id: "d-01".into(),
            time: 1_735_683_480_000,
            data: vec![DataPoint { timestamp: 762, lat: 51.339764, lon: 12.339223, speed: 1.2 }],
        }
    }

    #[test]
    fn hex_nonce_has_requested_byte_length_in_hex_chars() {
        let nonce = hex_nonce(16);
        assert_eq!(nonce.len(), 32);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn build_headers_includes_retry_only_fields_when_present() {
        let retry = RetryHeader { retry_count: 2, retry_delay_ms: Some(1000), last_error: Some("timeout".into()), final_retry: true };
        let headers = build_headers(Uuid::new_v4(), "d-01", "sig", Utc::now(), "ab12", HmacAlgorithm::Sha256, &retry);
        assert!(headers.inner().contains_key("x-error"));
        assert!(headers.inner().contains_key("x-final-retry"));
        assert!(headers.inner().contains_key("x-retry-delay"));
    }

    #[test]
    fn build_headers_omits_retry_only_fields_on_first_publish() {
        let headers = build_headers(Uuid::new_v4(), "d-01", "sig", Utc::now(), "ab12", HmacAlgorithm::Sha256, &RetryHeader::default());
        assert!(!headers.inner().contains_key("x-error"));
        assert!(!headers.inner().contains_key("x-final-retry"));
    }

    #[test]
    fn invalid_signal_is_rejected_before_any_network_call() {
        // Constructing an envelope for an invalid signal must fail at
        // build_envelope(), never reach the channel. Exercised here
        // without a live broker by calling the pure validation step.
        let mut signal = sample_signal();
        signal.data.clear();
        assert!(codec::validate(&signal).is_err());
    }
}
