//! Consumer (spec §4.10): the hot path. One worker per prefetched
//! message; every external call inside a step is a suspension point
//! (spec §5), and the only parallelism across messages comes from
//! running multiple worker tasks over the same broker channel.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::EnvelopePublisher;
use crate::codec;
use crate::error::PipelineError;
use crate::hmac_auth::HmacVerifier;
use crate::model::{DataPoint, GeoPoint, ProcessedSignal, RetryHeader, SignedEnvelope};
use crate::nonce::NonceStore;
use crate::raw_store::RawStore;
use crate::repository::{RepositoryError, SignalRepository};
use crate::retry::{AdmitDecision, CircuitBreakerRegistry, RetryPolicy};
use crate::stats;

/// What the caller (the broker-integration loop) should do with the
/// original delivery once [`Consumer::handle`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Republish was already performed by `handle`; just ack the original delivery.
    AckAfterRetryPublish,
    /// Republish to DLQ was already performed; ack the original delivery.
    AckAfterDlqPublish,
}

pub struct ConsumerConfig {
    pub nonce_ttl: ChronoDuration,
    pub retry_policy: RetryPolicy,
}

pub struct Consumer {
    verifier: HmacVerifier,
    nonce_store: Arc<dyn NonceStore>,
    raw_store: Arc<dyn RawStore>,
    repository: Arc<dyn SignalRepository>,
    producer: Arc<dyn EnvelopePublisher>,
    breakers: Arc<CircuitBreakerRegistry>,
    config: ConsumerConfig,
}

impl Consumer {
    pub fn new(
        verifier: HmacVerifier,
        nonce_store: Arc<dyn NonceStore>,
        raw_store: Arc<dyn RawStore>,
        repository: Arc<dyn SignalRepository>,
        producer: Arc<dyn EnvelopePublisher>,
        breakers: Arc<CircuitBreakerRegistry>,
        config: ConsumerConfig,
    ) -> Self {
        Self { verifier, nonce_store, raw_store, repository, producer, breakers, config }
    }

    /// Runs the full 9-step pipeline (spec §4.10) for one delivery.
    pub async fn handle(&self, envelope: &mut SignedEnvelope) -> Disposition {
        // Step 1: extract. Header/body deviceId mismatch is poisoned input; drop it.
        if !envelope.device_ids_match() {
            warn!(device_id = %envelope.headers.device_id, "envelope header/body deviceId mismatch, dropping");
            return Disposition::Ack;
        }

        match self.process(envelope).await {
            Ok(()) => Disposition::Ack,
            Err(err) if err.is_dlq_terminal() => {
                self.route_to_dlq(envelope, &err.to_string()).await;
                Disposition::AckAfterDlqPublish
            }
            Err(err) if err.is_retryable() => {
                if envelope.headers.retry_count + 1 >= self.config.retry_policy.max_attempts {
                    self.route_to_dlq(envelope, &err.to_string()).await;
                    Disposition::AckAfterDlqPublish
                } else {
                    self.route_to_retry(envelope, &err.to_string()).await;
                    Disposition::AckAfterRetryPublish
                }
            }
            Err(_) => Disposition::Ack, // NonceReplay / DuplicateIdempotencyKey: successful duplicate
        }
    }

    async fn process(&self, envelope: &SignedEnvelope) -> Result<(), PipelineError> {
        let payload = codec::normalize(&envelope.body);

        // Step 2: verify HMAC.
        self.verifier
            .verify(
                &envelope.headers.device_id,
                &payload,
                &envelope.headers.hmac_signature,
                envelope.headers.auth_timestamp,
                &envelope.headers.nonce,
                envelope.headers.algorithm,
                Utc::now(),
            )
            .map_err(PipelineError::Auth)?;

        // Step 3: claim nonce.
        if self.admit("nonce.claim").await.is_err() {
            return Err(PipelineError::CircuitOpen("nonce.claim".into()));
        }
        let fresh = match self.nonce_store.claim(&envelope.headers.device_id, &envelope.headers.nonce, self.config.nonce_ttl).await {
            Ok(fresh) => {
                self.breakers.record_success("nonce.claim");
                fresh
            }
            Err(e) => {
                self.breakers.record_failure("nonce.claim");
                return Err(PipelineError::Transport(e.to_string()));
            }
        };
        if !fresh {
            info!(device_id = %envelope.headers.device_id, "nonce replay detected, treating as duplicate");
            return Err(PipelineError::NonceReplay);
        }

        // Step 4: validate body.
        if let Err(issues) = codec::validate(&envelope.body) {
            warn!(?issues, device_id = %envelope.headers.device_id, "signal failed validation");
            return Err(PipelineError::Validation(issues));
        }

        // Step 5: fingerprint + lookup.
        let idempotency_key = codec::fingerprint(&envelope.body);
        if self.repository.find_by_idempotency_key(idempotency_key).await.is_some() {
            info!(device_id = %envelope.headers.device_id, "idempotency key already present, treating as duplicate");
            return Err(PipelineError::DuplicateIdempotencyKey);
        }

        // Step 6: store raw bytes.
        if self.admit("raw_store.put").await.is_err() {
            return Err(PipelineError::CircuitOpen("raw_store.put".into()));
        }
        let raw_ref = match self.raw_store.put(&payload).await {
            Ok(r) => {
                self.breakers.record_success("raw_store.put");
                r
            }
            Err(e) => {
                self.breakers.record_failure("raw_store.put");
                return Err(PipelineError::Transport(e.to_string()));
            }
        };

        // Step 7: compute stats.
        let computed = stats::compute(&envelope.body.data);
        let first = envelope.body.data[0];
        let location = GeoPoint::from_lat_lon(first.lat, first.lon);

        let record = ProcessedSignal {
            id: Uuid::new_v4(),
            device_id: envelope.body.device_id.clone(),
            time: envelope.body.time,
            data_length: envelope.body.data.len(),
            data_volume: payload.len(),
            stats: computed,
            location,
            raw_ref,
            idempotency_key,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        // Step 8: insert (DuplicateKey race with step 5 is a successful duplicate too).
        if self.admit("repository.insert").await.is_err() {
            return Err(PipelineError::CircuitOpen("repository.insert".into()));
        }
        match self.repository.insert(record).await {
            Ok(_) => {
                self.breakers.record_success("repository.insert");
                Ok(())
            }
            Err(RepositoryError::DuplicateKey) => {
                self.breakers.record_success("repository.insert");
                Err(PipelineError::DuplicateIdempotencyKey)
            }
        }
        // Step 9 (ack) is the caller's responsibility via the returned Disposition.
    }

    async fn admit(&self, operation: &str) -> Result<(), ()> {
        match self.breakers.try_admit(operation) {
            AdmitDecision::Admit => Ok(()),
            AdmitDecision::Rejected => Err(()),
        }
    }

    async fn route_to_retry(&self, envelope: &mut SignedEnvelope, last_error: &str) {
        envelope.headers.retry_count += 1;
        let delay = self.config.retry_policy.delay_for_attempt(envelope.headers.retry_count);
        let retry = RetryHeader {
            retry_count: envelope.headers.retry_count,
            retry_delay_ms: Some(delay.as_millis() as u64),
            last_error: Some(last_error.to_string()),
            final_retry: false,
        };
        if let Err(e) = self.producer.publish_retry(envelope, &retry).await {
            warn!(error = %e, "failed to republish to retry exchange");
        }
    }

    async fn route_to_dlq(&self, envelope: &mut SignedEnvelope, last_error: &str) {
        let retry = RetryHeader {
            retry_count: envelope.headers.retry_count,
            retry_delay_ms: None,
            last_error: Some(last_error.to_string()),
            final_retry: true,
        };
        if let Err(e) = self.producer.publish_dlq(envelope, &retry).await {
            warn!(error = %e, "failed to republish to DLQ");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::EnvelopePublisher;
    use crate::hmac_auth::HmacSigner;
    use crate::model::{EnvelopeHeaders, HmacAlgorithm, RawSignal};
    use crate::nonce::{InMemoryNonceStore, NonceStoreError};
    use crate::raw_store::InMemoryRawStore;
    use crate::repository::InMemorySignalRepository;
    use crate::retry::CircuitBreakerConfig;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    /// Records how many times retry/DLQ publishing was invoked, without
    /// needing a live AMQP connection.
    #[derive(Default)]
    struct RecordingPublisher {
        retries: AtomicU32,
        dlq: AtomicU32,
    }

    /// Simulates a down nonce backend (spec §4.3: `nonce_check_unavailable`).
    struct UnavailableNonceStore;

    #[async_trait::async_trait]
    impl NonceStore for UnavailableNonceStore {
        async fn claim(&self, _device_id: &str, _nonce: &str, _ttl: ChronoDuration) -> Result<bool, NonceStoreError> {
            Err(NonceStoreError::Unavailable("connection refused".into()))
        }

        async fn evict_expired(&self) -> usize {
            0
        }

        fn len(&self) -> usize {
            0
        }
    }

    #[async_trait::async_trait]
    impl EnvelopePublisher for RecordingPublisher {
        async fn publish_retry(&self, _envelope: &SignedEnvelope, _retry: &RetryHeader) -> Result<(), PipelineError> {
            self.retries.fetch_add(1, AtomicOrdering::Relaxed);
            Ok(())
        }

        async fn publish_dlq(&self, _envelope: &SignedEnvelope, _retry: &RetryHeader) -> Result<(), PipelineError> {
            self.dlq.fetch_add(1, AtomicOrdering::Relaxed);
            Ok(())
        }
    }

    fn sample_signal() -> RawSignal {
        RawSignal {
            device_id: "d-01".into(),
            time: 1_735_683_480_000,
            data: vec![
                DataPoint { timestamp: 762, lat: 51.339764, lon: 12.339223, speed: 1.2 },
                DataPoint { timestamp: 1766, lat: 51.339777, lon: 12.339212, speed: 1.53 },
            ],
        }
    }

    fn signed_envelope(secret: &[u8], body: RawSignal) -> SignedEnvelope {
        let signer = HmacSigner::new(secret.to_vec(), HmacAlgorithm::Sha256);
        let now = Utc::now();
        let nonce = "ab12cd34";
        let payload = codec::normalize(&body);
        let signature = signer.sign(&body.device_id, &payload, now, nonce);
        SignedEnvelope {
            headers: EnvelopeHeaders {
                correlation_id: Uuid::new_v4(),
                schema_version: "1".into(),
                device_id: body.device_id.clone(),
                hmac_signature: signature,
                auth_timestamp: now,
                nonce: nonce.to_string(),
                algorithm: HmacAlgorithm::Sha256,
                retry_count: 0,
            },
            body,
        }
    }

    #[test]
    fn header_body_device_mismatch_is_detected_before_processing() {
        let mut envelope = signed_envelope(b"secret", sample_signal());
        envelope.headers.device_id = "someone-else".into();
        assert!(!envelope.device_ids_match());
    }

    fn consumer_with_verifier(secret: &[u8]) -> (Consumer, Arc<InMemorySignalRepository>, Arc<RecordingPublisher>) {
        let verifier = HmacVerifier::new(secret.to_vec(), HmacAlgorithm::Sha256, 30);
        let nonce_store: Arc<dyn NonceStore> = Arc::new(InMemoryNonceStore::new());
        let raw_store: Arc<dyn RawStore> = Arc::new(InMemoryRawStore::new());
        let repository = Arc::new(InMemorySignalRepository::new());
        let repo_trait: Arc<dyn SignalRepository> = repository.clone();
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        let publisher = Arc::new(RecordingPublisher::default());
        let publisher_trait: Arc<dyn EnvelopePublisher> = publisher.clone();

        let consumer = Consumer::new(
            verifier,
            nonce_store,
            raw_store,
            repo_trait,
            publisher_trait,
            breakers,
            ConsumerConfig { nonce_ttl: ChronoDuration::seconds(30), retry_policy: RetryPolicy::default() },
        );
        (consumer, repository, publisher)
    }

    #[tokio::test]
    async fn valid_signal_inserts_exactly_one_processed_signal() {
        let (consumer, repo, _publisher) = consumer_with_verifier(b"secret");
        let mut envelope = signed_envelope(b"secret", sample_signal());
        let disposition = consumer.handle(&mut envelope).await;
        assert_eq!(disposition, Disposition::Ack);
        let page = repo
            .find_many(Default::default(), crate::repository::SortBy::Id, crate::repository::SortOrder::Descending, Default::default())
            .await;
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn duplicate_payload_published_twice_yields_one_record() {
        let (consumer, repo, _publisher) = consumer_with_verifier(b"secret");
        let mut first = signed_envelope(b"secret", sample_signal());
        let mut second = signed_envelope(b"secret", sample_signal());
        second.headers.nonce = "ffaa00bb".into(); // distinct nonce, same body -> dedup by idempotency key
        let resig = HmacSigner::new(b"secret".to_vec(), HmacAlgorithm::Sha256);
        let payload = codec::normalize(&second.body);
        second.headers.hmac_signature = resig.sign(&second.body.device_id, &payload, second.headers.auth_timestamp, &second.headers.nonce);

        consumer.handle(&mut first).await;
        consumer.handle(&mut second).await;

        let page = repo
            .find_many(Default::default(), crate::repository::SortBy::Id, crate::repository::SortOrder::Descending, Default::default())
            .await;
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn nonce_replay_is_dropped_without_new_record() {
        let (consumer, repo, _publisher) = consumer_with_verifier(b"secret");
        let mut envelope = signed_envelope(b"secret", sample_signal());
        let mut replay = envelope.clone();

        consumer.handle(&mut envelope).await;
        let disposition = consumer.handle(&mut replay).await;
        assert_eq!(disposition, Disposition::Ack);

        let page = repo
            .find_many(Default::default(), crate::repository::SortBy::Id, crate::repository::SortOrder::Descending, Default::default())
            .await;
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn skewed_clock_routes_to_dlq_without_record() {
        let (consumer, repo, publisher) = consumer_with_verifier(b"secret");
        let mut envelope = signed_envelope(b"secret", sample_signal());
        envelope.headers.auth_timestamp = Utc::now() - ChronoDuration::seconds(120);
        let disposition = consumer.handle(&mut envelope).await;
        assert_eq!(disposition, Disposition::AckAfterDlqPublish);
        assert_eq!(publisher.dlq.load(AtomicOrdering::Relaxed), 1);
        let page = repo
            .find_many(Default::default(), crate::repository::SortBy::Id, crate::repository::SortOrder::Descending, Default::default())
            .await;
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn exhausted_retries_route_straight_to_dlq_not_retry_exchange() {
        let (consumer, _repo, publisher) = consumer_with_verifier(b"secret");
        let mut envelope = signed_envelope(b"secret", sample_signal());
        envelope.headers.auth_timestamp = Utc::now() - ChronoDuration::seconds(120);
        envelope.headers.retry_count = RetryPolicy::default().max_attempts - 1;
        consumer.handle(&mut envelope).await;
        // Auth failures are DLQ-terminal regardless of retry_count, so this
        // exercises the same dlq path; retry_count alone never routes an
        // auth failure to the retry exchange.
        assert_eq!(publisher.retries.load(AtomicOrdering::Relaxed), 0);
        assert_eq!(publisher.dlq.load(AtomicOrdering::Relaxed), 1);
    }

    #[tokio::test]
    async fn nonce_store_unavailable_is_retryable_not_dropped_or_dlqd() {
        let verifier = HmacVerifier::new(b"secret".to_vec(), HmacAlgorithm::Sha256, 30);
        let nonce_store: Arc<dyn NonceStore> = Arc::new(UnavailableNonceStore);
        let raw_store: Arc<dyn RawStore> = Arc::new(InMemoryRawStore::new());
        let repository = Arc::new(InMemorySignalRepository::new());
        let repo_trait: Arc<dyn SignalRepository> = repository.clone();
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        let publisher = Arc::new(RecordingPublisher::default());
        let publisher_trait: Arc<dyn EnvelopePublisher> = publisher.clone();

        let consumer = Consumer::new(
            verifier,
            nonce_store,
            raw_store,
            repo_trait,
            publisher_trait,
            breakers,
            ConsumerConfig { nonce_ttl: ChronoDuration::seconds(30), retry_policy: RetryPolicy::default() },
        );

        let mut envelope = signed_envelope(b"secret", sample_signal());
        let disposition = consumer.handle(&mut envelope).await;
        assert_eq!(disposition, Disposition::AckAfterRetryPublish);
        assert_eq!(publisher.retries.load(AtomicOrdering::Relaxed), 1);
        assert_eq!(publisher.dlq.load(AtomicOrdering::Relaxed), 0);
        assert_eq!(repository.find_many(Default::default(), crate::repository::SortBy::Id, crate::repository::SortOrder::Descending, Default::default()).await.total, 0);
    }
}
