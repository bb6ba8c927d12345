//! HmacSigner / HmacVerifier (spec §4.2).
//!
//! `payload` fed into the signature base string is itself `HMAC(secret,
//! raw_bytes)`, so the base string has a fixed, safe-to-concatenate shape:
//! `algorithm=…&deviceId=…&nonce=…&payload=<hashHex>&timestamp=…`.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};

use crate::error::AuthFailure;
use crate::model::HmacAlgorithm;

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

fn mac_hex(algorithm: HmacAlgorithm, secret: &[u8], data: &[u8]) -> String {
    match algorithm {
        HmacAlgorithm::Sha256 => {
            let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key size");
            mac.update(data);
            hex::encode(mac.finalize().into_bytes())
        }
        HmacAlgorithm::Sha512 => {
            let mut mac = HmacSha512::new_from_slice(secret).expect("HMAC accepts any key size");
            mac.update(data);
            hex::encode(mac.finalize().into_bytes())
        }
    }
}

fn verify_mac_hex(algorithm: HmacAlgorithm, secret: &[u8], data: &[u8], expected_hex: &str) -> bool {
    let Ok(expected) = hex::decode(expected_hex) else { return false };
    match algorithm {
        HmacAlgorithm::Sha256 => {
            let Ok(mut mac) = HmacSha256::new_from_slice(secret) else { return false };
            mac.update(data);
            mac.verify_slice(&expected).is_ok()
        }
        HmacAlgorithm::Sha512 => {
            let Ok(mut mac) = HmacSha512::new_from_slice(secret) else { return false };
            mac.update(data);
            mac.verify_slice(&expected).is_ok()
        }
    }
}

fn canonical_params(
    algorithm: HmacAlgorithm,
    device_id: &str,
    nonce: &str,
    payload_hash_hex: &str,
    timestamp: DateTime<Utc>,
) -> String {
    // Keys are already in sorted order: algorithm, deviceId, nonce, payload, timestamp.
    format!(
        "algorithm={}&deviceId={}&nonce={}&payload={}&timestamp={}",
        algorithm.as_str(),
        device_id,
        nonce,
        payload_hash_hex,
        timestamp.to_rfc3339(),
    )
}

#[derive(Debug, Clone)]
pub struct HmacSigner {
    secret: Vec<u8>,
    algorithm: HmacAlgorithm,
}

impl HmacSigner {
    pub fn new(secret: impl Into<Vec<u8>>, algorithm: HmacAlgorithm) -> Self {
        Self { secret: secret.into(), algorithm }
    }

    /// `payload` is the raw RawSignal bytes; `sign` hashes it under the
    /// same secret before building the signature base string.
    pub fn sign(&self, device_id: &str, payload: &[u8], timestamp: DateTime<Utc>, nonce: &str) -> String {
        let payload_hash_hex = mac_hex(self.algorithm, &self.secret, payload);
        let base = canonical_params(self.algorithm, device_id, nonce, &payload_hash_hex, timestamp);
        mac_hex(self.algorithm, &self.secret, base.as_bytes())
    }

    pub fn algorithm(&self) -> HmacAlgorithm {
        self.algorithm
    }
}

#[derive(Debug, Clone)]
pub struct HmacVerifier {
    secret: Vec<u8>,
    expected_algorithm: HmacAlgorithm,
    timestamp_tolerance: chrono::Duration,
}

impl HmacVerifier {
    pub fn new(secret: impl Into<Vec<u8>>, expected_algorithm: HmacAlgorithm, timestamp_tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            expected_algorithm,
            timestamp_tolerance: chrono::Duration::seconds(timestamp_tolerance_secs),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn verify(
        &self,
        device_id: &str,
        payload: &[u8],
        signature: &str,
        timestamp: DateTime<Utc>,
        nonce: &str,
        algorithm: HmacAlgorithm,
        now: DateTime<Utc>,
    ) -> Result<(), AuthFailure> {
        if algorithm != self.expected_algorithm {
            return Err(AuthFailure::AlgorithmMismatch);
        }

        if !nonce.chars().all(|c| c.is_ascii_hexdigit()) || nonce.is_empty() {
            return Err(AuthFailure::NonceFormat);
        }

        let skew = (now - timestamp).num_seconds().abs();
        if skew > self.timestamp_tolerance.num_seconds() {
            return Err(AuthFailure::TimestampSkew);
        }

        let payload_hash_hex = mac_hex(algorithm, &self.secret, payload);
        let base = canonical_params(algorithm, device_id, nonce, &payload_hash_hex, timestamp);

        if !verify_mac_hex(algorithm, &self.secret, base.as_bytes(), signature) {
            return Err(AuthFailure::SignatureMismatch);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let secret = b"super-secret".to_vec();
        let signer = HmacSigner::new(secret.clone(), HmacAlgorithm::Sha256);
        let verifier = HmacVerifier::new(secret, HmacAlgorithm::Sha256, 30);

        let now = Utc::now();
        let payload = b"hello world";
        let nonce = "deadbeef";
        let sig = signer.sign("d-01", payload, now, nonce);

        let result = verifier.verify("d-01", payload, &sig, now, nonce, HmacAlgorithm::Sha256, now);
        assert!(result.is_ok());
    }

    #[test]
    fn sha512_round_trips_too() {
        let secret = b"another-secret".to_vec();
        let signer = HmacSigner::new(secret.clone(), HmacAlgorithm::Sha512);
        let verifier = HmacVerifier::new(secret, HmacAlgorithm::Sha512, 30);
        let now = Utc::now();
        let sig = signer.sign("d-02", b"payload", now, "abc123");
        assert!(verifier.verify("d-02", b"payload", &sig, now, "abc123", HmacAlgorithm::Sha512, now).is_ok());
    }

    #[test]
    fn rejects_timestamp_outside_tolerance() {
        let secret = b"secret".to_vec();
        let signer = HmacSigner::new(secret.clone(), HmacAlgorithm::Sha256);
        let verifier = HmacVerifier::new(secret, HmacAlgorithm::Sha256, 30);
        let signed_at = Utc::now() - chrono::Duration::seconds(60);
        let sig = signer.sign("d-01", b"p", signed_at, "ab12");
        let err = verifier.verify("d-01", b"p", &sig, signed_at, "ab12", HmacAlgorithm::Sha256, Utc::now()).unwrap_err();
        assert_eq!(err, AuthFailure::TimestampSkew);
    }

    #[test]
    fn rejects_tampered_payload() {
        let secret = b"secret".to_vec();
        let signer = HmacSigner::new(secret.clone(), HmacAlgorithm::Sha256);
        let verifier = HmacVerifier::new(secret, HmacAlgorithm::Sha256, 30);
        let now = Utc::now();
        let sig = signer.sign("d-01", b"original", now, "ab12");
        let err = verifier.verify("d-01", b"tampered", &sig, now, "ab12", HmacAlgorithm::Sha256, now).unwrap_err();
        assert_eq!(err, AuthFailure::SignatureMismatch);
    }

    #[test]
    fn rejects_malformed_nonce() {
        let secret = b"secret".to_vec();
        let verifier = HmacVerifier::new(secret, HmacAlgorithm::Sha256, 30);
        let now = Utc::now();
        let err = verifier.verify("d-01", b"p", "whatever", now, "not-hex!", HmacAlgorithm::Sha256, now).unwrap_err();
        assert_eq!(err, AuthFailure::NonceFormat);
    }

    #[test]
    fn rejects_declared_algorithm_not_matching_configured_algorithm() {
        let secret = b"secret".to_vec();
        let signer = HmacSigner::new(secret.clone(), HmacAlgorithm::Sha256);
        let verifier = HmacVerifier::new(secret, HmacAlgorithm::Sha512, 30);
        let now = Utc::now();
        let sig = signer.sign("d-01", b"p", now, "ab12");
        let err = verifier.verify("d-01", b"p", &sig, now, "ab12", HmacAlgorithm::Sha256, now).unwrap_err();
        assert_eq!(err, AuthFailure::AlgorithmMismatch);
    }
}
