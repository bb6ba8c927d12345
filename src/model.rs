//! Wire and persisted data types (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single telemetry sample. All four fields must be finite and within
/// range; enforced by [`crate::codec::MessageCodec::validate`], never by
/// `serde` itself (untyped bytes are validated before anything trusts them).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub timestamp: i64,
    pub lat: f64,
    pub lon: f64,
    pub speed: f64,
}

/// Accepts either the object form `{timestamp, lat, lon, speed}` (mandated
/// wire form) or the tuple form `[timestamp, [lat, lon, speed]]` (spec §9
/// backward-compatibility allowance). Both normalize to the same
/// [`DataPoint`] before fingerprinting.
impl DataPointWire {
    pub fn into_data_point(self) -> DataPoint {
        match self {
            DataPointWire::Object { timestamp, lat, lon, speed } => DataPoint { timestamp, lat, lon, speed },
            DataPointWire::Tuple(timestamp, [lat, lon, speed]) => DataPoint { timestamp, lat, lon, speed },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DataPointWire {
    Object { timestamp: i64, lat: f64, lon: f64, speed: f64 },
    Tuple(i64, [f64; 3]),
}

/// Inbound payload (spec §3). `deviceId` matches `[A-Za-z0-9_-]{1,100}`,
/// `time` is epoch ms within `[0, now+1y]`, `data` is non-empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSignal {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub time: i64,
    pub data: Vec<DataPoint>,
}

/// HMAC algorithm choice (spec §3/§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HmacAlgorithm {
    Sha256,
    Sha512,
}

impl HmacAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            HmacAlgorithm::Sha256 => "sha256",
            HmacAlgorithm::Sha512 => "sha512",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sha256" => Some(Self::Sha256),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }
}

/// Transport wrapper headers around a [`RawSignal`] body (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeHeaders {
    pub correlation_id: Uuid,
    pub schema_version: String,
    pub device_id: String,
    pub hmac_signature: String,
    pub auth_timestamp: DateTime<Utc>,
    pub nonce: String,
    pub algorithm: HmacAlgorithm,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub headers: EnvelopeHeaders,
    pub body: RawSignal,
}

impl SignedEnvelope {
    /// Invariant: header `deviceId` equals body `deviceId` (spec §3).
    pub fn device_ids_match(&self) -> bool {
        self.headers.device_id == self.body.device_id
    }
}

/// Per-message derived statistics (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalStats {
    pub max_speed: f64,
    pub avg_speed: f64,
    pub distance_meters: i64,
    pub bbox: Option<BoundingBox>,
}

/// Representative location, stored GeoJSON-style (longitude-first) even
/// though [`DataPoint`] itself is lat-first (spec §3 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub coordinates: [f64; 2],
}

impl GeoPoint {
    pub fn from_lat_lon(lat: f64, lon: f64) -> Self {
        Self { coordinates: [lon, lat] }
    }

    pub fn lon(&self) -> f64 {
        self.coordinates[0]
    }

    pub fn lat(&self) -> f64 {
        self.coordinates[1]
    }
}

/// Opaque handle into [`crate::raw_store::RawStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawRef(pub [u8; 32]);

impl RawRef {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for RawRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// The persisted, queryable record (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedSignal {
    pub id: Uuid,
    pub device_id: String,
    pub time: i64,
    pub data_length: usize,
    pub data_volume: usize,
    pub stats: SignalStats,
    pub location: GeoPoint,
    pub raw_ref: RawRef,
    pub idempotency_key: [u8; 32],
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Stored content-addressed blob metadata (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBlob {
    pub id: RawRef,
    pub hash: String,
    pub uploaded_at: DateTime<Utc>,
    pub original_size: usize,
    pub compressed_size: usize,
    pub content_type: &'static str,
}

/// `(deviceId, nonce)` with expiration (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceRecord {
    pub device_id: String,
    pub nonce: String,
    pub expires_at: DateTime<Utc>,
}

/// Header block attached to every broker message (spec §3/§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryHeader {
    pub retry_count: u32,
    pub retry_delay_ms: Option<u64>,
    pub last_error: Option<String>,
    pub final_retry: bool,
}

impl Default for RetryHeader {
    fn default() -> Self {
        Self { retry_count: 0, retry_delay_ms: None, last_error: None, final_retry: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geo_point_is_longitude_first() {
        let p = GeoPoint::from_lat_lon(51.339764, 12.339223);
        assert_eq!(p.coordinates, [12.339223, 51.339764]);
        assert_eq!(p.lon(), 12.339223);
        assert_eq!(p.lat(), 51.339764);
    }

    #[test]
    fn hmac_algorithm_round_trips_through_str() {
        assert_eq!(HmacAlgorithm::parse("sha256"), Some(HmacAlgorithm::Sha256));
        assert_eq!(HmacAlgorithm::parse("sha512"), Some(HmacAlgorithm::Sha512));
        assert_eq!(HmacAlgorithm::parse("md5"), None);
        assert_eq!(HmacAlgorithm::Sha256.as_str(), "sha256");
    }

    #[test]
    fn tuple_and_object_data_point_wire_forms_normalize_equal() {
        let obj = DataPointWire::Object { timestamp: 1, lat: 2.0, lon: 3.0, speed: 4.0 };
        let tup = DataPointWire::Tuple(1, [2.0, 3.0, 4.0]);
        assert_eq!(obj.into_data_point(), tup.into_data_point());
    }

    #[test]
    fn envelope_device_id_mismatch_is_detected() {
        let env = SignedEnvelope {
            headers: EnvelopeHeaders {
                correlation_id: Uuid::new_v4(),
                schema_version: "1".into(),
                device_id: "d-01".into(),
                hmac_signature: "x".into(),
                auth_timestamp: Utc::now(),
                nonce: "ab".into(),
                algorithm: HmacAlgorithm::Sha256,
                retry_count: 0,
            },
            body: RawSignal { device_id: "d-02".into(), time: 0, data: vec![] },
        };
        assert!(!env.device_ids_match());
    }
}
