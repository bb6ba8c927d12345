//! MessageCodec (spec §4.1): validation, canonicalization, fingerprinting.
//!
//! The idempotency contract holds only if two logically identical payloads
//! produce the same fingerprint, so canonicalization lives here rather than
//! being an optional serialization nicety. Key-sorting follows the same
//! recursive approach used for payload-hash canonicalization elsewhere in
//! the ecosystem (sort object keys, compact-serialize, hash the bytes).

use chrono::Utc;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::ValidationIssue;
use crate::model::{DataPoint, DataPointWire, RawSignal};

const MAX_DEVICE_ID_LEN: usize = 100;
const ONE_YEAR_MS: i64 = 365 * 24 * 60 * 60 * 1000;

/// Wire shape accepted at the boundary: `data` may use either the object
/// or tuple [`DataPointWire`] encoding (spec §9). Never pass this type past
/// the codec — callers only ever see [`RawSignal`] (typed, canonicalized).
#[derive(Debug, Clone, Deserialize)]
pub struct RawSignalWire {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub time: i64,
    pub data: Vec<DataPointWire>,
}

impl RawSignalWire {
    pub fn into_raw_signal(self) -> RawSignal {
        RawSignal {
            device_id: self.device_id,
            time: self.time,
            data: self.data.into_iter().map(DataPointWire::into_data_point).collect(),
        }
    }
}

fn is_valid_device_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_DEVICE_ID_LEN
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Structural and range validation (spec §4.1). Returns every distinct
/// issue found rather than failing fast on the first one.
pub fn validate(signal: &RawSignal) -> Result<(), Vec<ValidationIssue>> {
    let mut issues = Vec::new();

    if !is_valid_device_id(&signal.device_id) {
        issues.push(ValidationIssue::InvalidDeviceId(signal.device_id.clone()));
    }

    let now_ms = Utc::now().timestamp_millis();
    if signal.time < 0 || signal.time > now_ms + ONE_YEAR_MS {
        issues.push(ValidationIssue::TimeOutOfRange(signal.time));
    }

    if signal.data.is_empty() {
        issues.push(ValidationIssue::EmptyData);
    }

    for (i, p) in signal.data.iter().enumerate() {
        if !p.lat.is_finite() || !p.lon.is_finite() || !p.speed.is_finite() || !(p.timestamp as f64).is_finite() {
            issues.push(ValidationIssue::NonFinite { field: "data", index: Some(i) });
            continue;
        }
        if !(-90.0..=90.0).contains(&p.lat) {
            issues.push(ValidationIssue::CoordinateOutOfRange { field: "lat", index: i, value: p.lat });
        }
        if !(-180.0..=180.0).contains(&p.lon) {
            issues.push(ValidationIssue::CoordinateOutOfRange { field: "lon", index: i, value: p.lon });
        }
        if !(0.0..=1000.0).contains(&p.speed) {
            issues.push(ValidationIssue::SpeedOutOfRange { index: i, value: p.speed });
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

/// Deterministic re-serialization: fixed field order, fixed point
/// formatting (no trailing zeros, no exponent notation), independent of
/// the caller's JSON object key order.
pub fn normalize(signal: &RawSignal) -> Vec<u8> {
    let mut out = String::with_capacity(64 + signal.data.len() * 48);
    out.push_str(r#"{"deviceId":"#);
    push_json_string(&mut out, &signal.device_id);
    out.push_str(r#","time":"#);
    out.push_str(&signal.time.to_string());
    out.push_str(r#","data":["#);
    for (i, p) in signal.data.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(r#"{"timestamp":"#);
        out.push_str(&p.timestamp.to_string());
        out.push_str(r#","lat":"#);
        push_number(&mut out, p.lat);
        out.push_str(r#","lon":"#);
        push_number(&mut out, p.lon);
        out.push_str(r#","speed":"#);
        push_number(&mut out, p.speed);
        out.push('}');
    }
    out.push_str("]}");
    out.into_bytes()
}

fn push_json_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Formats a float with no trailing zeros and no exponent for values in
/// the "long" integer range, matching spec §4.1's canonical numeric rule.
fn push_number(out: &mut String, v: f64) {
    if v == v.trunc() && v.abs() < 1e15 {
        out.push_str(&format!("{}", v as i64));
    } else {
        let mut s = format!("{v}");
        if s.contains('e') || s.contains('E') {
            s = format!("{v:.17}");
            while s.ends_with('0') {
                s.pop();
            }
            if s.ends_with('.') {
                s.pop();
            }
        }
        out.push_str(&s);
    }
}

/// sha256 over the canonical form of `{deviceId, time, data}` — the
/// idempotency key. Stable across re-encodings of the same logical
/// payload (P3 in spec §8).
pub fn fingerprint(signal: &RawSignal) -> [u8; 32] {
    let canonical = normalize(signal);
    let digest = Sha256::digest(&canonical);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}
