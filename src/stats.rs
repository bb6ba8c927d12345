//! StatsComputer (spec §4.6): pure derived metrics over a validated
//! `data: DataPoint[]`. No external geo crate — hand-rolled haversine,
//! the same idiom the teacher uses for its own grid-cell distance math.

use crate::model::{BoundingBox, DataPoint, SignalStats};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

fn haversine_meters(a: DataPoint, b: DataPoint) -> f64 {
    let (lat1, lon1) = (a.lat.to_radians(), a.lon.to_radians());
    let (lat2, lon2) = (b.lat.to_radians(), b.lon.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Computes max/avg speed, total haversine distance, and bounding box.
/// `data` is assumed non-empty (a validated signal always has `dataLength >= 1`).
pub fn compute(data: &[DataPoint]) -> SignalStats {
    let n = data.len();
    debug_assert!(n >= 1, "StatsComputer requires at least one point");

    let max_speed = data.iter().map(|p| p.speed).fold(f64::NEG_INFINITY, f64::max);
    let avg_speed = if n == 1 { 0.0 } else { data.iter().map(|p| p.speed).sum::<f64>() / n as f64 };

    let distance_meters = if n == 1 {
        0i64
    } else {
        let total: f64 = data.windows(2).map(|w| haversine_meters(w[0], w[1])).sum();
        total.round() as i64
    };

    let bbox = {
        let min_lat = data.iter().map(|p| p.lat).fold(f64::INFINITY, f64::min);
        let max_lat = data.iter().map(|p| p.lat).fold(f64::NEG_INFINITY, f64::max);
        let min_lon = data.iter().map(|p| p.lon).fold(f64::INFINITY, f64::min);
        let max_lon = data.iter().map(|p| p.lon).fold(f64::NEG_INFINITY, f64::max);
        Some(BoundingBox { min_lat, max_lat, min_lon, max_lon })
    };

    SignalStats { max_speed, avg_speed, distance_meters, bbox }
}
