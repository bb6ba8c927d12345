// =============================================================================
// xrayiot-loadtest — manual exerciser for the ingestion pipeline's producer
// path. Generates plausible device traffic (a short GPS track per signal),
// signs it the same way the real producer would, and publishes it at a
// configurable rate straight to the broker.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use lapin::{Connection, ConnectionProperties};
use rand::Rng;

use xrayiot_ingest::broker::{self, Producer};
use xrayiot_ingest::hmac_auth::HmacSigner;
use xrayiot_ingest::model::{DataPoint, HmacAlgorithm, RawSignal};

#[derive(Parser)]
#[command(name = "xrayiot-loadtest")]
#[command(about = "Load test tool for the xrayiot-ingest broker producer path")]
struct Args {
    /// AMQP broker URI
    #[arg(long, default_value = "amqp://127.0.0.1:5672/%2f")]
    broker_uri: String,

    /// HMAC signing secret; must match the consumer's HMAC_SECRET
    #[arg(long, env = "HMAC_SECRET")]
    hmac_secret: String,

    /// Signals per second
    #[arg(long, default_value_t = 50)]
    rate: u32,

    /// Duration in seconds
    #[arg(long, default_value_t = 30)]
    duration: u64,

    /// Number of distinct simulated device ids
    #[arg(long, default_value_t = 10)]
    devices: usize,

    /// Points per signal
    #[arg(long, default_value_t = 5)]
    points: usize,

    /// Center latitude
    #[arg(long, default_value_t = 51.339764)]
    lat: f64,

    /// Center longitude
    #[arg(long, default_value_t = 12.339223)]
    lon: f64,
}

struct Counters {
    published: AtomicU64,
    failed: AtomicU64,
}

fn build_signal(device_id: &str, rng: &mut impl Rng, center_lat: f64, center_lon: f64, n_points: usize) -> RawSignal {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let data = (0..n_points)
        .map(|i| DataPoint {
            timestamp: i as i64 * 1000,
            lat: center_lat + rng.gen_range(-0.001..0.001),
            lon: center_lon + rng.gen_range(-0.001..0.001),
            speed: rng.gen_range(0.0..20.0),
        })
        .collect();
    RawSignal { device_id: device_id.to_string(), time: now_ms, data }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    println!("=== xrayiot-ingest Load Test ===");
    println!("Broker:   {}", args.broker_uri);
    println!("Rate:     {} signal/s", args.rate);
    println!("Duration: {}s", args.duration);
    println!("Devices:  {}", args.devices);
    println!("Center:   lat={} lon={}", args.lat, args.lon);
    println!();

    let connection = Connection::connect(&args.broker_uri, ConnectionProperties::default())
        .await
        .unwrap_or_else(|e| {
            eprintln!("cannot reach broker: {e}");
            std::process::exit(1);
        });
    let channel = connection.create_channel().await.unwrap_or_else(|e| {
        eprintln!("cannot open channel: {e}");
        std::process::exit(1);
    });
    broker::declare_topology(&channel).await.unwrap_or_else(|e| {
        eprintln!("cannot declare topology: {e}");
        std::process::exit(1);
    });

    let signer = HmacSigner::new(args.hmac_secret.into_bytes(), HmacAlgorithm::Sha256);
    let producer = Arc::new(Producer::new(channel, signer, 16));

    let device_ids: Vec<String> = (0..args.devices).map(|i| format!("loadtest-d{i:03}")).collect();

    let counters = Arc::new(Counters { published: AtomicU64::new(0), failed: AtomicU64::new(0) });
    let interval = Duration::from_micros(1_000_000 / args.rate.max(1) as u64);
    let deadline = Instant::now() + Duration::from_secs(args.duration);

    println!("Publishing...\n");
    let start = Instant::now();
    let mut rng = rand::thread_rng();
    let mut tick = 0u64;

    while Instant::now() < deadline {
        let device_id = &device_ids[(tick as usize) % device_ids.len()];
        let signal = build_signal(device_id, &mut rng, args.lat, args.lon, args.points);

        match producer.publish(&signal).await {
            Ok(()) => {
                counters.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                if tick < 5 {
                    eprintln!("publish failed: {e}");
                }
            }
        }

        tick += 1;
        if tick % 500 == 0 {
            let elapsed = start.elapsed().as_secs_f64();
            println!(
                "  [{:.1}s] published={} failed={} ({:.0} signal/s)",
                elapsed,
                counters.published.load(Ordering::Relaxed),
                counters.failed.load(Ordering::Relaxed),
                counters.published.load(Ordering::Relaxed) as f64 / elapsed.max(0.001),
            );
        }

        let target = Duration::from_micros(tick * interval.as_micros() as u64);
        let actual = start.elapsed();
        if actual < target {
            tokio::time::sleep(target - actual).await;
        }
    }

    let elapsed = start.elapsed();
    println!("\n=== Results ===");
    println!("Duration:  {:.2}s", elapsed.as_secs_f64());
    println!("Published: {}", counters.published.load(Ordering::Relaxed));
    println!("Failed:    {}", counters.failed.load(Ordering::Relaxed));
    println!("Throughput: {:.1} signal/s", counters.published.load(Ordering::Relaxed) as f64 / elapsed.as_secs_f64());
}
