//! Geospatial IoT telemetry ingestion pipeline: validates, deduplicates,
//! archives, and summarizes signed device payloads end to end.

pub mod broker;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod error;
pub mod hmac_auth;
pub mod metrics;
pub mod model;
pub mod nonce;
pub mod raw_store;
pub mod replayer;
pub mod repository;
pub mod retry;
pub mod shutdown;
pub mod stats;
