//! Asynchronous intelligence pipeline engine.
//!
//! Consumes document-ingestion and analysis-request events from Kafka,
//! dispatches them to a bounded worker pool, runs multi-stage enrichment
//! against external analyzer and embedding services, publishes correlated
//! completion or failure events, and protects itself from downstream
//! instability with circuit breakers, bounded retries, and a dead-letter
//! channel.

pub mod clients;
pub mod config;
pub mod correlation;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod health;
pub mod kafka;
pub mod metrics;
pub mod scoring;
pub mod stores;

pub use config::Config;
pub use error::{EngineError, Result};
