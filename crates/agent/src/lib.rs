//! Price pusher agent
//!
//! Features:
//! - Per-shard wiring of caches, controller, pusher and balance tracker
//! - Off-chain update routing to the owning shard
//! - Start/stop lifecycle draining in-flight pushes
//! - Prometheus metrics sink and tracing setup

pub mod agent;
pub mod metrics;
pub mod telemetry;

pub use agent::{Agent, ClientFactory, ShardClients};
pub use metrics::PrometheusMetrics;
pub use telemetry::init_tracing;
