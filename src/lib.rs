//! FlowBridge
//!
//! A high-throughput pub-sub bridge: consumes from one or more source
//! topics, optionally transforms each message, and republishes it to a
//! destination according to a configured topology (Funnel, Fan, or
//! One-to-one), with bounded-queue back-pressure and Prometheus metrics
//! throughout.

pub mod adapters;
pub mod backpressure;
pub mod config;
pub mod engine;
pub mod error;
pub mod flow;
pub mod message;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod worker_pool;
