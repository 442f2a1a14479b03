//! Stratus - durable pub/sub event bus
//!
//! A multi-consumer publish/subscribe broker over an append-only stream
//! store (Redis Streams in production, an in-process store for tests),
//! with consumer-group delivery, retry/backoff and dead-lettering,
//! contract-checked and signed cross-tenant messaging, a service-registry
//! bridge, and built-in monitoring and alerting.

pub mod bridge;
pub mod broker;
pub mod config;
pub mod dlq;
pub mod envelope;
pub mod error;
pub mod lifecycle;
pub mod monitor;
pub mod store;
pub mod tenancy;

pub use broker::{
    handler_fn, Broker, BrokerStatus, EventHandler, HealthState, PublishOptions, StreamConfig,
    SubscribeOptions, SubscriptionHandle,
};
pub use config::Config;
pub use envelope::{DeadLetterRecord, EventEnvelope, Priority, RetryEnvelope, RetryPolicy};
pub use error::{BusError, Result};
pub use lifecycle::LifecycleEvent;
pub use monitor::Monitor;
pub use tenancy::TenantBus;
