//! # sluice
//!
//! At-least-once stream consumption, timestamped publishing, and time-based
//! retention over Redis streams.
//!
//! sluice drives three workflows over an append-only log with consumer-group
//! semantics:
//!
//! - **Consume**: join a consumer group and receive every entry as a
//!   [`Delivery`], acknowledged right after it is handed to you
//! - **Publish**: append entries stamped with the publish time
//! - **Retain**: periodically delete entries older than a retention window
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use sluice::{ConsumerEngine, Fields, Publisher, RedisConfig, RedisTransport, shutdown};
//!
//! # async fn run() -> sluice::Result<()> {
//! let transport = RedisTransport::connect(&RedisConfig::default()).await?;
//!
//! let publisher = Publisher::new(transport.clone());
//! let mut fields = Fields::new();
//! fields.insert("sku".to_string(), "a1".to_string());
//! publisher.publish("orders", "order-1", &fields).await?;
//!
//! let (stop, handle) = shutdown::channel();
//! let engine = ConsumerEngine::new(transport);
//! let mut sub = engine.consume("orders", "billing", "worker-1", handle).await?;
//! while let Some(delivery) = sub.next().await {
//!     let message = delivery?;
//!     println!("{} {:?}", message.id, message.values);
//! }
//! stop.trigger();
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`StreamTransport`] — The log capability every component drives
//! - [`ConsumerEngine`] — Group bootstrap and the per-consumer delivery task
//! - [`Publisher`] — Appends with an injected `timestamp` field
//! - [`RetentionManager`] — Wildcard discovery and the trim walk
//!
//! ## Modules
//!
//! - [`transport`] — Transport trait and its value types
//! - [`redis_transport`] — Redis implementation
//! - [`memory`] — In-process implementation with fault injection
//! - [`kv`] — Key/value and list operations
//! - [`consumer`] — Consume loop
//! - [`publisher`] — Publisher
//! - [`retention`] — Retention manager
//! - [`config`] — JSON configuration and duration strings
//! - [`clock`] — Time sources
//! - [`shutdown`] — Cancellation signal
//! - [`message`] — Entry ids and messages
//! - [`error`] — Error types

pub mod clock;
pub mod config;
pub mod consumer;
pub mod error;
pub mod kv;
pub mod memory;
pub mod message;
pub mod publisher;
pub mod redis_transport;
pub mod retention;
pub mod shutdown;
pub mod transport;

// Re-export primary API types at crate root for convenience.
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, RedisConfig};
pub use consumer::{ConsumeOptions, ConsumerEngine, Delivery, Subscription};
pub use error::{
    ConfigError, ConsumeError, PublishError, Result, RetentionError, SluiceError, TransportError,
};
pub use kv::KeyValueStore;
pub use memory::MemoryTransport;
pub use message::{EntryId, Fields, Message, TIMESTAMP_FIELD};
pub use publisher::Publisher;
pub use redis_transport::RedisTransport;
pub use retention::{CycleReport, RetentionManager, RetentionPolicy, TrimReport};
pub use shutdown::Shutdown;
pub use transport::StreamTransport;
