//! Error types for sluice.

use std::path::PathBuf;

use thiserror::Error;

use crate::message::EntryId;

/// The main error type for all sluice operations.
///
/// Each component reports its own error enum; this type wraps them so that
/// callers driving several components can use a single `?` chain.
#[derive(Error, Debug)]
pub enum SluiceError {
    /// Error raised directly by the stream or key/value transport.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Error during consumer-group setup or inside a consume loop.
    #[error("consume error: {0}")]
    Consume(#[from] ConsumeError),

    /// Error appending a message to a stream.
    #[error("publish error: {0}")]
    Publish(#[from] PublishError),

    /// Error during stream discovery or trimming.
    #[error("retention error: {0}")]
    Retention(#[from] RetentionError),

    /// Error loading or validating configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors reported by a [`StreamTransport`](crate::transport::StreamTransport)
/// or [`KeyValueStore`](crate::kv::KeyValueStore) implementation.
#[derive(Error, Debug)]
pub enum TransportError {
    /// An error from the Redis driver (I/O, protocol, or server reply).
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The consumer group does not exist on the stream.
    #[error("no consumer group '{group}' on stream '{stream}'")]
    NoGroup {
        /// The stream key.
        stream: String,
        /// The missing group name.
        group: String,
    },

    /// The key does not exist and the operation requires it.
    #[error("no such key '{key}'")]
    NoSuchKey {
        /// The missing key.
        key: String,
    },

    /// The key holds a value of a different type.
    #[error("operation against key '{key}' holding the wrong kind of value")]
    WrongType {
        /// The offending key.
        key: String,
    },

    /// A reply could not be decoded into the expected shape.
    #[error("invalid response: {reason}")]
    InvalidResponse {
        /// What was wrong with the reply.
        reason: String,
    },

    /// A stream entry identifier could not be parsed.
    #[error("invalid stream entry id '{id}'")]
    InvalidEntryId {
        /// The text that failed to parse.
        id: String,
    },

    /// A failure injected by a registered test hook.
    #[error("injected failure in {operation}")]
    Injected {
        /// The operation the hook targeted.
        operation: &'static str,
    },
}

/// Errors produced by the consumer engine.
///
/// `Setup` is returned from [`ConsumerEngine::consume`](crate::consumer::ConsumerEngine::consume)
/// before any task is spawned. `Read` and `Ack` arrive as the single terminal
/// item of a subscription.
#[derive(Error, Debug)]
pub enum ConsumeError {
    /// Listing or creating the consumer group failed.
    #[error("could not prepare group '{group}' on stream '{stream}': {source}")]
    Setup {
        /// The stream key.
        stream: String,
        /// The consumer group.
        group: String,
        /// The underlying transport error.
        #[source]
        source: TransportError,
    },

    /// The group read failed.
    #[error("could not read messages from '{stream}' as {group}/{consumer}: {source}")]
    Read {
        /// The stream key.
        stream: String,
        /// The consumer group.
        group: String,
        /// The consumer name.
        consumer: String,
        /// The underlying transport error.
        #[source]
        source: TransportError,
    },

    /// Acknowledging a delivered entry failed. The entry stays pending.
    #[error("could not acknowledge message {id} on '{stream}' for group '{group}': {source}")]
    Ack {
        /// The stream key.
        stream: String,
        /// The consumer group.
        group: String,
        /// The entry that was delivered but not acknowledged.
        id: EntryId,
        /// The underlying transport error.
        #[source]
        source: TransportError,
    },
}

/// Errors produced by the publisher.
#[derive(Error, Debug)]
pub enum PublishError {
    /// The append to the stream failed.
    #[error("could not publish message '{message_id}' to '{stream}': {source}")]
    Append {
        /// The stream key.
        stream: String,
        /// The caller-supplied message id.
        message_id: String,
        /// The underlying transport error.
        #[source]
        source: TransportError,
    },
}

/// Errors produced by the retention manager.
#[derive(Error, Debug)]
pub enum RetentionError {
    /// Scanning the keyspace for stream keys failed.
    #[error("could not discover streams: {source}")]
    Discovery {
        /// The underlying transport error.
        #[source]
        source: TransportError,
    },

    /// Reading or deleting entries of one stream failed. The cycle is aborted.
    #[error("failed to trim stream '{stream}': {source}")]
    Trim {
        /// The stream being trimmed.
        stream: String,
        /// The underlying transport error.
        #[source]
        source: TransportError,
    },
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file '{}': {source}", path.display())]
    Read {
        /// The config file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`Config`](crate::config::Config).
    #[error("failed to parse config: {source}")]
    Parse {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A duration string could not be parsed.
    #[error("invalid duration '{input}': {reason}")]
    InvalidDuration {
        /// The offending input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A field holds an unacceptable value.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// The field name.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Type alias for `Result<T, SluiceError>`.
pub type Result<T> = std::result::Result<T, SluiceError>;

/// Type alias for results returned by transports.
pub type TransportResult<T> = std::result::Result<T, TransportError>;
