//! The stream transport capability.
//!
//! [`StreamTransport`] is the seam between sluice and the append-only log.
//! It exposes exactly the operations the consumer engine, the publisher and
//! the retention manager drive; consumer-group cursors and pending-entry
//! lists live in the transport, not in sluice.
//!
//! Two implementations ship with the crate:
//!
//! - [`RedisTransport`](crate::redis_transport::RedisTransport) speaks to a Redis server
//! - [`MemoryTransport`](crate::memory::MemoryTransport) keeps everything in
//!   process and is used as the test double

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportResult;
use crate::message::{EntryId, Fields, Message};

/// Where a group read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries never delivered to any consumer of the group (`>`).
    New,
    /// This consumer's own pending entries with an id greater than the given one.
    Pending(EntryId),
}

impl ReadCursor {
    /// Renders the cursor as a command argument.
    pub fn as_arg(&self) -> String {
        match self {
            Self::New => ">".to_string(),
            Self::Pending(id) => id.to_string(),
        }
    }
}

/// Initial position of a newly created consumer group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupStart {
    /// Deliver the whole stream (`0`).
    #[default]
    Beginning,
    /// Deliver only entries appended after creation (`$`).
    Latest,
}

impl GroupStart {
    /// Renders the start position as a command argument.
    pub fn as_arg(&self) -> &'static str {
        match self {
            Self::Beginning => "0",
            Self::Latest => "$",
        }
    }
}

/// Outcome of a group creation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    /// The group was created by this call.
    Created,
    /// The group already existed; its cursor was left untouched.
    AlreadyExists,
}

/// Summary of one consumer group, as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    /// Group name.
    pub name: String,
    /// Number of consumers known to the group.
    pub consumers: u64,
    /// Number of delivered-but-unacknowledged entries.
    pub pending: u64,
    /// Id of the last entry delivered to the group.
    pub last_delivered_id: EntryId,
}

/// Type of a key in the transport's keyspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyType {
    /// The key does not exist.
    None,
    /// Plain string value.
    String,
    /// List value.
    List,
    /// Set value.
    Set,
    /// Sorted-set value.
    ZSet,
    /// Hash value.
    Hash,
    /// Stream value.
    Stream,
    /// Any other type name reported by the server.
    Other(String),
}

impl From<&str> for KeyType {
    fn from(name: &str) -> Self {
        match name {
            "none" => Self::None,
            "string" => Self::String,
            "list" => Self::List,
            "set" => Self::Set,
            "zset" => Self::ZSet,
            "hash" => Self::Hash,
            "stream" => Self::Stream,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::String => "string",
            Self::List => "list",
            Self::Set => "set",
            Self::ZSet => "zset",
            Self::Hash => "hash",
            Self::Stream => "stream",
            Self::Other(name) => name,
        };
        f.write_str(name)
    }
}

/// One page of a cursor-based keyspace scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Cursor for the next call; `0` when the iteration is complete.
    pub cursor: u64,
    /// Keys returned by this page.
    pub keys: Vec<String>,
}

/// Append-only log with consumer-group semantics.
///
/// Handles are cheap to clone and safe to share between tasks; the
/// implementation does its own locking.
#[async_trait]
pub trait StreamTransport: Clone + Send + Sync + 'static {
    /// Returns a handle suitable for long blocking reads.
    ///
    /// Transports that pipeline commands over one connection return a handle
    /// with its own connection so a blocked read does not stall other callers.
    ///
    /// # Errors
    ///
    /// Returns an error if a new connection cannot be established.
    async fn dedicated(&self) -> TransportResult<Self> {
        Ok(self.clone())
    }

    /// Lists the consumer groups of a stream. A missing stream has no groups.
    async fn list_groups(&self, stream: &str) -> TransportResult<Vec<GroupInfo>>;

    /// Creates a consumer group, optionally creating the stream too.
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
        make_stream: bool,
    ) -> TransportResult<GroupStatus>;

    /// Reads up to `count` entries for `consumer` in `group`.
    ///
    /// With `block = Some(d)` a [`ReadCursor::New`] read waits up to `d` for
    /// new entries (`Duration::ZERO` waits forever). A timeout yields an
    /// empty vector, not an error.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Option<Duration>,
    ) -> TransportResult<Vec<Message>>;

    /// Acknowledges entries, removing them from the group's pending list.
    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> TransportResult<u64>;

    /// Appends an entry and returns its transport-assigned id.
    async fn append(&self, stream: &str, fields: &Fields) -> TransportResult<EntryId>;

    /// Returns up to `count` entries, oldest first.
    async fn range(&self, stream: &str, count: usize) -> TransportResult<Vec<Message>>;

    /// Returns up to `count` entries, newest first.
    async fn rev_range(&self, stream: &str, count: usize) -> TransportResult<Vec<Message>>;

    /// Deletes entries by id and returns how many existed.
    async fn delete(&self, stream: &str, ids: &[EntryId]) -> TransportResult<u64>;

    /// Returns one page of keys matching a glob `pattern`.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> TransportResult<ScanPage>;

    /// Returns the type of a key.
    async fn key_type(&self, key: &str) -> TransportResult<KeyType>;
}
