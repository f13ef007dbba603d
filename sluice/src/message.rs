//! Stream entry identifiers and the message type delivered to consumers.
//!
//! Entry ids follow the Redis `<milliseconds>-<sequence>` format. They are
//! assigned by the transport on append and are strictly increasing within a
//! stream, so they order entries in append order.

use std::collections::HashMap;
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Field injected by the publisher and read by the retention manager.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Field name → value mapping carried by every stream entry.
pub type Fields = HashMap<String, String>;

/// Transport-assigned identifier of a stream entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct EntryId {
    /// Milliseconds part.
    pub ms: u64,
    /// Sequence number within the millisecond.
    pub seq: u64,
}

impl EntryId {
    /// The smallest possible id (`0-0`), used as the "beginning of stream" cursor.
    pub const ZERO: Self = Self { ms: 0, seq: 0 };

    /// Creates an id from its two components.
    pub const fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Returns the id immediately following this one.
    pub fn successor(self) -> Self {
        if self.seq == u64::MAX {
            Self::new(self.ms.saturating_add(1), 0)
        } else {
            Self::new(self.ms, self.seq + 1)
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = TransportError;

    /// Parses `<ms>-<seq>`; a bare `<ms>` is accepted with sequence 0.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::InvalidEntryId { id: s.to_string() };
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        let ms = ms.parse().map_err(|_| invalid())?;
        let seq = seq.parse().map_err(|_| invalid())?;
        Ok(Self { ms, seq })
    }
}

/// A stream entry as returned by the transport and delivered to consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The transport-assigned entry id.
    pub id: EntryId,
    /// The entry's fields.
    pub values: Fields,
}

impl Message {
    /// Creates a message from an id and its fields.
    pub fn new(id: EntryId, values: Fields) -> Self {
        Self { id, values }
    }

    /// Returns the raw value of a field.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.values.get(field).map(String::as_str)
    }

    /// Parses the publisher-injected [`TIMESTAMP_FIELD`].
    ///
    /// Returns `None` when the field is absent and `Some(Err(_))` when it is
    /// present but not an integer.
    pub fn timestamp_ms(&self) -> Option<Result<i64, ParseIntError>> {
        self.get(TIMESTAMP_FIELD).map(|raw| raw.trim().parse::<i64>())
    }
}
