//! Timestamped appends.
//!
//! [`Publisher::publish`] copies the caller's fields, adds
//! [`TIMESTAMP_FIELD`](crate::message::TIMESTAMP_FIELD) in epoch milliseconds,
//! and appends the entry. The timestamp is what the retention manager later
//! compares against its threshold.

use tokio::sync::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::error::PublishError;
use crate::message::{EntryId, Fields, TIMESTAMP_FIELD};
use crate::transport::StreamTransport;

/// Appends messages with an injected publish timestamp.
///
/// Stamps from one publisher never decrease, even if the clock steps back,
/// and its entries land in stamp order. Concurrent publishes through one
/// publisher are serialized from stamping to append.
#[derive(Debug)]
pub struct Publisher<T, C = SystemClock> {
    transport: T,
    clock: C,
    last_stamp: Mutex<u64>,
}

impl<T: StreamTransport> Publisher<T> {
    /// Creates a publisher stamping with the system clock.
    pub fn new(transport: T) -> Self {
        Self::with_clock(transport, SystemClock)
    }
}

impl<T: StreamTransport, C: Clock> Publisher<T, C> {
    /// Creates a publisher stamping with `clock`.
    pub fn with_clock(transport: T, clock: C) -> Self {
        Self {
            transport,
            clock,
            last_stamp: Mutex::new(0),
        }
    }

    /// Appends `fields` to `stream` with a `timestamp` field added.
    ///
    /// `message_id` is only used for logging; the transport assigns the entry
    /// id, which is returned. A caller-supplied `timestamp` field is
    /// overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Append`] if the append fails.
    pub async fn publish(
        &self,
        stream: &str,
        message_id: &str,
        fields: &Fields,
    ) -> Result<EntryId, PublishError> {
        let mut last_stamp = self.last_stamp.lock().await;
        let stamp = self.clock.now_millis().max(*last_stamp);
        *last_stamp = stamp;

        let mut values = fields.clone();
        values.insert(TIMESTAMP_FIELD.to_string(), stamp.to_string());

        let id = self
            .transport
            .append(stream, &values)
            .await
            .map_err(|source| PublishError::Append {
                stream: stream.to_string(),
                message_id: message_id.to_string(),
                source,
            })?;

        tracing::debug!(stream, message_id, entry_id = %id, timestamp = stamp, "published");
        Ok(id)
    }
}
