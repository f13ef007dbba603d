//! Redis-backed transport.
//!
//! Every operation is a raw command issued over a multiplexed async
//! connection, and replies are decoded from [`redis::Value`] by hand so both
//! RESP2 and RESP3 shapes are accepted.

use std::time::Duration;

use async_trait::async_trait;
use redis::Value;
use redis::aio::MultiplexedConnection;
use tracing::debug;

use crate::config::RedisConfig;
use crate::error::{TransportError, TransportResult};
use crate::kv::KeyValueStore;
use crate::message::{EntryId, Fields, Message};
use crate::transport::{
    GroupInfo, GroupStart, GroupStatus, KeyType, ReadCursor, ScanPage, StreamTransport,
};

/// A [`StreamTransport`] and [`KeyValueStore`] over a Redis server.
///
/// Clones share one multiplexed connection. Use
/// [`dedicated`](StreamTransport::dedicated) for blocking reads.
#[derive(Clone)]
pub struct RedisTransport {
    client: redis::Client,
    connection: MultiplexedConnection,
}

impl std::fmt::Debug for RedisTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTransport")
            .field("addr", &self.client.get_connection_info().addr)
            .finish_non_exhaustive()
    }
}

impl RedisTransport {
    /// Connects using a [`RedisConfig`] and verifies the server answers `PING`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Redis`] if the server is unreachable or
    /// authentication fails.
    pub async fn connect(config: &RedisConfig) -> TransportResult<Self> {
        let client = redis::Client::open(config.connection_info())?;
        let transport = Self::from_client(client).await?;
        transport.ping().await?;
        debug!(host = %config.host, port = config.port, db = config.database, "connected to redis");
        Ok(transport)
    }

    /// Connects to a `redis://` or `rediss://` URL.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Redis`] if the URL is invalid or the server
    /// is unreachable.
    pub async fn open(url: &str) -> TransportResult<Self> {
        let client = redis::Client::open(url)?;
        Self::from_client(client).await
    }

    /// Wraps an existing client, opening a multiplexed connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Redis`] if the connection cannot be opened.
    pub async fn from_client(client: redis::Client) -> TransportResult<Self> {
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, connection })
    }

    /// Checks that the server is alive.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Redis`] if the command fails.
    pub async fn ping(&self) -> TransportResult<String> {
        let pong: String = redis::cmd("PING").query_async(&mut self.conn()).await?;
        Ok(pong)
    }

    fn conn(&self) -> MultiplexedConnection {
        self.connection.clone()
    }
}

/// Maps server error codes that sluice distinguishes to typed variants.
fn classify(err: redis::RedisError, stream: &str, group: Option<&str>) -> TransportError {
    match (err.code(), group) {
        (Some("NOGROUP"), Some(group)) => TransportError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        },
        (Some("WRONGTYPE"), _) => TransportError::WrongType {
            key: stream.to_string(),
        },
        _ if is_no_such_key(&err) => TransportError::NoSuchKey {
            key: stream.to_string(),
        },
        _ => TransportError::Redis(err),
    }
}

fn is_no_such_key(err: &redis::RedisError) -> bool {
    err.detail()
        .is_some_and(|detail| detail.to_ascii_lowercase().contains("no such key"))
        || err.to_string().to_ascii_lowercase().contains("no such key")
}

#[async_trait]
impl StreamTransport for RedisTransport {
    async fn dedicated(&self) -> TransportResult<Self> {
        Self::from_client(self.client.clone()).await
    }

    async fn list_groups(&self, stream: &str) -> TransportResult<Vec<GroupInfo>> {
        let raw: Value = match redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(stream)
            .query_async(&mut self.conn())
            .await
        {
            Ok(raw) => raw,
            Err(e) if is_no_such_key(&e) => return Ok(Vec::new()),
            Err(e) => return Err(classify(e, stream, None)),
        };
        parse_groups(raw)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
        make_stream: bool,
    ) -> TransportResult<GroupStatus> {
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(stream).arg(group).arg(start.as_arg());
        if make_stream {
            cmd.arg("MKSTREAM");
        }
        let created: redis::RedisResult<Value> = cmd.query_async(&mut self.conn()).await;
        match created {
            Ok(_) => Ok(GroupStatus::Created),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(GroupStatus::AlreadyExists),
            Err(e) => Err(classify(e, stream, Some(group))),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Option<Duration>,
    ) -> TransportResult<Vec<Message>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(count.max(1));
        if let (ReadCursor::New, Some(block)) = (cursor, block) {
            cmd.arg("BLOCK").arg(u64::try_from(block.as_millis()).unwrap_or(u64::MAX));
        }
        cmd.arg("STREAMS").arg(stream).arg(cursor.as_arg());

        let raw: Value = cmd
            .query_async(&mut self.conn())
            .await
            .map_err(|e| classify(e, stream, Some(group)))?;
        parse_read_reply(raw)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> TransportResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group);
        for id in ids {
            cmd.arg(id.to_string());
        }
        let acked: u64 = cmd
            .query_async(&mut self.conn())
            .await
            .map_err(|e| classify(e, stream, Some(group)))?;
        Ok(acked)
    }

    async fn append(&self, stream: &str, fields: &Fields) -> TransportResult<EntryId> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        let id: String = cmd
            .query_async(&mut self.conn())
            .await
            .map_err(|e| classify(e, stream, None))?;
        id.parse()
    }

    async fn range(&self, stream: &str, count: usize) -> TransportResult<Vec<Message>> {
        let raw: Value = redis::cmd("XRANGE")
            .arg(stream)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| classify(e, stream, None))?;
        parse_entries(raw)
    }

    async fn rev_range(&self, stream: &str, count: usize) -> TransportResult<Vec<Message>> {
        let raw: Value = redis::cmd("XREVRANGE")
            .arg(stream)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| classify(e, stream, None))?;
        parse_entries(raw)
    }

    async fn delete(&self, stream: &str, ids: &[EntryId]) -> TransportResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("XDEL");
        cmd.arg(stream);
        for id in ids {
            cmd.arg(id.to_string());
        }
        let deleted: u64 = cmd
            .query_async(&mut self.conn())
            .await
            .map_err(|e| classify(e, stream, None))?;
        Ok(deleted)
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> TransportResult<ScanPage> {
        let (cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count.max(1))
            .query_async(&mut self.conn())
            .await?;
        Ok(ScanPage { cursor, keys })
    }

    async fn key_type(&self, key: &str) -> TransportResult<KeyType> {
        let name: String = redis::cmd("TYPE").arg(key).query_async(&mut self.conn()).await?;
        Ok(KeyType::from(name.as_str()))
    }
}

/// Blocking-pop timeouts are whole or fractional seconds; `0` waits forever.
#[allow(clippy::cast_precision_loss)]
fn pop_timeout(timeout: Duration) -> f64 {
    timeout.as_millis() as f64 / 1000.0
}

#[async_trait]
impl KeyValueStore for RedisTransport {
    async fn lpush(&self, key: &str, values: &[&str]) -> TransportResult<u64> {
        let len: u64 = redis::cmd("LPUSH")
            .arg(key)
            .arg(values)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| classify(e, key, None))?;
        Ok(len)
    }

    async fn rpush(&self, key: &str, values: &[&str]) -> TransportResult<u64> {
        let len: u64 = redis::cmd("RPUSH")
            .arg(key)
            .arg(values)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| classify(e, key, None))?;
        Ok(len)
    }

    async fn blpop(&self, keys: &[&str], timeout: Duration) -> TransportResult<Option<(String, String)>> {
        // Blocking pops get their own connection so they do not stall other callers.
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(keys)
            .arg(pop_timeout(timeout))
            .query_async(&mut conn)
            .await?;
        Ok(popped)
    }

    async fn brpop(&self, keys: &[&str], timeout: Duration) -> TransportResult<Option<(String, String)>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(keys)
            .arg(pop_timeout(timeout))
            .query_async(&mut conn)
            .await?;
        Ok(popped)
    }

    async fn set(&self, key: &str, value: &str, expiry: Option<Duration>) -> TransportResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = expiry {
            cmd.arg("PX").arg(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1));
        }
        let _: () = cmd.query_async(&mut self.conn()).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> TransportResult<Option<String>> {
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(|e| classify(e, key, None))?;
        Ok(value)
    }

    async fn del(&self, keys: &[&str]) -> TransportResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let deleted: u64 = redis::cmd("DEL").arg(keys).query_async(&mut self.conn()).await?;
        Ok(deleted)
    }

    async fn flush(&self) -> TransportResult<()> {
        let _: () = redis::cmd("FLUSHDB").query_async(&mut self.conn()).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reply parsers
// ---------------------------------------------------------------------------

fn invalid(reason: impl Into<String>) -> TransportError {
    TransportError::InvalidResponse {
        reason: reason.into(),
    }
}

/// Decodes an `XREADGROUP` reply. `Nil` means the block timed out.
fn parse_read_reply(raw: Value) -> TransportResult<Vec<Message>> {
    match raw {
        Value::Nil => Ok(Vec::new()),
        // RESP2: [[stream, entries], ...]
        Value::Array(streams) => {
            let mut messages = Vec::new();
            for item in streams {
                let Value::Array(mut pair) = item else {
                    return Err(invalid("expected [stream, entries] pair"));
                };
                if pair.len() < 2 {
                    return Err(invalid("stream reply missing entries"));
                }
                messages.extend(parse_entries(pair.swap_remove(1))?);
            }
            Ok(messages)
        }
        // RESP3: {stream: entries, ...}
        Value::Map(streams) => {
            let mut messages = Vec::new();
            for (_, entries) in streams {
                messages.extend(parse_entries(entries)?);
            }
            Ok(messages)
        }
        other => Err(invalid(format!("unexpected read reply: {other:?}"))),
    }
}

/// Decodes `[[id, [field, value, ...]], ...]`.
///
/// A pending entry that was deleted after delivery comes back with a nil
/// field list and is returned with no fields.
fn parse_entries(raw: Value) -> TransportResult<Vec<Message>> {
    let items = match raw {
        Value::Nil => return Ok(Vec::new()),
        Value::Array(items) => items,
        other => return Err(invalid(format!("expected entry list, got {other:?}"))),
    };

    let mut messages = Vec::with_capacity(items.len());
    for item in items {
        let Value::Array(entry) = item else {
            return Err(invalid("expected [id, fields] entry"));
        };
        let mut parts = entry.into_iter();
        let id: EntryId = parts
            .next()
            .ok_or_else(|| invalid("entry missing id"))
            .and_then(|v| value_to_string(&v))?
            .parse()?;
        let values = match parts.next() {
            None | Some(Value::Nil) => Fields::new(),
            Some(fields) => parse_fields(fields)?,
        };
        messages.push(Message::new(id, values));
    }
    Ok(messages)
}

fn parse_fields(raw: Value) -> TransportResult<Fields> {
    match raw {
        Value::Array(flat) => {
            let mut fields = Fields::with_capacity(flat.len() / 2);
            for pair in flat.chunks(2) {
                let [key, value] = pair else {
                    return Err(invalid("odd number of field items"));
                };
                fields.insert(value_to_string(key)?, value_to_string(value)?);
            }
            Ok(fields)
        }
        Value::Map(pairs) => pairs
            .iter()
            .map(|(k, v)| -> TransportResult<(String, String)> {
                Ok((value_to_string(k)?, value_to_string(v)?))
            })
            .collect(),
        other => Err(invalid(format!("expected field list, got {other:?}"))),
    }
}

/// Decodes `XINFO GROUPS`: a list of flat key/value arrays (RESP2) or maps (RESP3).
fn parse_groups(raw: Value) -> TransportResult<Vec<GroupInfo>> {
    let Value::Array(items) = raw else {
        return Err(invalid("expected group list"));
    };

    let mut groups = Vec::with_capacity(items.len());
    for item in items {
        let pairs: Vec<(Value, Value)> = match item {
            Value::Array(flat) => {
                let mut it = flat.into_iter();
                let mut pairs = Vec::new();
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    pairs.push((k, v));
                }
                pairs
            }
            Value::Map(pairs) => pairs,
            other => return Err(invalid(format!("unexpected group entry: {other:?}"))),
        };

        let mut info = GroupInfo {
            name: String::new(),
            consumers: 0,
            pending: 0,
            last_delivered_id: EntryId::ZERO,
        };
        for (key, value) in &pairs {
            match value_to_string(key)?.as_str() {
                "name" => info.name = value_to_string(value)?,
                "consumers" => info.consumers = value_to_u64(value)?,
                "pending" => info.pending = value_to_u64(value)?,
                "last-delivered-id" => info.last_delivered_id = value_to_string(value)?.parse()?,
                _ => {}
            }
        }
        groups.push(info);
    }
    Ok(groups)
}

// ---------------------------------------------------------------------------
// Value extraction helpers
// ---------------------------------------------------------------------------

fn value_to_string(val: &Value) -> TransportResult<String> {
    match val {
        Value::BulkString(bytes) => Ok(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Ok(s.clone()),
        Value::Int(i) => Ok(i.to_string()),
        Value::Okay => Ok("OK".to_string()),
        Value::Nil => Err(invalid("unexpected nil value")),
        other => Err(invalid(format!("expected string, got {other:?}"))),
    }
}

fn value_to_u64(val: &Value) -> TransportResult<u64> {
    match val {
        Value::Int(i) => u64::try_from(*i).map_err(|_| invalid(format!("negative count: {i}"))),
        other => value_to_string(other)?
            .parse()
            .map_err(|_| invalid(format!("cannot parse u64 from {other:?}"))),
    }
}
