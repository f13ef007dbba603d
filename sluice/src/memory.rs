//! In-process transport.
//!
//! [`MemoryTransport`] implements [`StreamTransport`] and [`KeyValueStore`]
//! over a mutex-guarded keyspace with the same observable semantics as Redis:
//! monotonic `<ms>-<seq>` ids, per-group last-delivered cursors, per-consumer
//! pending lists, idempotent group creation, blocking reads and pops, and
//! typed keys. It is the test double for everything that drives a transport,
//! and failures can be injected with [`TestHook`]s.
//!
//! Clones share the same keyspace.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::clock::{Clock, SystemClock};
use crate::error::{TransportError, TransportResult};
use crate::kv::KeyValueStore;
use crate::message::{EntryId, Fields, Message};
use crate::transport::{
    GroupInfo, GroupStart, GroupStatus, KeyType, ReadCursor, ScanPage, StreamTransport,
};

/// Transport operations that hooks can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `list_groups`
    ListGroups,
    /// `create_group`
    CreateGroup,
    /// `read_group`
    ReadGroup,
    /// `ack`
    Ack,
    /// `append`
    Append,
    /// `range`
    Range,
    /// `rev_range`
    RevRange,
    /// `delete`
    Delete,
    /// `scan`
    Scan,
    /// `key_type`
    KeyType,
}

impl Operation {
    fn name(self) -> &'static str {
        match self {
            Self::ListGroups => "list_groups",
            Self::CreateGroup => "create_group",
            Self::ReadGroup => "read_group",
            Self::Ack => "ack",
            Self::Append => "append",
            Self::Range => "range",
            Self::RevRange => "rev_range",
            Self::Delete => "delete",
            Self::Scan => "scan",
            Self::KeyType => "key_type",
        }
    }
}

/// Deterministic fault injected into a [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestHook {
    /// Let the first `after` calls of `operation` succeed, then fail every call.
    FailAfter {
        /// The targeted operation.
        operation: Operation,
        /// Number of calls that succeed before failures start.
        after: usize,
    },
}

/// In-process stream and key/value store.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    changed: Notify,
    hooks: Mutex<Hooks>,
}

#[derive(Debug, Default)]
struct Hooks {
    active: Vec<TestHook>,
    calls: HashMap<Operation, usize>,
}

#[derive(Debug, Default)]
struct State {
    keys: HashMap<String, Value>,
}

#[derive(Debug)]
enum Value {
    Str {
        value: String,
        expires_at: Option<Instant>,
    },
    List(VecDeque<String>),
    Stream(StreamState),
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<EntryId, Fields>,
    last_id: EntryId,
    groups: BTreeMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingEntry>,
    consumers: BTreeSet<String>,
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    deliveries: u64,
}

impl State {
    /// Drops `key` if it is a string whose expiry has passed.
    fn purge(&mut self, key: &str) {
        let expired = matches!(
            self.keys.get(key),
            Some(Value::Str { expires_at: Some(at), .. }) if *at <= Instant::now()
        );
        if expired {
            self.keys.remove(key);
        }
    }

    fn purge_all(&mut self) {
        let now = Instant::now();
        self.keys.retain(|_, value| {
            !matches!(value, Value::Str { expires_at: Some(at), .. } if *at <= now)
        });
    }

    /// Returns the stream at `key`, `None` if absent, or `WrongType`.
    fn stream(&mut self, key: &str) -> TransportResult<Option<&mut StreamState>> {
        self.purge(key);
        match self.keys.get_mut(key) {
            Some(Value::Stream(stream)) => Ok(Some(stream)),
            Some(_) => Err(TransportError::WrongType {
                key: key.to_string(),
            }),
            None => Ok(None),
        }
    }

    /// Returns the stream at `key`, creating an empty one if absent.
    fn stream_or_create(&mut self, key: &str) -> TransportResult<&mut StreamState> {
        self.purge(key);
        let value = self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| Value::Stream(StreamState::default()));
        match value {
            Value::Stream(stream) => Ok(stream),
            _ => Err(TransportError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    fn list_or_create(&mut self, key: &str) -> TransportResult<&mut VecDeque<String>> {
        self.purge(key);
        let value = self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| Value::List(VecDeque::new()));
        match value {
            Value::List(list) => Ok(list),
            _ => Err(TransportError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    /// Pops one value from the first non-empty list among `keys`.
    fn pop_first(&mut self, keys: &[&str], from_tail: bool) -> TransportResult<Option<(String, String)>> {
        for key in keys {
            self.purge(key);
            let (popped, now_empty) = match self.keys.get_mut(*key) {
                Some(Value::List(list)) => {
                    let popped = if from_tail { list.pop_back() } else { list.pop_front() };
                    (popped, list.is_empty())
                }
                Some(_) => {
                    return Err(TransportError::WrongType {
                        key: (*key).to_string(),
                    });
                }
                None => continue,
            };
            if now_empty {
                self.keys.remove(*key);
            }
            if let Some(value) = popped {
                return Ok(Some(((*key).to_string(), value)));
            }
        }
        Ok(None)
    }
}

impl StreamState {
    fn next_id(&self, now_ms: u64) -> EntryId {
        if now_ms > self.last_id.ms {
            EntryId::new(now_ms, 0)
        } else {
            self.last_id.successor()
        }
    }

    fn message(&self, id: EntryId) -> Message {
        Message::new(id, self.entries.get(&id).cloned().unwrap_or_default())
    }
}

impl MemoryTransport {
    /// Creates an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fault hook.
    pub fn register_hook(&self, hook: TestHook) {
        self.hooks().active.push(hook);
    }

    /// Removes all fault hooks.
    pub fn clear_hooks(&self) {
        self.hooks().active.clear();
    }

    /// Number of times `operation` has been called, including failed calls.
    pub fn calls(&self, operation: Operation) -> usize {
        self.hooks().calls.get(&operation).copied().unwrap_or(0)
    }

    /// Number of entries in a stream (0 if absent).
    pub fn len(&self, stream: &str) -> usize {
        match self.state().keys.get(stream) {
            Some(Value::Stream(s)) => s.entries.len(),
            _ => 0,
        }
    }

    /// Returns true if the stream has no entries or does not exist.
    pub fn is_empty(&self, stream: &str) -> bool {
        self.len(stream) == 0
    }

    /// All entries of a stream, oldest first.
    pub fn entries(&self, stream: &str) -> Vec<Message> {
        match self.state().keys.get(stream) {
            Some(Value::Stream(s)) => s
                .entries
                .iter()
                .map(|(id, fields)| Message::new(*id, fields.clone()))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Pending entries of a group as `(id, consumer, deliveries)`.
    pub fn pending(&self, stream: &str, group: &str) -> Vec<(EntryId, String, u64)> {
        match self.state().keys.get(stream) {
            Some(Value::Stream(s)) => s
                .groups
                .get(group)
                .map(|g| {
                    g.pending
                        .iter()
                        .map(|(id, p)| (*id, p.consumer.clone(), p.deliveries))
                        .collect()
                })
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// The last-delivered cursor of a group.
    pub fn group_cursor(&self, stream: &str, group: &str) -> Option<EntryId> {
        match self.state().keys.get(stream) {
            Some(Value::Stream(s)) => s.groups.get(group).map(|g| g.last_delivered),
            _ => None,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hooks(&self) -> MutexGuard<'_, Hooks> {
        self.inner.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts the call and fails it if a hook says so.
    fn check(&self, operation: Operation) -> TransportResult<()> {
        let mut hooks = self.hooks();
        let seen = hooks.calls.entry(operation).or_insert(0);
        let before = *seen;
        *seen += 1;

        let fail = hooks.active.iter().any(|hook| match hook {
            TestHook::FailAfter {
                operation: target,
                after,
            } => *target == operation && before >= *after,
        });
        if fail {
            return Err(TransportError::Injected {
                operation: operation.name(),
            });
        }
        Ok(())
    }

    /// Runs `attempt` until it yields a value or `timeout` elapses.
    ///
    /// `Duration::ZERO` waits forever. Waiters are woken by appends and pushes.
    async fn wait_for<T, F>(&self, timeout: Duration, mut attempt: F) -> TransportResult<Option<T>>
    where
        F: FnMut(&mut State) -> TransportResult<Option<T>> + Send,
        T: Send,
    {
        let deadline = (!timeout.is_zero()).then(|| tokio::time::Instant::now() + timeout);

        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            // Register before checking so a wake-up between check and await is not lost.
            notified.as_mut().enable();

            let ready = {
                let mut state = self.state();
                attempt(&mut state)?
            };
            if ready.is_some() {
                return Ok(ready);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }
}

/// Matches `text` against a glob supporting `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = star {
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

fn read_new(
    state: &mut State,
    stream: &str,
    group: &str,
    consumer: &str,
    count: usize,
) -> TransportResult<Option<Vec<Message>>> {
    let no_group = || TransportError::NoGroup {
        stream: stream.to_string(),
        group: group.to_string(),
    };
    let s = state.stream(stream)?.ok_or_else(no_group)?;
    let g = s.groups.get_mut(group).ok_or_else(no_group)?;
    g.consumers.insert(consumer.to_string());

    let batch: Vec<Message> = s
        .entries
        .range((Bound::Excluded(g.last_delivered), Bound::Unbounded))
        .take(count)
        .map(|(id, fields)| Message::new(*id, fields.clone()))
        .collect();

    let Some(last) = batch.last() else {
        return Ok(None);
    };
    g.last_delivered = last.id;
    for msg in &batch {
        g.pending.insert(
            msg.id,
            PendingEntry {
                consumer: consumer.to_string(),
                deliveries: 1,
            },
        );
    }
    Ok(Some(batch))
}

fn read_pending(
    state: &mut State,
    stream: &str,
    group: &str,
    consumer: &str,
    after: EntryId,
    count: usize,
) -> TransportResult<Vec<Message>> {
    let no_group = || TransportError::NoGroup {
        stream: stream.to_string(),
        group: group.to_string(),
    };
    let s = state.stream(stream)?.ok_or_else(no_group)?;
    let g = s.groups.get_mut(group).ok_or_else(no_group)?;
    g.consumers.insert(consumer.to_string());

    // Cursor "0-0" must include an entry with id 0-0, so the lower bound is inclusive there.
    let lower = if after == EntryId::ZERO {
        Bound::Included(after)
    } else {
        Bound::Excluded(after)
    };
    let mut ids = Vec::new();
    for (id, pending) in g.pending.range_mut((lower, Bound::Unbounded)) {
        if ids.len() == count {
            break;
        }
        if pending.consumer == consumer {
            pending.deliveries += 1;
            ids.push(*id);
        }
    }
    Ok(ids.into_iter().map(|id| s.message(id)).collect())
}

#[async_trait]
impl StreamTransport for MemoryTransport {
    async fn list_groups(&self, stream: &str) -> TransportResult<Vec<GroupInfo>> {
        self.check(Operation::ListGroups)?;
        let mut state = self.state();
        let Some(s) = state.stream(stream)? else {
            return Ok(Vec::new());
        };
        Ok(s.groups
            .iter()
            .map(|(name, g)| GroupInfo {
                name: name.clone(),
                consumers: g.consumers.len() as u64,
                pending: g.pending.len() as u64,
                last_delivered_id: g.last_delivered,
            })
            .collect())
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
        make_stream: bool,
    ) -> TransportResult<GroupStatus> {
        self.check(Operation::CreateGroup)?;
        let mut state = self.state();
        let s = if make_stream {
            state.stream_or_create(stream)?
        } else {
            state.stream(stream)?.ok_or_else(|| TransportError::NoSuchKey {
                key: stream.to_string(),
            })?
        };

        if s.groups.contains_key(group) {
            return Ok(GroupStatus::AlreadyExists);
        }
        let last_delivered = match start {
            GroupStart::Beginning => EntryId::ZERO,
            GroupStart::Latest => s.last_id,
        };
        s.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                ..GroupState::default()
            },
        );
        Ok(GroupStatus::Created)
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
        self.check(Operation::ReadGroup)?;
        let count = count.max(1);

        match cursor {
            ReadCursor::Pending(after) => {
                read_pending(&mut self.state(), stream, group, consumer, after, count)
            }
            ReadCursor::New => match block {
                None => Ok(read_new(&mut self.state(), stream, group, consumer, count)?
                    .unwrap_or_default()),
                Some(timeout) => Ok(self
                    .wait_for(timeout, |state| read_new(state, stream, group, consumer, count))
                    .await?
                    .unwrap_or_default()),
            },
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> TransportResult<u64> {
        self.check(Operation::Ack)?;
        let mut state = self.state();
        let Some(g) = state.stream(stream)?.and_then(|s| s.groups.get_mut(group)) else {
            return Ok(0);
        };
        Ok(ids.iter().filter(|id| g.pending.remove(id).is_some()).count() as u64)
    }

    async fn append(&self, stream: &str, fields: &Fields) -> TransportResult<EntryId> {
        self.check(Operation::Append)?;
        let id = {
            let mut state = self.state();
            let s = state.stream_or_create(stream)?;
            let id = s.next_id(SystemClock.now_millis());
            s.entries.insert(id, fields.clone());
            s.last_id = id;
            id
        };
        self.inner.changed.notify_waiters();
        Ok(id)
    }

    async fn range(&self, stream: &str, count: usize) -> TransportResult<Vec<Message>> {
        self.check(Operation::Range)?;
        let mut state = self.state();
        let Some(s) = state.stream(stream)? else {
            return Ok(Vec::new());
        };
        Ok(s.entries
            .iter()
            .take(count)
            .map(|(id, fields)| Message::new(*id, fields.clone()))
            .collect())
    }

    async fn rev_range(&self, stream: &str, count: usize) -> TransportResult<Vec<Message>> {
        self.check(Operation::RevRange)?;
        let mut state = self.state();
        let Some(s) = state.stream(stream)? else {
            return Ok(Vec::new());
        };
        Ok(s.entries
            .iter()
            .rev()
            .take(count)
            .map(|(id, fields)| Message::new(*id, fields.clone()))
            .collect())
    }

    async fn delete(&self, stream: &str, ids: &[EntryId]) -> TransportResult<u64> {
        self.check(Operation::Delete)?;
        let mut state = self.state();
        let Some(s) = state.stream(stream)? else {
            return Ok(0);
        };
        Ok(ids.iter().filter(|id| s.entries.remove(id).is_some()).count() as u64)
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> TransportResult<ScanPage> {
        self.check(Operation::Scan)?;
        let mut state = self.state();
        state.purge_all();

        let mut keys: Vec<&String> = state.keys.keys().collect();
        keys.sort();

        let start = usize::try_from(cursor).unwrap_or(usize::MAX);
        let count = count.max(1);
        let page = keys
            .iter()
            .skip(start)
            .take(count)
            .filter(|key| glob_match(pattern, key))
            .map(|key| (*key).clone())
            .collect();
        let next = start.saturating_add(count);
        let cursor = if next >= keys.len() { 0 } else { next as u64 };

        Ok(ScanPage { cursor, keys: page })
    }

    async fn key_type(&self, key: &str) -> TransportResult<KeyType> {
        self.check(Operation::KeyType)?;
        let mut state = self.state();
        state.purge(key);
        Ok(match state.keys.get(key) {
            None => KeyType::None,
            Some(Value::Str { .. }) => KeyType::String,
            Some(Value::List(_)) => KeyType::List,
            Some(Value::Stream(_)) => KeyType::Stream,
        })
    }
}

#[async_trait]
impl KeyValueStore for MemoryTransport {
    async fn lpush(&self, key: &str, values: &[&str]) -> TransportResult<u64> {
        let len = {
            let mut state = self.state();
            let list = state.list_or_create(key)?;
            for value in values {
                list.push_front((*value).to_string());
            }
            list.len() as u64
        };
        self.inner.changed.notify_waiters();
        Ok(len)
    }

    async fn rpush(&self, key: &str, values: &[&str]) -> TransportResult<u64> {
        let len = {
            let mut state = self.state();
            let list = state.list_or_create(key)?;
            list.extend(values.iter().map(|v| (*v).to_string()));
            list.len() as u64
        };
        self.inner.changed.notify_waiters();
        Ok(len)
    }

    async fn blpop(&self, keys: &[&str], timeout: Duration) -> TransportResult<Option<(String, String)>> {
        self.wait_for(timeout, |state| state.pop_first(keys, false)).await
    }

    async fn brpop(&self, keys: &[&str], timeout: Duration) -> TransportResult<Option<(String, String)>> {
        self.wait_for(timeout, |state| state.pop_first(keys, true)).await
    }

    async fn set(&self, key: &str, value: &str, expiry: Option<Duration>) -> TransportResult<()> {
        self.state().keys.insert(
            key.to_string(),
            Value::Str {
                value: value.to_string(),
                expires_at: expiry.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> TransportResult<Option<String>> {
        let mut state = self.state();
        state.purge(key);
        match state.keys.get(key) {
            Some(Value::Str { value, .. }) => Ok(Some(value.clone())),
            Some(_) => Err(TransportError::WrongType {
                key: key.to_string(),
            }),
            None => Ok(None),
        }
    }

    async fn del(&self, keys: &[&str]) -> TransportResult<u64> {
        let mut state = self.state();
        let mut deleted = 0;
        for key in keys {
            state.purge(key);
            if state.keys.remove(*key).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn flush(&self) -> TransportResult<()> {
        self.state().keys.clear();
        Ok(())
    }
}
