//! At-least-once consumption through consumer groups.
//!
//! [`ConsumerEngine::consume`] makes sure the group exists, then spawns one
//! task that reads from the stream and hands each entry to the caller over a
//! capacity-1 channel. The hand-off completes when the caller takes the entry
//! out of the [`Subscription`], not when it lands in the channel buffer; only
//! then is the entry acknowledged. Entry *i* is therefore acked before entry
//! *i + 1* is emitted, and an entry still sitting in the buffer when the
//! caller stops is never acked.
//!
//! The subscription yields [`Delivery`] values. A read or ack failure is
//! delivered as a single terminal `Err` and the channel closes; a shutdown or
//! a dropped receiver closes it without one. Entries that were delivered but
//! never acknowledged stay pending and are redelivered to the same consumer
//! the next time it starts (see [`ConsumeOptions::recover_pending`]).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{ConsumeError, TransportError};
use crate::message::{EntryId, Message};
use crate::shutdown::Shutdown;
use crate::transport::{GroupStart, GroupStatus, ReadCursor, StreamTransport};

/// Default number of entries requested per read.
pub const DEFAULT_READ_COUNT: usize = 10;

/// Default time a read waits for new entries.
pub const DEFAULT_BLOCK: Duration = Duration::from_secs(5);

/// One item of a subscription: a message, or the terminal error.
pub type Delivery = Result<Message, ConsumeError>;

/// Tuning for the consume loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumeOptions {
    /// Maximum entries per read.
    pub count: usize,
    /// How long a read waits for new entries before re-issuing.
    #[serde(with = "crate::config::duration")]
    pub block: Duration,
    /// Redeliver this consumer's unacknowledged entries before reading new ones.
    pub recover_pending: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            count: DEFAULT_READ_COUNT,
            block: DEFAULT_BLOCK,
            recover_pending: true,
        }
    }
}

/// Starts consume loops over a shared transport.
#[derive(Debug, Clone)]
pub struct ConsumerEngine<T> {
    transport: T,
    options: ConsumeOptions,
}

impl<T: StreamTransport> ConsumerEngine<T> {
    /// Creates an engine with default options.
    pub fn new(transport: T) -> Self {
        Self::with_options(transport, ConsumeOptions::default())
    }

    /// Creates an engine with explicit options.
    pub fn with_options(transport: T, options: ConsumeOptions) -> Self {
        Self { transport, options }
    }

    /// Returns the loop options.
    pub fn options(&self) -> &ConsumeOptions {
        &self.options
    }

    /// Creates `group` on `stream` at the beginning of the stream unless it
    /// already exists. The stream is created if missing.
    ///
    /// Never moves the cursor of an existing group.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumeError::Setup`] if the groups cannot be listed or the
    /// group cannot be created.
    pub async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupStatus, ConsumeError> {
        let setup = |source| ConsumeError::Setup {
            stream: stream.to_string(),
            group: group.to_string(),
            source,
        };

        let groups = self.transport.list_groups(stream).await.map_err(setup)?;
        if groups.iter().any(|g| g.name == group) {
            return Ok(GroupStatus::AlreadyExists);
        }

        let status = self
            .transport
            .create_group(stream, group, GroupStart::Beginning, true)
            .await
            .map_err(setup)?;
        if status == GroupStatus::Created {
            tracing::info!(stream, group, "created consumer group");
        }
        Ok(status)
    }

    /// Starts consuming `stream` as `consumer` in `group`.
    ///
    /// Each call spawns a fresh task and returns a fresh [`Subscription`].
    ///
    /// # Errors
    ///
    /// Returns [`ConsumeError::Setup`] if the group cannot be prepared or a
    /// reader connection cannot be opened. Nothing is spawned in that case.
    pub async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        shutdown: Shutdown,
    ) -> Result<Subscription, ConsumeError> {
        self.ensure_group(stream, group).await?;

        let reader = self
            .transport
            .dedicated()
            .await
            .map_err(|source| ConsumeError::Setup {
                stream: stream.to_string(),
                group: group.to_string(),
                source,
            })?;

        let (tx, receiver) = mpsc::channel(1);
        let worker = Worker {
            reader,
            options: self.options.clone(),
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            tx,
            shutdown,
        };
        let task = tokio::spawn(worker.run());

        Ok(Subscription { receiver, task })
    }
}

/// Receiving end of a consume loop.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::Receiver<Delivery>,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Waits for the next delivery. `None` once the loop has ended.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Stops accepting deliveries. A message already buffered can still be
    /// drained with [`next`](Self::next), but it stays pending.
    pub fn close(&mut self) {
        self.receiver.close();
    }

    /// Drops the receiver and waits for the loop task to exit.
    pub async fn join(self) {
        drop(self.receiver);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "consume task panicked");
        }
    }
}

/// Why a loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Cancelled,
    ReceiverDropped,
}

enum Emit {
    Sent,
    Stopped(Stop),
}

struct Worker<T> {
    reader: T,
    options: ConsumeOptions,
    stream: String,
    group: String,
    consumer: String,
    tx: mpsc::Sender<Delivery>,
    shutdown: Shutdown,
}

impl<T: StreamTransport> Worker<T> {
    async fn run(mut self) {
        tracing::info!(
            stream = %self.stream,
            group = %self.group,
            consumer = %self.consumer,
            "consume loop started"
        );

        match self.deliver_all().await {
            Ok(stop) => tracing::info!(
                stream = %self.stream,
                consumer = %self.consumer,
                reason = ?stop,
                "consume loop stopped"
            ),
            Err(err) => {
                tracing::error!(
                    stream = %self.stream,
                    group = %self.group,
                    consumer = %self.consumer,
                    error = %err,
                    "consume loop failed"
                );
                let _ = self.emit(Err(err)).await;
            }
        }
    }

    async fn deliver_all(&mut self) -> Result<Stop, ConsumeError> {
        if self.options.recover_pending {
            if let Some(stop) = self.recover_pending().await? {
                return Ok(stop);
            }
        }

        loop {
            if self.shutdown.is_triggered() {
                return Ok(Stop::Cancelled);
            }

            let read = tokio::select! {
                biased;
                () = self.shutdown.triggered() => Err(Stop::Cancelled),
                () = self.tx.closed() => Err(Stop::ReceiverDropped),
                read = self.reader.read_group(
                    &self.stream,
                    &self.group,
                    &self.consumer,
                    ReadCursor::New,
                    self.options.count,
                    Some(self.options.block),
                ) => Ok(read),
            };
            let read = match read {
                Ok(read) => read,
                Err(stop) => return Ok(stop),
            };

            let batch = read.map_err(|source| self.read_error(source))?;
            if batch.is_empty() {
                continue;
            }
            tracing::debug!(stream = %self.stream, consumer = %self.consumer, count = batch.len(), "read batch");

            if let Some(stop) = self.deliver(batch).await? {
                return Ok(stop);
            }
        }
    }

    /// Redelivers entries this consumer received earlier but never acknowledged.
    async fn recover_pending(&mut self) -> Result<Option<Stop>, ConsumeError> {
        let mut after = EntryId::ZERO;
        loop {
            if self.shutdown.is_triggered() {
                return Ok(Some(Stop::Cancelled));
            }
            if self.tx.is_closed() {
                return Ok(Some(Stop::ReceiverDropped));
            }

            let batch = self
                .reader
                .read_group(
                    &self.stream,
                    &self.group,
                    &self.consumer,
                    ReadCursor::Pending(after),
                    self.options.count,
                    None,
                )
                .await
                .map_err(|source| self.read_error(source))?;
            let Some(last) = batch.last() else {
                return Ok(None);
            };
            after = last.id;
            tracing::info!(stream = %self.stream, consumer = %self.consumer, count = batch.len(), "redelivering pending entries");

            if let Some(stop) = self.deliver(batch).await? {
                return Ok(Some(stop));
            }
        }
    }

    /// Hands each message to the caller, acknowledging it once taken.
    async fn deliver(&mut self, batch: Vec<Message>) -> Result<Option<Stop>, ConsumeError> {
        for message in batch {
            let id = message.id;
            if let Emit::Stopped(stop) = self.emit(Ok(message)).await {
                return Ok(Some(stop));
            }
            if let Emit::Stopped(stop) = self.taken().await {
                tracing::debug!(stream = %self.stream, consumer = %self.consumer, %id, "left pending, caller stopped");
                return Ok(Some(stop));
            }

            self.reader
                .ack(&self.stream, &self.group, &[id])
                .await
                .map_err(|source| ConsumeError::Ack {
                    stream: self.stream.clone(),
                    group: self.group.clone(),
                    id,
                    source,
                })?;
        }
        Ok(None)
    }

    async fn emit(&mut self, delivery: Delivery) -> Emit {
        tokio::select! {
            biased;
            () = self.shutdown.triggered() => Emit::Stopped(Stop::Cancelled),
            sent = self.tx.send(delivery) => match sent {
                Ok(()) => Emit::Sent,
                Err(_) => Emit::Stopped(Stop::ReceiverDropped),
            },
        }
    }

    /// Waits until the caller has received the last emitted delivery.
    ///
    /// The channel slot frees up only when the receiver takes the buffered
    /// message. A closed receiver may have dropped it unread.
    async fn taken(&mut self) -> Emit {
        tokio::select! {
            biased;
            () = self.shutdown.triggered() => Emit::Stopped(Stop::Cancelled),
            permit = self.tx.reserve() => match permit {
                Ok(_slot) => Emit::Sent,
                Err(_) => Emit::Stopped(Stop::ReceiverDropped),
            },
        }
    }

    fn read_error(&self, source: TransportError) -> ConsumeError {
        ConsumeError::Read {
            stream: self.stream.clone(),
            group: self.group.clone(),
            consumer: self.consumer.clone(),
            source,
        }
    }
}
