//! CLI for sluice.
//!
//! Publishes to, consumes from, inspects, and retains Redis streams, and
//! exposes the plain key/value commands for poking at the same server.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use sluice::config::{Config, format_duration, parse_duration};
use sluice::consumer::{ConsumeOptions, ConsumerEngine};
use sluice::kv::KeyValueStore;
use sluice::memory::MemoryTransport;
use sluice::message::{Fields, Message};
use sluice::publisher::Publisher;
use sluice::redis_transport::RedisTransport;
use sluice::retention::{RetentionManager, RetentionPolicy};
use sluice::shutdown::{self, Shutdown};
use sluice::transport::StreamTransport;
use tracing_subscriber::EnvFilter;

/// sluice — at-least-once Redis stream consumption with time-based retention.
#[derive(Parser)]
#[command(name = "sluice", version, about)]
struct Cli {
    /// JSON config file. Flags override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Redis URL (e.g. "redis://:pw@localhost:6379/0"); replaces the redis config.
    #[arg(long, global = true)]
    url: Option<String>,

    /// Redis host.
    #[arg(long, global = true)]
    host: Option<String>,

    /// Redis port.
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Use a throwaway in-process store instead of Redis.
    #[arg(long, global = true, conflicts_with = "url")]
    memory: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Append messages to a stream with a publish timestamp.
    Publish {
        /// Stream key.
        stream: String,

        /// Message fields as key=value pairs.
        #[arg(required = true)]
        fields: Vec<String>,

        /// Message id used in logs (defaults to "msg-<n>").
        #[arg(long)]
        id: Option<String>,

        /// Number of copies to publish.
        #[arg(long, default_value = "1")]
        count: u32,

        /// Pause between copies (e.g., "1s", "250ms").
        #[arg(long, default_value = "0ms", value_parser = duration_arg)]
        every: Duration,
    },

    /// Consume a stream through a consumer group and print each message.
    Consume {
        /// Stream key.
        stream: String,

        /// Consumer group.
        #[arg(long, default_value = "sluice")]
        group: String,

        /// Consumer name within the group.
        #[arg(long, default_value = "consumer1")]
        consumer: String,

        /// Entries per read.
        #[arg(long)]
        count: Option<usize>,

        /// How long each read waits for new entries.
        #[arg(long, value_parser = duration_arg)]
        block: Option<Duration>,

        /// Skip redelivery of this consumer's pending entries.
        #[arg(long)]
        no_recover: bool,

        /// Exit after this many messages.
        #[arg(long)]
        max: Option<u64>,

        /// Output format.
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// Delete stream entries older than the retention window.
    Retain {
        /// Streams to retain; "*" discovers every stream.
        #[arg(long, num_args = 1..)]
        streams: Option<Vec<String>>,

        /// Time between cycles.
        #[arg(long, value_parser = duration_arg)]
        interval: Option<Duration>,

        /// Maximum entry age.
        #[arg(long, value_parser = duration_arg)]
        retention: Option<Duration>,

        /// Run a single cycle, print what was trimmed, and exit.
        #[arg(long)]
        once: bool,
    },

    /// List every stream key with its consumer groups.
    Streams,

    /// Print the newest entries of a stream.
    Tail {
        /// Stream key.
        stream: String,

        /// Number of entries.
        #[arg(long, default_value = "10")]
        count: usize,

        /// Output format.
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// Plain key/value and list commands.
    Kv {
        #[command(subcommand)]
        command: KvCommand,
    },

    /// Run two consumer groups, retention, and a publisher against one stream.
    Demo {
        /// Stream key.
        #[arg(long, default_value = "mystream")]
        stream: String,

        /// Messages to publish.
        #[arg(long, default_value = "10")]
        messages: u32,

        /// Pause between messages.
        #[arg(long, default_value = "1s", value_parser = duration_arg)]
        every: Duration,
    },
}

/// Key/value subcommands.
#[derive(Subcommand)]
enum KvCommand {
    /// Push values onto a list (head by default).
    Push {
        /// List key.
        key: String,
        /// Values to push.
        #[arg(required = true)]
        values: Vec<String>,
        /// Push onto the tail instead.
        #[arg(long)]
        right: bool,
    },

    /// Pop from the first non-empty list, waiting up to --timeout.
    Pop {
        /// List keys, checked in order.
        #[arg(required = true)]
        keys: Vec<String>,
        /// How long to wait; "0s" waits forever.
        #[arg(long, default_value = "5s", value_parser = duration_arg)]
        timeout: Duration,
        /// Pop from the tail instead.
        #[arg(long)]
        right: bool,
    },

    /// Set a string value.
    Set {
        /// Key.
        key: String,
        /// Value.
        value: String,
        /// Expire the key after this long.
        #[arg(long, value_parser = duration_arg)]
        expiry: Option<Duration>,
    },

    /// Get a string value.
    Get {
        /// Key.
        key: String,
    },

    /// Delete keys.
    Del {
        /// Keys.
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Remove every key in the current database.
    Flush,
}

/// Output format for messages.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// One line per message: id followed by sorted key=value pairs.
    Text,
    /// One JSON object per line.
    Json,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(host) = cli.host {
        config.redis.host = host;
    }
    if let Some(port) = cli.port {
        config.redis.port = port;
    }
    config.validate()?;

    if cli.memory {
        return dispatch(MemoryTransport::new(), cli.command, &config).await;
    }
    let transport = match &cli.url {
        Some(url) => RedisTransport::open(url).await?,
        None => RedisTransport::connect(&config.redis).await?,
    };
    dispatch(transport, cli.command, &config).await
}

async fn dispatch<T>(transport: T, command: Commands, config: &Config) -> Result<(), Box<dyn std::error::Error>>
where
    T: StreamTransport + KeyValueStore,
{
    match command {
        Commands::Publish {
            stream,
            fields,
            id,
            count,
            every,
        } => cmd_publish(transport, &stream, &fields, id.as_deref(), count, every).await,
        Commands::Consume {
            stream,
            group,
            consumer,
            count,
            block,
            no_recover,
            max,
            format,
        } => {
            let options = ConsumeOptions {
                count: count.unwrap_or(config.consumer.count),
                block: block.unwrap_or(config.consumer.block),
                recover_pending: config.consumer.recover_pending && !no_recover,
            };
            cmd_consume(transport, options, &stream, &group, &consumer, max, &format).await
        }
        Commands::Retain {
            streams,
            interval,
            retention,
            once,
        } => {
            let policy = RetentionPolicy {
                streams: streams.unwrap_or_else(|| config.retention.streams.clone()),
                interval: interval.unwrap_or(config.retention.interval),
                retention: retention.unwrap_or(config.retention.retention),
            };
            Ok(cmd_retain(transport, &policy, once).await?)
        }
        Commands::Streams => Ok(cmd_streams(transport).await?),
        Commands::Tail {
            stream,
            count,
            format,
        } => cmd_tail(transport, &stream, count, &format).await,
        Commands::Kv { command } => Ok(cmd_kv(transport, command).await?),
        Commands::Demo {
            stream,
            messages,
            every,
        } => cmd_demo(transport, config, &stream, messages, every).await,
    }
}

/// Implements `sluice publish <stream> <key=value>...`.
async fn cmd_publish<T: StreamTransport>(
    transport: T,
    stream: &str,
    pairs: &[String],
    id: Option<&str>,
    count: u32,
    every: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let fields = parse_fields(pairs)?;
    let publisher = Publisher::new(transport);

    for i in 0..count {
        let message_id = match id {
            Some(id) if count == 1 => id.to_string(),
            Some(id) => format!("{id}-{i}"),
            None => format!("msg-{i}"),
        };
        let entry_id = publisher.publish(stream, &message_id, &fields).await?;
        println!("Published {message_id} as {entry_id}");

        if i + 1 < count && !every.is_zero() {
            tokio::time::sleep(every).await;
        }
    }
    Ok(())
}

/// Implements `sluice consume <stream>`.
async fn cmd_consume<T: StreamTransport>(
    transport: T,
    options: ConsumeOptions,
    stream: &str,
    group: &str,
    consumer: &str,
    max: Option<u64>,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = ConsumerEngine::with_options(transport, options);
    let mut sub = engine.consume(stream, group, consumer, shutdown_on_ctrl_c()).await?;

    let mut received = 0_u64;
    while let Some(delivery) = sub.next().await {
        let message = delivery?;
        print_message(&message, format)?;
        received += 1;
        if max.is_some_and(|max| received >= max) {
            break;
        }
    }

    sub.join().await;
    Ok(())
}

/// Implements `sluice retain`.
async fn cmd_retain<T: StreamTransport>(
    transport: T,
    policy: &RetentionPolicy,
    once: bool,
) -> sluice::Result<()> {
    let manager = RetentionManager::new(transport);

    if !once {
        manager.retain_policy(policy, shutdown_on_ctrl_c()).await?;
        return Ok(());
    }

    let streams = manager.resolve_streams(&policy.streams).await?;
    let report = manager.run_cycle(&streams, policy.retention).await?;
    println!(
        "# threshold_ms={}, retention={}, streams={}",
        report.threshold_ms,
        format_duration(policy.retention),
        report.streams.len()
    );
    println!("stream,scanned,deleted,skipped,boundary");
    for trimmed in &report.streams {
        let boundary = trimmed.boundary.map(|id| id.to_string()).unwrap_or_default();
        println!(
            "{},{},{},{},{boundary}",
            trimmed.stream, trimmed.scanned, trimmed.deleted, trimmed.skipped
        );
    }
    Ok(())
}

/// Implements `sluice streams`.
async fn cmd_streams<T: StreamTransport>(transport: T) -> sluice::Result<()> {
    let manager = RetentionManager::new(transport.clone());
    let streams = manager.discover_streams().await?;

    println!("Streams: {}", streams.len());
    for stream in &streams {
        println!();
        println!("  {stream}");
        let groups = transport.list_groups(stream).await?;
        if groups.is_empty() {
            println!("    (no consumer groups)");
        }
        for group in groups {
            println!(
                "    group {}: consumers={}, pending={}, last-delivered={}",
                group.name, group.consumers, group.pending, group.last_delivered_id
            );
        }
    }
    Ok(())
}

/// Implements `sluice tail <stream>`.
async fn cmd_tail<T: StreamTransport>(
    transport: T,
    stream: &str,
    count: usize,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    for message in transport.rev_range(stream, count).await? {
        print_message(&message, format)?;
    }
    Ok(())
}

/// Implements `sluice kv ...`.
async fn cmd_kv<T: KeyValueStore>(transport: T, command: KvCommand) -> sluice::Result<()> {
    match command {
        KvCommand::Push { key, values, right } => {
            let values: Vec<&str> = values.iter().map(String::as_str).collect();
            let len = if right {
                transport.rpush(&key, &values).await?
            } else {
                transport.lpush(&key, &values).await?
            };
            println!("{len}");
        }
        KvCommand::Pop {
            keys,
            timeout,
            right,
        } => {
            let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
            let popped = if right {
                transport.brpop(&keys, timeout).await?
            } else {
                transport.blpop(&keys, timeout).await?
            };
            match popped {
                Some((key, value)) => println!("{key} {value}"),
                None => println!("(timeout)"),
            }
        }
        KvCommand::Set { key, value, expiry } => {
            transport.set(&key, &value, expiry).await?;
            println!("OK");
        }
        KvCommand::Get { key } => match transport.get(&key).await? {
            Some(value) => println!("{value}"),
            None => println!("(nil)"),
        },
        KvCommand::Del { keys } => {
            let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
            println!("{}", transport.del(&keys).await?);
        }
        KvCommand::Flush => {
            transport.flush().await?;
            println!("OK");
        }
    }
    Ok(())
}

/// Implements `sluice demo`: two groups fan out over one stream while
/// retention trims it and a publisher feeds it.
async fn cmd_demo<T: StreamTransport>(
    transport: T,
    config: &Config,
    stream: &str,
    messages: u32,
    every: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let (trigger, stop) = shutdown::channel();
    let mut interrupt = shutdown_on_ctrl_c();

    // Consumers first, so the stream exists when retention discovers streams.
    let engine = ConsumerEngine::with_options(transport.clone(), config.consumer.clone());
    let mut readers = Vec::new();
    for (consumer, group) in [("consumer1", "mygroup1"), ("consumer2", "mygroup2")] {
        let mut sub = engine.consume(stream, group, consumer, stop.clone()).await?;
        readers.push(tokio::spawn(async move {
            while let Some(delivery) = sub.next().await {
                match delivery {
                    Ok(message) => println!("Received message {consumer} ID {}: {:?}", message.id, message.values),
                    Err(e) => tracing::error!(consumer, error = %e, "consumer stopped"),
                }
            }
        }));
    }

    let retention = RetentionManager::new(transport.clone());
    let policy = config.retention.clone();
    let retain_stop = stop.clone();
    let retainer = tokio::spawn(async move { retention.retain_policy(&policy, retain_stop).await });

    let publisher = Publisher::new(transport);
    for i in 0..messages {
        let message_id = format!("msg-{i}");
        let mut fields = Fields::new();
        fields.insert("id".to_string(), message_id.clone());
        fields.insert("content".to_string(), format!("message content {i}"));
        let entry_id = publisher.publish(stream, &message_id, &fields).await?;
        println!("Published message {message_id} as {entry_id}");

        tokio::select! {
            () = interrupt.triggered() => break,
            () = tokio::time::sleep(every) => {}
        }
    }

    trigger.trigger();
    for reader in readers {
        reader.await?;
    }
    retainer.await??;
    Ok(())
}

/// Returns a shutdown handle that fires on Ctrl-C.
fn shutdown_on_ctrl_c() -> Shutdown {
    let (trigger, handle) = shutdown::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupt received, shutting down");
                trigger.trigger();
            }
            Err(e) => {
                // Keep the trigger alive; dropping it would stop everything.
                tracing::warn!(error = %e, "cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        }
    });
    handle
}

fn print_message(message: &Message, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Text => {
            let mut pairs: Vec<_> = message.values.iter().collect();
            pairs.sort();
            let body: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
            println!("{} {}", message.id, body.join(" "));
        }
        OutputFormat::Json => println!("{}", serde_json::to_string(message)?),
    }
    Ok(())
}

/// Parses `key=value` arguments into message fields.
fn parse_fields(pairs: &[String]) -> Result<Fields, String> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| format!("expected key=value, got '{pair}'"))
        })
        .collect()
}

/// Parses a duration argument (e.g., "5s", "1m", "250ms").
fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_fields() {
        let fields = parse_fields(&["sku=a1".to_string(), "note=x=y".to_string()]).unwrap();
        assert_eq!(fields.get("sku").map(String::as_str), Some("a1"));
        assert_eq!(fields.get("note").map(String::as_str), Some("x=y"));

        assert!(parse_fields(&["novalue".to_string()]).is_err());
        assert!(parse_fields(&["=v".to_string()]).is_err());
    }

    #[test]
    fn test_global_flags_and_overrides() {
        let cli = Cli::try_parse_from([
            "sluice", "consume", "orders", "--group", "billing", "--block", "250ms", "--memory",
        ])
        .unwrap();
        assert!(cli.memory);
        match cli.command {
            Commands::Consume { group, block, .. } => {
                assert_eq!(group, "billing");
                assert_eq!(block, Some(Duration::from_millis(250)));
            }
            _ => panic!("expected consume"),
        }

        assert!(Cli::try_parse_from(["sluice", "--memory", "--url", "redis://x", "streams"]).is_err());
        assert!(Cli::try_parse_from(["sluice", "retain", "--interval", "soon"]).is_err());
    }

    #[tokio::test]
    async fn test_demo_runs_in_memory() {
        let mut config = Config::default();
        config.consumer.block = Duration::from_millis(20);
        config.retention.interval = Duration::from_millis(20);
        cmd_demo(MemoryTransport::new(), &config, "mystream", 3, Duration::from_millis(5))
            .await
            .unwrap();
    }
}
