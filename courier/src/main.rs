//! `courier`: send and follow messages through a docstore.
//!
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/courier/config.toml`).
//!
//! ```bash
//! # Send a message and wait until it is read
//! cargo run --bin courier -- --sender alice --conversation <uuid> send "hello"
//!
//! # Watch a conversation as the other side
//! cargo run --bin courier -- --sender bob --conversation <uuid> listen
//!
//! # Show what is still waiting in the outbox
//! cargo run --bin courier -- pending --json
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing_appender::non_blocking::WorkerGuard;

use courier::config::{CliArgs, ClientConfig, Command};
use courier::remote::WsRemoteStore;
use courier::storage::FileStorage;
use courier::{DeliveryEngine, Direction, StatusChanged};
use courier_proto::message::{ConversationId, DeliveryStatus, MessageBody, SenderId, Timestamp};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(docstore = %config.docstore_url, "courier starting");

    match run(&cli, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "courier failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging so stdout stays clean for status output.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("courier.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

async fn run(cli: &CliArgs, config: &ClientConfig) -> Result<(), BoxError> {
    let sender = config.sender.clone().ok_or("no sender configured (use --sender)")?;
    let storage = FileStorage::open(&config.data_dir)?;
    let remote = WsRemoteStore::connect(&config.docstore_url, config.request_timeout).await?;

    let engine = DeliveryEngine::builder(
        Arc::new(remote),
        Arc::new(storage),
        SenderId::new(sender),
    )
    .with_config(config.delivery.clone())
    .start()?;

    let result = match &cli.command {
        Command::Send { text, wait_secs } => {
            let conversation = conversation(config)?;
            send(&engine, conversation, text, Duration::from_secs(*wait_secs), cli.json).await
        }
        Command::Listen { dwell_ms } => {
            let conversation = conversation(config)?;
            listen(&engine, conversation, Duration::from_millis(*dwell_ms), cli.json).await
        }
        Command::Pending => pending(&engine, cli.json).await,
    };

    engine.shutdown().await;
    result
}

fn conversation(config: &ClientConfig) -> Result<ConversationId, BoxError> {
    let raw = config
        .conversation
        .as_deref()
        .ok_or("no conversation configured (use --conversation)")?;
    Ok(ConversationId::parse(raw).ok_or_else(|| format!("invalid conversation id: {raw}"))?)
}

/// Submits one message and prints its status until it is read, fails, or
/// `wait` runs out.
async fn send<R: courier::remote::RemoteStore>(
    engine: &DeliveryEngine<R>,
    conversation: ConversationId,
    text: &str,
    wait: Duration,
    json: bool,
) -> Result<(), BoxError> {
    engine.watch_conversation(conversation).await?;
    let mut events = engine.subscribe();
    let handle = engine.submit(conversation, MessageBody::Text(text.to_string()))?;
    print_line(json, &handle.id.to_string(), "sending", Timestamp::now(), 0);

    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let event = match tokio::time::timeout_at(deadline, events.recv()).await {
            Err(_) => {
                println!("gave up waiting after {}s", wait.as_secs());
                return Ok(());
            }
            Ok(Err(RecvError::Lagged(n))) => {
                tracing::warn!(skipped = n, "status events lagged");
                continue;
            }
            Ok(Err(RecvError::Closed)) => return Ok(()),
            Ok(Ok(event)) => event,
        };
        if event.message_id != handle.id {
            continue;
        }
        print_change(json, &event);
        match event.to {
            DeliveryStatus::Read => return Ok(()),
            DeliveryStatus::Failed => return Err("message failed".into()),
            _ => {}
        }
    }
}

/// Follows a conversation as the receiving side. Each inbound message is
/// shown on screen for `dwell`, then scrolled away.
async fn listen<R: courier::remote::RemoteStore>(
    engine: &DeliveryEngine<R>,
    conversation: ConversationId,
    dwell: Duration,
    json: bool,
) -> Result<(), BoxError> {
    let mut events = engine.subscribe();
    engine.watch_conversation(conversation).await?;
    println!("listening on {conversation} (ctrl-c to stop)");

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = events.recv() => match event {
                Ok(event) => event,
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "status events lagged");
                    continue;
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        };
        print_change(json, &event);

        if event.direction == Direction::Inbound && event.from.is_none() {
            if let Some(tracked) = engine.message(&event.message_id)
                && let MessageBody::Text(text) = &tracked.message.body
            {
                println!("{}: {text}", tracked.message.sender_id);
            }
            engine.report_visibility(event.message_id, 1.0);
            tokio::time::sleep(dwell).await;
            engine.report_visibility(event.message_id, 0.0);
        }
    }
}

async fn pending<R: courier::remote::RemoteStore>(
    engine: &DeliveryEngine<R>,
    json: bool,
) -> Result<(), BoxError> {
    let entries = engine.pending_sends().await?;
    if entries.is_empty() && !json {
        println!("outbox is empty");
    }
    for entry in entries {
        if json {
            let line = serde_json::json!({
                "message_id": entry.id().to_string(),
                "conversation_id": entry.message.conversation_id.to_string(),
                "attempts": entry.attempts,
                "queued_at": format_time(entry.queued_at),
                "next_retry_at": format_time(entry.next_retry_at),
            });
            println!("{line}");
        } else {
            println!(
                "{}  attempts={}  next retry {}",
                entry.id(),
                entry.attempts,
                format_time(entry.next_retry_at)
            );
        }
    }
    Ok(())
}

fn print_change(json: bool, event: &StatusChanged) {
    print_line(
        json,
        &event.message_id.to_string(),
        event.to.as_str(),
        event.at,
        event.retry_count,
    );
}

fn print_line(json: bool, message_id: &str, status: &str, at: Timestamp, retry_count: u32) {
    if json {
        let line = serde_json::json!({
            "message_id": message_id,
            "status": status,
            "at": format_time(at),
            "retry_count": retry_count,
        });
        println!("{line}");
    } else {
        println!("{}  {message_id}  {status}", format_time(at));
    }
}

fn format_time(at: Timestamp) -> String {
    i64::try_from(at.as_millis())
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map_or_else(|| at.as_millis().to_string(), |t| t.to_rfc3339())
}
