//! chatvault daemon: runs gap reconciliation and backfill until interrupted.
//!
//! Recovered and live messages are indexed in the DuckDB archive and written
//! to stdout as JSON lines for the downstream publisher. Commands arrive on
//! stdin, see [`commands`].

mod commands;
mod settings;

use anyhow::{Context, Result};
use chatvault_backfill::{
    ArchivingSink, BackfillConfig, ChannelSink, ConversationDirectory, EngineHandle, EngineParts,
    HttpHistorySource, spawn_engine,
};
use chatvault_storage::{ArchiveIndex, ProgressStore};
use commands::Command;
use serde::Serialize;
use settings::Settings;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

fn main() -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    let result = runtime.block_on(run());
    // A stdin read still parked on the blocking pool must not hold the process.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let config = BackfillConfig::from_env().context("invalid engine configuration")?;
    let settings = Settings::from_env()?;
    info!(
        "tracking {} conversations, state in {}",
        settings.directory.len(),
        settings.state_file.display()
    );

    let store = Arc::new(ProgressStore::open(&settings.state_file));
    let archive = ArchiveIndex::open(&settings.archive_db)
        .with_context(|| format!("opening archive {}", settings.archive_db.display()))?;
    let source = HttpHistorySource::new(settings.source_url, settings.source_token)?;

    let (channel, mut records) = ChannelSink::channel(256);
    let publisher = tokio::spawn(async move {
        while let Some(record) = records.recv().await {
            if let Err(e) = publish(&record) {
                error!("failed to publish message {}: {e:#}", record.message.id);
            }
        }
    });

    let directory = settings.directory;
    let parts = EngineParts {
        store,
        source: Arc::new(source),
        archive: Arc::new(archive.clone()),
        sink: Arc::new(ArchivingSink::new(archive.clone(), channel)),
        directory: directory.clone(),
    };
    let engine = spawn_engine(parts, config)?;

    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);
    tokio::select! {
        _ = &mut shutdown => {}
        res = serve_commands(&engine, &archive, &directory) => {
            match res {
                Ok(()) => info!("command input closed"),
                Err(e) => error!("command input failed: {e:#}"),
            }
            shutdown.await;
        }
    }
    engine.shutdown().await?;
    publisher.await.context("publisher task failed")?;
    info!("chatvault stopped");
    Ok(())
}

fn publish<T: Serialize>(record: &T) -> Result<()> {
    let line = serde_json::to_string(record).context("encoding record")?;
    writeln!(std::io::stdout().lock(), "{line}").context("writing to stdout")?;
    Ok(())
}

/// Applies stdin commands until the input is closed.
async fn serve_commands(
    engine: &EngineHandle,
    archive: &ArchiveIndex,
    directory: &ConversationDirectory,
) -> Result<()> {
    let activity = engine.activity();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        match commands::parse_command(&line) {
            Ok(Command::SetBackfill { chat_id, offset_id }) => {
                info!("SET_BACKFILL to {offset_id} for {chat_id}");
                if let Err(e) = engine.set_backfill(chat_id, offset_id).await {
                    warn!("SET_BACKFILL for {chat_id} not applied: {e}");
                }
            }
            Ok(Command::LiveMessage {
                chat_id,
                event_type,
                message,
            }) => {
                let accepted =
                    commands::accept_live(&activity, archive, directory, chat_id, event_type, message)
                        .await;
                if let Some(record) = accepted {
                    if let Err(e) = publish(&record) {
                        error!("failed to publish live message {}: {e:#}", record.message.id);
                    }
                }
            }
            Err(e) => warn!("ignoring command: {e:#}"),
        }
    }
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("failed to install terminate handler: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
