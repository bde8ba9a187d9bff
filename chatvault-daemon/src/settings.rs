//! Process-level settings read from the environment.

use anyhow::{Context, Result, bail};
use chatvault_backfill::ConversationDirectory;
use chatvault_types::{ConversationId, ConversationInfo, ConversationKind};
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;

pub struct Settings {
    pub state_file: PathBuf,
    pub archive_db: PathBuf,
    pub source_url: String,
    pub source_token: Option<String>,
    pub directory: ConversationDirectory,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let source_url = env::var("CHATVAULT_SOURCE_URL")
            .context("CHATVAULT_SOURCE_URL must point at the history API")?;
        let conversations = parse_conversations(&env::var("CHATVAULT_CONVERSATIONS").unwrap_or_default())?;
        let excluded = parse_excluded(&env::var("CHATVAULT_EXCLUDED_IDS").unwrap_or_default())?;

        Ok(Self {
            state_file: path_or("CHATVAULT_STATE_FILE", "state.json"),
            archive_db: path_or("CHATVAULT_ARCHIVE_DB", "archive.duckdb"),
            source_url,
            source_token: env::var("CHATVAULT_SOURCE_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
            directory: ConversationDirectory::with_exclusions(conversations, &excluded),
        })
    }
}

fn path_or(var: &str, fallback: &str) -> PathBuf {
    env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(fallback))
}

/// Parses `id[:kind[:title]]` entries separated by commas.
///
/// `kind` is `chat` or `channel`; titles may contain colons.
pub fn parse_conversations(raw: &str) -> Result<Vec<ConversationInfo>> {
    let mut out = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let mut parts = entry.splitn(3, ':');
        let id: ConversationId = parts
            .next()
            .unwrap_or_default()
            .parse()
            .with_context(|| format!("bad conversation id in {entry:?}"))?;
        let kind = match parts.next().map(str::trim) {
            None | Some("") | Some("chat") => ConversationKind::Chat,
            Some("channel") => ConversationKind::Channel,
            Some(other) => bail!("unknown conversation kind {other:?} in {entry:?}"),
        };
        let title = parts.next().unwrap_or_default().trim();
        out.push(ConversationInfo::new(id, kind, title));
    }
    Ok(out)
}

pub fn parse_excluded(raw: &str) -> Result<HashSet<ConversationId>> {
    raw.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(|e| {
            e.parse::<ConversationId>()
                .with_context(|| format!("bad excluded id {e:?}"))
        })
        .collect()
}
