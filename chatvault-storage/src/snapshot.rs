//! Flat key/value file format of the progress snapshot.
//!
//! ```json
//! {
//!   "chat_42_backfill_from_id": 1200,
//!   "chat_42_missing_ranges": [[7, 8], [20, 31]]
//! }
//! ```
//!
//! Keys without the `chat_` prefix are accepted on read. Anything else in the
//! file is ignored.

use crate::progress_store::ConversationProgress;
use chatvault_types::{ConversationId, GapRange, MessageId};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

const KEY_PREFIX: &str = "chat_";
const CURSOR_SUFFIX: &str = "_backfill_from_id";
const RANGES_SUFFIX: &str = "_missing_ranges";

pub(crate) type Conversations = BTreeMap<ConversationId, ConversationProgress>;

pub(crate) fn cursor_key(conversation: ConversationId) -> String {
    format!("{KEY_PREFIX}{conversation}{CURSOR_SUFFIX}")
}

pub(crate) fn ranges_key(conversation: ConversationId) -> String {
    format!("{KEY_PREFIX}{conversation}{RANGES_SUFFIX}")
}

pub(crate) fn encode(conversations: &Conversations) -> Value {
    let mut map = Map::new();
    for (id, progress) in conversations {
        if let Some(cursor) = progress.cursor {
            map.insert(cursor_key(*id), Value::from(cursor));
        }
        if !progress.gaps.is_empty() {
            let ranges = progress
                .gaps
                .iter()
                .map(|r| Value::from(vec![r.start(), r.end()]))
                .collect();
            map.insert(ranges_key(*id), Value::Array(ranges));
        }
    }
    Value::Object(map)
}

enum Field {
    Cursor,
    Ranges,
}

fn parse_key(key: &str) -> Option<(ConversationId, Field)> {
    let (stem, field) = if let Some(stem) = key.strip_suffix(CURSOR_SUFFIX) {
        (stem, Field::Cursor)
    } else if let Some(stem) = key.strip_suffix(RANGES_SUFFIX) {
        (stem, Field::Ranges)
    } else {
        return None;
    };
    let stem = stem.strip_prefix(KEY_PREFIX).unwrap_or(stem);
    stem.parse::<ConversationId>().ok().map(|id| (id, field))
}

fn parse_ranges(key: &str, value: &Value) -> Vec<GapRange> {
    let Some(items) = value.as_array() else {
        warn!("ignoring {key}: expected an array of [start, end] pairs");
        return Vec::new();
    };
    let parsed: Vec<GapRange> = items
        .iter()
        .filter_map(|item| {
            let parsed = serde_json::from_value::<[MessageId; 2]>(item.clone())
                .ok()
                .and_then(|pair| GapRange::try_from(pair).ok());
            if parsed.is_none() {
                warn!("ignoring malformed range {item} under {key}");
            }
            parsed
        })
        .collect();
    let merged = merge_ranges(parsed.clone());
    if merged.len() != parsed.len() {
        warn!(
            "merged overlapping ranges under {key}: {} stored, {} kept",
            parsed.len(),
            merged.len()
        );
    }
    merged
}

/// Sorts ranges by start and merges any that overlap or touch.
fn merge_ranges(mut ranges: Vec<GapRange>) -> Vec<GapRange> {
    ranges.sort_by_key(|r| (r.start(), r.end()));
    let mut merged: Vec<GapRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start() <= last.end().saturating_add(1) => {
                if range.end() > last.end() {
                    *last = GapRange::new(last.start(), range.end()).unwrap_or(*last);
                }
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Decodes a snapshot document, skipping every entry it cannot understand.
pub(crate) fn decode(doc: &Value) -> Conversations {
    let mut conversations = Conversations::new();
    let Some(map) = doc.as_object() else {
        warn!("progress snapshot is not a JSON object, starting empty");
        return conversations;
    };

    for (key, value) in map {
        let Some((id, field)) = parse_key(key) else {
            debug!("ignoring unrecognized snapshot key {key}");
            continue;
        };
        match field {
            Field::Cursor => match value.as_i64() {
                Some(cursor) => conversations.entry(id).or_default().cursor = Some(cursor),
                None if value.is_null() => {}
                None => warn!("ignoring {key}: cursor is not an integer"),
            },
            Field::Ranges => {
                let ranges = parse_ranges(key, value);
                if !ranges.is_empty() {
                    conversations.entry(id).or_default().gaps = ranges;
                }
            }
        }
    }
    conversations
}
