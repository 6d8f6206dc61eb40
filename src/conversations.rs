//! Conversation records consumed by the trainer.
//!
//! Input is a JSON array of `{id, title, create_time, update_time, messages}`
//! objects, where each message is `{author, text}`. Timestamps are Unix
//! seconds as floats, the way chat exports write them.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("malformed conversation file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("conversation at position {0} has an empty id")]
    MissingId(usize),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub author: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub create_time: Option<f64>,
    #[serde(default)]
    pub update_time: Option<f64>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.create_time.and_then(timestamp_to_datetime)
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.update_time.and_then(timestamp_to_datetime)
    }
}

fn timestamp_to_datetime(ts: f64) -> Option<DateTime<Utc>> {
    if !ts.is_finite() {
        return None;
    }
    let floor = ts.floor();
    let secs = floor as i64;
    let nanos = ((ts - floor) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(secs, nanos)
}

/// Load conversations from a JSON file.
pub fn load_conversations(path: &Path) -> Result<Vec<Conversation>, ConversationError> {
    let data = std::fs::read(path).map_err(|source| ConversationError::Io {
        path: path.display().to_string(),
        source,
    })?;

    parse_conversations(&data).map_err(|e| match e {
        ConversationError::Parse { source, .. } => ConversationError::Parse {
            path: path.display().to_string(),
            source,
        },
        other => other,
    })
}

/// Parse conversations from raw JSON bytes.
pub fn parse_conversations(data: &[u8]) -> Result<Vec<Conversation>, ConversationError> {
    let conversations: Vec<Conversation> =
        serde_json::from_slice(data).map_err(|source| ConversationError::Parse {
            path: "<memory>".to_string(),
            source,
        })?;

    if let Some(idx) = conversations.iter().position(|c| c.id.trim().is_empty()) {
        return Err(ConversationError::MissingId(idx));
    }

    log::debug!("parsed {} conversations", conversations.len());
    Ok(conversations)
}
