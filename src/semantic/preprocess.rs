//! Text preparation for embedding generation.
//!
//! Turns a conversation into the text segments that get embedded:
//! 1. Render each message as `author: text`
//! 2. Group messages according to the embedding strategy
//! 3. Join each group with newlines
//!
//! Also provides the tokenizer used by the hashed fallback embedder and
//! content hashing for cache validation.

use std::fmt;
use std::str::FromStr;

use crate::conversations::{Conversation, Message};
use crate::semantic::embeddings::EmbeddingError;

/// Default number of messages per chunk for the `chunks` strategy
pub const DEFAULT_CHUNK_SIZE: usize = 5;

/// Maximum snippet length stored in row metadata (characters)
const MAX_SNIPPET_LENGTH: usize = 200;

/// Ellipsis suffix when a snippet is truncated
const TRUNCATION_SUFFIX: &str = "...";

/// How a conversation is split into embedding rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmbeddingStrategy {
    /// One row over the whole conversation
    Full,
    /// One row per message
    Messages,
    /// One row per group of consecutive messages
    Chunks,
}

impl EmbeddingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingStrategy::Full => "full",
            EmbeddingStrategy::Messages => "messages",
            EmbeddingStrategy::Chunks => "chunks",
        }
    }
}

impl fmt::Display for EmbeddingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmbeddingStrategy {
    type Err = EmbeddingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "full" => Ok(EmbeddingStrategy::Full),
            "messages" => Ok(EmbeddingStrategy::Messages),
            "chunks" => Ok(EmbeddingStrategy::Chunks),
            _ => Err(EmbeddingError::UnknownStrategy(s.to_string())),
        }
    }
}

/// A piece of a conversation that becomes one embedding row.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Text that gets embedded
    pub text: String,
    /// Index of the first message covered by this segment
    pub message_start: usize,
    /// Number of messages covered
    pub message_count: usize,
}

/// Render a single message for embedding.
pub fn render_message(message: &Message) -> String {
    format!("{}: {}", message.author.trim(), message.text.trim())
}

/// Join a run of messages into one text block.
pub fn render_messages(messages: &[Message]) -> String {
    messages
        .iter()
        .map(render_message)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Split a conversation into segments for the given strategy.
///
/// Row counts: `Full` always yields 1, `Messages` yields one per message,
/// `Chunks` yields `ceil(n / chunk_size)`.
pub fn segment_conversation(
    conversation: &Conversation,
    strategy: EmbeddingStrategy,
    chunk_size: usize,
) -> Vec<Segment> {
    let messages = &conversation.messages;

    match strategy {
        EmbeddingStrategy::Full => vec![Segment {
            text: render_messages(messages),
            message_start: 0,
            message_count: messages.len(),
        }],
        EmbeddingStrategy::Messages => messages
            .iter()
            .enumerate()
            .map(|(idx, message)| Segment {
                text: render_message(message),
                message_start: idx,
                message_count: 1,
            })
            .collect(),
        EmbeddingStrategy::Chunks => {
            let chunk_size = chunk_size.max(1);
            messages
                .chunks(chunk_size)
                .enumerate()
                .map(|(idx, chunk)| Segment {
                    text: render_messages(chunk),
                    message_start: idx * chunk_size,
                    message_count: chunk.len(),
                })
                .collect()
        }
    }
}

/// Truncate text for display in metadata, adding ellipsis if truncated.
pub fn snippet(content: &str) -> String {
    let content = content.trim();
    if content.chars().count() <= MAX_SNIPPET_LENGTH {
        return content.to_string();
    }

    let max_chars = MAX_SNIPPET_LENGTH - TRUNCATION_SUFFIX.len();
    let truncated: String = content.chars().take(max_chars).collect();

    format!("{}{}", truncated, TRUNCATION_SUFFIX)
}

/// Tokenize text into lowercase terms.
/// Filters out very short terms (1 char) and common stop words.
pub fn tokenize(text: &str) -> Vec<String> {
    const STOP_WORDS: &[&str] = &[
        "a", "an", "the", "is", "are", "was", "were", "be", "been", "being",
        "in", "on", "at", "to", "for", "of", "with", "by", "from", "as",
        "and", "or", "but", "not", "no", "so", "if", "then",
    ];

    text.split(|c: char| !c.is_alphanumeric())
        .map(|s| s.to_lowercase())
        .filter(|s| s.chars().count() > 1 && !STOP_WORDS.contains(&s.as_str()))
        .collect()
}

/// SHA-256 of the trimmed segment text, for cache validation.
pub fn content_hash(text: &str) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(text.trim().as_bytes());
    hex::encode(hasher.finalize())
}
