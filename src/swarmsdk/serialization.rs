//! Snapshot/restore contract for agent conversation state.
//!
//! A snapshot is an opaque, JSON-serializable blob capturing everything an
//! agent chat needs to resume exactly where it left off: the message array,
//! pending ephemeral entries, the one-shot compression flag, the last
//! TodoWrite index, the active skill, and the token counters.  The
//! roundtrip is exact: restoring a snapshot yields a state that is
//! indistinguishable from the original under all observations.
//!
//! This is a serialization contract, not a store — persistence, transport,
//! and versioning are the caller's concern.

use crate::swarmsdk::llm_client::{Message, TokenUsage};
use crate::swarmsdk::skill::SkillState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;

/// Serialized agent chat state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSnapshot {
    /// The persistent conversation, in append order.
    pub messages: Vec<Message>,
    /// Pending ephemeral reminders, keyed by message index.
    #[serde(default)]
    pub ephemerals: BTreeMap<usize, Vec<String>>,
    /// Whether the one-shot compression pass has already run.
    #[serde(default)]
    pub compression_applied: bool,
    /// Index of the most recent TodoWrite tool result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_todo_index: Option<usize>,
    /// Active skill, if one is loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<SkillState>,
    /// Cumulative token usage for the agent.
    #[serde(default)]
    pub usage: TokenUsage,
}

/// Errors raised by snapshot/restore.
#[derive(Debug, Clone)]
pub enum SnapshotError {
    /// The live state could not be serialized.
    Serialize(String),
    /// The blob could not be decoded into a snapshot.
    Corrupt(String),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::Serialize(msg) => write!(f, "snapshot serialization failed: {}", msg),
            SnapshotError::Corrupt(msg) => write!(f, "snapshot blob is corrupt: {}", msg),
        }
    }
}

impl Error for SnapshotError {}
