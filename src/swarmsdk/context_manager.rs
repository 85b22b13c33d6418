//! Conversation context management: ephemeral reminders and progressive
//! compression.
//!
//! The [`ContextManager`] sits between an agent's persistent message array
//! and the LLM.  It owns two mechanisms:
//!
//! - **Ephemeral reminders.**  Short instruction blocks
//!   (`<system-reminder>…</system-reminder>`) are attached to a message *by
//!   index* and embedded into a deep-cloned copy of the conversation only at
//!   the moment of sending.  They are sent exactly once: after every LLM
//!   round-trip — success, failure, or timeout — the pending entries are
//!   cleared, and the persistent messages never contain reminder text.
//!
//! - **Progressive compression.**  When the conversation approaches the
//!   model's context window, old `tool`-role results are truncated by age
//!   bucket while the recent tail and all user/assistant messages stay
//!   intact.  Compression runs at most once per conversation unless
//!   explicitly reset.
//!
//! ```text
//! messages ──► prepare_for_llm ──► clone + embed reminders ──► LLM
//!     ▲                                                        │
//!     └───────────── clear_ephemeral (always paired) ◄─────────┘
//! ```

use crate::swarmsdk::llm_client::Message;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;

lazy_static! {
    static ref REMINDER_RE: Regex =
        Regex::new(r"(?s)<system-reminder>(.*?)</system-reminder>").expect("reminder regex");
}

/// Split reminder blocks out of `content`.
///
/// Returns the content with every `<system-reminder>` block removed plus the
/// inner text of each block, in document order.  Surrounding whitespace left
/// behind by the removal is trimmed.
pub fn extract_reminders(content: &str) -> (String, Vec<String>) {
    if !content.contains("<system-reminder>") {
        return (content.to_string(), Vec::new());
    }
    let mut reminders = Vec::new();
    for capture in REMINDER_RE.captures_iter(content) {
        if let Some(inner) = capture.get(1) {
            let text = inner.as_str().trim();
            if !text.is_empty() {
                reminders.push(text.to_string());
            }
        }
    }
    let cleaned = REMINDER_RE.replace_all(content, "").trim().to_string();
    (cleaned, reminders)
}

/// Wrap `text` in a reminder block so it survives one hop through message
/// content before being re-extracted as an ephemeral.
pub fn wrap_reminder(text: &str) -> String {
    format!("<system-reminder>\n{}\n</system-reminder>", text)
}

/// Estimate token usage of a message array: one token per four characters,
/// plus a small per-message overhead for role framing.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    messages
        .iter()
        .map(|m| 4 + m.content.len() / 4)
        .sum::<usize>()
}

/// Character budget for a tool result at the given age, measured in messages
/// from the end of the conversation.  `None` means keep in full.
fn bucket_limit(age: usize) -> Option<usize> {
    match age {
        0..=10 => None,
        11..=20 => Some(1000),
        21..=40 => Some(500),
        41..=60 => Some(200),
        _ => Some(100),
    }
}

/// Heuristic for tool results that are cheap to regenerate: search/listing
/// style outputs whose leading text advertises a recomputable summary.
fn looks_idempotent(content: &str) -> bool {
    let head: String = content.chars().take(120).collect::<String>().to_lowercase();
    const PREFIXES: &[&str] = &[
        "found ",
        "matches in ",
        "no matches",
        "listing ",
        "contents of ",
        "directory listing",
        "search results",
    ];
    PREFIXES.iter().any(|p| head.starts_with(p)) || head.contains("matches in")
}

/// Result of one compression pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompressionStats {
    /// Total content characters before the pass.
    pub chars_before: usize,
    /// Total content characters after the pass.
    pub chars_after: usize,
    /// Number of tool messages that were truncated.
    pub messages_truncated: usize,
}

/// Per-conversation context state: pending ephemerals, compression flag, and
/// the index of the most recent TodoWrite result.
#[derive(Debug, Default)]
pub struct ContextManager {
    /// Pending reminders keyed by index into the persistent message array.
    ephemerals: BTreeMap<usize, Vec<String>>,
    compression_applied: bool,
    last_todo_index: Option<usize>,
}

impl ContextManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a reminder to the message at `index`.  Multiple reminders on
    /// one index are embedded in attachment order.
    pub fn add_reminder(&mut self, index: usize, reminder: impl Into<String>) {
        self.ephemerals.entry(index).or_default().push(reminder.into());
    }

    /// True when at least one reminder is pending.
    pub fn has_ephemerals(&self) -> bool {
        !self.ephemerals.is_empty()
    }

    /// Borrow the pending entries (index → reminders), for serialization.
    pub fn ephemeral_entries(&self) -> &BTreeMap<usize, Vec<String>> {
        &self.ephemerals
    }

    /// Replace the pending entries wholesale, for restore.
    pub fn set_ephemeral_entries(&mut self, entries: BTreeMap<usize, Vec<String>>) {
        self.ephemerals = entries;
    }

    /// Produce the message array actually sent to the LLM: a deep clone in
    /// which each message with pending reminders has them appended to its
    /// text content.  Role, tool-call ids, and tool calls are preserved.
    ///
    /// Indices past the end of `messages` are ignored; they can only arise
    /// from external pruning, which is required to invalidate ephemerals
    /// via [`clear_ephemeral`](ContextManager::clear_ephemeral) anyway.
    pub fn prepare_for_llm(&self, messages: &[Message]) -> Vec<Message> {
        if self.ephemerals.is_empty() {
            return messages.to_vec();
        }
        let mut prepared: Vec<Message> = messages.to_vec();
        for (&index, reminders) in &self.ephemerals {
            if let Some(message) = prepared.get_mut(index) {
                let joined = reminders.join("\n\n");
                if message.content.is_empty() {
                    message.content = joined;
                } else {
                    message.content = format!("{}\n\n{}", message.content, joined);
                }
            }
        }
        prepared
    }

    /// Drop all pending reminders.  Called after every LLM round-trip and
    /// whenever message indices shift (pruning, restore).
    pub fn clear_ephemeral(&mut self) {
        self.ephemerals.clear();
    }

    /// Whether compression has already run for this conversation.
    pub fn compression_applied(&self) -> bool {
        self.compression_applied
    }

    /// Mark/unmark the one-shot compression flag (restore, explicit reset).
    pub fn set_compression_applied(&mut self, applied: bool) {
        self.compression_applied = applied;
    }

    /// Index of the most recent TodoWrite tool result, if any.
    pub fn last_todo_index(&self) -> Option<usize> {
        self.last_todo_index
    }

    /// Record the message index of a TodoWrite tool result.
    pub fn note_todo_index(&mut self, index: usize) {
        self.last_todo_index = Some(index);
    }

    /// Replace the TodoWrite index wholesale, for restore.
    pub fn set_last_todo_index(&mut self, index: Option<usize>) {
        self.last_todo_index = index;
    }

    /// Reset everything (conversation cleared).
    pub fn reset(&mut self) {
        self.ephemerals.clear();
        self.compression_applied = false;
        self.last_todo_index = None;
    }

    /// Truncate old tool results in place, by age bucket.
    ///
    /// Messages in the recent tail (the last `recent_tail` messages) and all
    /// user/assistant/system messages are never touched.  Each truncated
    /// result gains a notice, plus a re-run hint when the output looks like
    /// a recomputable search or listing.  One-shot: a second call without an
    /// intervening [`set_compression_applied(false)`] is a no-op.
    ///
    /// [`set_compression_applied(false)`]: ContextManager::set_compression_applied
    pub fn compress(&mut self, messages: &mut Vec<Message>, recent_tail: usize) -> CompressionStats {
        if self.compression_applied {
            return CompressionStats::default();
        }
        let mut stats = CompressionStats {
            chars_before: messages.iter().map(|m| m.content.len()).sum(),
            ..CompressionStats::default()
        };
        let total = messages.len();
        for (index, message) in messages.iter_mut().enumerate() {
            if message.role != crate::swarmsdk::llm_client::Role::Tool {
                continue;
            }
            let age = total.saturating_sub(1) - index;
            if age < recent_tail {
                continue;
            }
            let limit = match bucket_limit(age) {
                Some(limit) => limit,
                None => continue,
            };
            if message.content.len() <= limit {
                continue;
            }
            let truncated: String = message.content.chars().take(limit).collect();
            let mut notice = format!(
                "{}\n\n[Tool result truncated after {} characters.]",
                truncated, limit
            );
            if looks_idempotent(&message.content) {
                notice.push_str(
                    " The call that produced it is cheap to re-run if the full output is needed.",
                );
            }
            message.content = notice;
            stats.messages_truncated += 1;
        }
        stats.chars_after = messages.iter().map(|m| m.content.len()).sum();
        self.compression_applied = true;
        stats
    }
}
