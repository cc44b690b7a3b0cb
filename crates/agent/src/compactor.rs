//! History compaction.
//!
//! Two ways to shrink a conversation that is approaching the context
//! window:
//!
//! - **Summarize**: ask the model for a bullet-point summary of the whole
//!   history and replace it with one system message.
//! - **Structural**: keep the first and last few messages and put a marker
//!   in between. No model call.
//!
//! Neither touches the conversation directly. They return the replacement
//! message list and the loop applies it.

use std::sync::Arc;

use cadence_config::AppConfig;
use cadence_core::message::{ACTION_COMPACTION, Message};
use cadence_core::observer::{self, StreamObserver};
use cadence_core::provider::{Provider, ProviderRequest};
use tracing::{debug, info, warn};

const SUMMARY_INSTRUCTIONS: &str = "\
You are compressing the history of a conversation between a user and an AI \
coding assistant so the work can continue with less context.

Summarize the transcript below as concise bullet points covering:
- The user's goals
- What has been accomplished so far
- Tools that were used and what they revealed
- Key decisions that were made
- Errors encountered and how they were resolved

Be specific about file names, commands and outcomes. Output only the bullet points.";

#[derive(Debug, Clone)]
pub struct CompactorSettings {
    pub model: String,
    /// Model context size in tokens
    pub context_window: usize,
    /// Fraction of the window that triggers compaction
    pub threshold: f64,
    /// Histories shorter than this are never summarized
    pub min_messages: usize,
    /// Per-message cap when building the summary transcript
    pub transcript_chars: usize,
    pub keep_head: usize,
    pub keep_tail: usize,
}

impl CompactorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let compaction = &config.compaction;
        Self {
            model: config.model.name.clone(),
            context_window: compaction.context_window,
            threshold: compaction.threshold,
            min_messages: compaction.min_messages,
            transcript_chars: compaction.transcript_chars,
            keep_head: compaction.keep_head,
            keep_tail: compaction.keep_tail,
        }
    }
}

impl Default for CompactorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Outcome of a compaction attempt.
#[derive(Debug, Clone)]
pub enum Compaction {
    /// History left as it is
    Skipped,
    /// History should be replaced by `messages`
    Replaced {
        messages: Vec<Message>,
        /// Whether a model summary was produced
        summarized: bool,
    },
}

impl Compaction {
    pub fn is_replaced(&self) -> bool {
        matches!(self, Self::Replaced { .. })
    }
}

/// Rough token count: total characters divided by four.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    messages.iter().map(Message::char_len).sum::<usize>() / 4
}

/// Keep `keep_head` leading and `keep_tail` trailing messages with a
/// marker between them. Returns `None` when nothing would be dropped.
pub fn structural_compact(
    messages: &[Message],
    keep_head: usize,
    keep_tail: usize,
) -> Option<Vec<Message>> {
    if messages.len() <= keep_head + keep_tail {
        return None;
    }
    let dropped = messages.len() - keep_head - keep_tail;
    let mut compacted = Vec::with_capacity(keep_head + keep_tail + 1);
    compacted.extend_from_slice(&messages[..keep_head]);
    compacted.push(
        Message::system(format!("[{dropped} earlier messages summarized]"))
            .with_action(ACTION_COMPACTION),
    );
    compacted.extend_from_slice(&messages[messages.len() - keep_tail..]);
    Some(compacted)
}

/// Shrinks histories on behalf of the conversation loop.
pub struct HistoryCompactor {
    provider: Arc<dyn Provider>,
    observer: Arc<dyn StreamObserver>,
    settings: CompactorSettings,
}

impl HistoryCompactor {
    pub fn new(provider: Arc<dyn Provider>, settings: CompactorSettings) -> Self {
        Self {
            provider,
            observer: observer::noop(),
            settings,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn StreamObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Whether the estimated size exceeds the configured share of the
    /// context window.
    pub fn should_compact(&self, messages: &[Message]) -> bool {
        let limit = self.settings.context_window as f64 * self.settings.threshold;
        estimate_tokens(messages) as f64 > limit
    }

    /// Summarize only when the history is over the threshold.
    pub async fn auto_compact_if_needed(&self, messages: &[Message]) -> Compaction {
        if !self.should_compact(messages) {
            return Compaction::Skipped;
        }
        info!(
            estimated_tokens = estimate_tokens(messages),
            context_window = self.settings.context_window,
            "History over threshold, compacting"
        );
        self.compact(messages).await
    }

    /// Structural trimming once the history is longer than the kept
    /// head and tail together. No model call is made.
    pub fn structural_if_needed(&self, messages: &[Message]) -> Compaction {
        match structural_compact(messages, self.settings.keep_head, self.settings.keep_tail) {
            Some(messages) => Compaction::Replaced {
                messages,
                summarized: false,
            },
            None => Compaction::Skipped,
        }
    }

    /// Replace the whole history with a model-written summary.
    ///
    /// If the model call fails the history is still replaced, by a marker
    /// recording how many messages were removed.
    pub async fn compact(&self, messages: &[Message]) -> Compaction {
        if messages.len() < self.settings.min_messages {
            debug!(messages = messages.len(), "Too few messages to compact");
            self.observer.emit(&format!(
                "ℹ️ Not enough history to compact ({} messages, need {})\n",
                messages.len(),
                self.settings.min_messages
            ));
            return Compaction::Skipped;
        }

        self.observer.emit("🗜️ Compacting conversation history...\n");
        let transcript = build_transcript(messages, self.settings.transcript_chars);
        let request = ProviderRequest::new(
            self.settings.model.clone(),
            vec![Message::system(SUMMARY_INSTRUCTIONS), Message::user(transcript)],
        );

        let summary = match self.provider.complete(request).await {
            Ok(response) if !response.message.content.trim().is_empty() => {
                Some(response.message.content.trim().to_string())
            }
            Ok(_) => {
                warn!("Compaction summary was empty");
                None
            }
            Err(e) => {
                warn!(error = %e, "Compaction summary failed");
                None
            }
        };

        let summarized = summary.is_some();
        let replacement = match summary {
            Some(summary) => Message::system(format!(
                "Summary of the conversation so far ({} messages):\n\n{summary}",
                messages.len()
            )),
            None => Message::system(format!(
                "[Conversation compacted: {} messages removed; summary unavailable]",
                messages.len()
            )),
        };

        info!(
            messages_before = messages.len(),
            summarized, "History compacted"
        );
        Compaction::Replaced {
            messages: vec![replacement.with_action(ACTION_COMPACTION)],
            summarized,
        }
    }
}

fn build_transcript(messages: &[Message], max_chars: usize) -> String {
    messages
        .iter()
        .map(|m| {
            let content: String = m.content.chars().take(max_chars).collect();
            let cut = if m.char_len() > max_chars { "..." } else { "" };
            format!("{}: {content}{cut}", m.role.as_str())
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
