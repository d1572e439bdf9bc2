//! Transcript aggregation for the live conversation
//!
//! Partial transcription fragments arrive per speaker. They are merged into a
//! single in-progress utterance and finalized into an immutable [`Turn`] when
//! the remote side signals turn completion.
//!
//! # Aggregation Strategy
//!
//! - **Same speaker**: fragments are joined with exactly one space
//! - **Speaker change**: the previous in-progress text is discarded
//! - **Turn complete**: non-empty text becomes a Turn; history keeps the last N

use std::collections::VecDeque;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default number of finalized turns kept in history.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Bracketed stage directions, parentheticals, emphasis markers and tags the
/// remote side may embed in transcription text.
static MARKUP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[[^\]]*\]|\([^)]*\)|\*[^*]*\*|<[^>]*>").expect("markup pattern is valid")
});

static WHITESPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    #[serde(alias = "maximus", alias = "model")]
    Agent,
}

impl Speaker {
    pub fn label(&self) -> &'static str {
        match self {
            Speaker::User => "User",
            Speaker::Agent => "Agent",
        }
    }
}

/// A finalized utterance. Serialized as `{id, text, sender, isComplete}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub id: String,
    pub text: String,
    #[serde(rename = "sender")]
    pub speaker: Speaker,
    pub is_complete: bool,
}

/// The utterance currently being assembled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Utterance {
    #[serde(rename = "sender")]
    pub speaker: Speaker,
    pub text: String,
}

/// Strip protocol markup and collapse whitespace.
pub fn sanitize(fragment: &str) -> String {
    let stripped = MARKUP.replace_all(fragment, " ");
    WHITESPACE.replace_all(&stripped, " ").trim().to_string()
}

/// Merges fragments into utterances and keeps a capped history of turns.
#[derive(Debug, Clone)]
pub struct TranscriptAggregator {
    current: Option<Utterance>,
    history: VecDeque<Turn>,
    limit: usize,
    fragment_count: u64,
}

impl Default for TranscriptAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl TranscriptAggregator {
    pub fn new(limit: usize) -> Self {
        Self {
            current: None,
            history: VecDeque::with_capacity(limit),
            limit: limit.max(1),
            fragment_count: 0,
        }
    }

    /// Start from previously persisted turns (trimmed to the limit).
    pub fn with_history(limit: usize, turns: Vec<Turn>) -> Self {
        let mut aggregator = Self::new(limit);
        aggregator.history.extend(turns);
        aggregator.trim();
        aggregator
    }

    /// Merge one partial fragment. Returns false if it sanitized to nothing.
    pub fn process_fragment(&mut self, speaker: Speaker, fragment: &str) -> bool {
        let text = sanitize(fragment);
        if text.is_empty() {
            return false;
        }
        self.fragment_count += 1;

        match &mut self.current {
            Some(utterance) if utterance.speaker == speaker => {
                if !utterance.text.is_empty() {
                    utterance.text.push(' ');
                }
                utterance.text.push_str(&text);
            }
            previous => {
                if let Some(dropped) = previous.as_ref().filter(|u| !u.text.is_empty()) {
                    log::debug!(
                        "TranscriptAggregator: speaker changed, discarding {} chars from {:?}",
                        dropped.text.len(),
                        dropped.speaker
                    );
                }
                *previous = Some(Utterance { speaker, text });
            }
        }
        true
    }

    /// Finalize the in-progress utterance, if any, and reset it.
    pub fn complete_turn(&mut self) -> Option<Turn> {
        let utterance = self.current.take()?;
        let text = utterance.text.trim().to_string();
        if text.is_empty() {
            return None;
        }

        let turn = Turn {
            id: Uuid::new_v4().to_string(),
            text,
            speaker: utterance.speaker,
            is_complete: true,
        };
        log::info!(
            "TranscriptAggregator: {} turn finalized ({} chars, {} fragments so far)",
            turn.speaker.label(),
            turn.text.len(),
            self.fragment_count
        );
        self.history.push_back(turn.clone());
        self.trim();
        Some(turn)
    }

    /// Drop the in-progress utterance without finalizing it.
    pub fn discard_in_progress(&mut self) {
        if let Some(utterance) = self.current.take() {
            log::debug!(
                "TranscriptAggregator: discarded in-progress {:?} utterance",
                utterance.speaker
            );
        }
    }

    fn trim(&mut self) {
        while self.history.len() > self.limit {
            self.history.pop_front();
        }
    }

    pub fn current(&self) -> Option<&Utterance> {
        self.current.as_ref()
    }

    pub fn has_in_progress(&self) -> bool {
        self.current.as_ref().map_or(false, |u| !u.text.is_empty())
    }

    pub fn history(&self) -> impl Iterator<Item = &Turn> {
        self.history.iter()
    }

    pub fn history_vec(&self) -> Vec<Turn> {
        self.history.iter().cloned().collect()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}
