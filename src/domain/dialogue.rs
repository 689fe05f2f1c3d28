// ============================================================
// Layer 3 — Dialogue Domain Types
// ============================================================
// A conversation is a sequence of turns. Each turn the partner
// says something (`text`) and, in supervised data, we also know
// what a good reply would have been (`labels`).
//
// Example (persona chat):
//   text:   "your persona: i like cats.\nhi! how are you?"
//   labels: ["i am great, just fed my cat."]
//
// Some datasets also ship a list of candidate replies so a model
// can be scored on ranking instead of free generation.

use serde::{Deserialize, Serialize};

/// One turn of a dialogue as seen by the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// What the partner said this turn (may contain '\n'-joined context)
    pub text: String,

    /// Gold replies; empty when the turn is unlabelled (e.g. chatting)
    pub labels: Vec<String>,

    /// Optional candidate replies used for ranking
    pub label_candidates: Vec<String>,

    /// True on the last turn of a conversation
    pub episode_done: bool,
}

impl Message {
    /// Create an unlabelled message, e.g. a line typed by a human.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// Attach gold labels to the message.
    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    /// Attach candidate replies to the message.
    pub fn with_candidates<I, S>(mut self, cands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.label_candidates = cands.into_iter().map(Into::into).collect();
        self
    }

    /// Mark whether this message closes its episode.
    pub fn done(mut self, episode_done: bool) -> Self {
        self.episode_done = episode_done;
        self
    }

    pub fn has_labels(&self) -> bool {
        !self.labels.is_empty()
    }
}

/// A full conversation, in order.
pub type Episode = Vec<Message>;

/// What the agent sends back for one observation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Identifier of the replying agent
    pub id: String,

    /// Generated response; `None` when the observation had no usable text
    pub text: Option<String>,

    /// Candidates ordered best-first, when ranking was requested
    pub text_candidates: Vec<String>,
}

impl Reply {
    pub fn empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_fields() {
        let m = Message::new("hi")
            .with_labels(["hello"])
            .with_candidates(["hello", "bye"])
            .done(true);
        assert_eq!(m.text, "hi");
        assert!(m.has_labels());
        assert_eq!(m.label_candidates.len(), 2);
        assert!(m.episode_done);
    }

    #[test]
    fn test_new_message_is_unlabelled() {
        let m = Message::new("just chatting");
        assert!(!m.has_labels());
        assert!(!m.episode_done);
    }
}
