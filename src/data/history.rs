// ============================================================
// Layer 4 — Dialogue History
// ============================================================
// The model never sees a single message in isolation: its input
// is the running conversation, flattened into one token sequence.
//
// Each turn:
//   1. If the previous turn closed the episode, start from scratch
//      (and ignore any reply, it belongs to the old conversation).
//   2. Append "our" previous reply, chosen by HistoryReplies:
//        model            → what the model said
//        label            → the gold label
//        label_else_model → gold label if known, else model reply
//        none             → nothing
//   3. Append the partner's new text.
//
// With person tokens, replies are prefixed by __start__ and
// partner texts by __end__ so the model can tell speakers apart.
// When `max_len` is set only the most recent tokens are kept.

use anyhow::Result;
use std::collections::VecDeque;

use crate::domain::{dialogue::Message, options::HistoryReplies};
use crate::infra::dictionary::Dictionary;

#[derive(Debug, Clone)]
pub struct DialogueHistory {
    tokens:        VecDeque<u32>,
    max_len:       Option<usize>,
    replies:       HistoryReplies,
    person_tokens: bool,
    episode_done:  bool,
    /// First gold label of the previous turn, already vectorised
    last_label:    Option<Vec<u32>>,
}

impl DialogueHistory {
    pub fn new(max_len: Option<usize>, replies: HistoryReplies, person_tokens: bool) -> Self {
        Self {
            tokens: VecDeque::new(),
            max_len,
            replies,
            person_tokens,
            episode_done: false,
            last_label: None,
        }
    }

    /// Fold `message` (and our previous reply) into the history and
    /// return the resulting model input.
    pub fn update(
        &mut self,
        message:     &Message,
        model_reply: Option<&[u32]>,
        dict:        &Dictionary,
    ) -> Result<Vec<u32>> {
        let mut replies = self.replies;
        if self.episode_done {
            self.clear();
            replies = HistoryReplies::None;
        }

        let reply: Option<Vec<u32>> = match replies {
            HistoryReplies::None => None,
            HistoryReplies::Model => model_reply.map(|r| self.mark_reply(r, dict)),
            HistoryReplies::LabelElseModel if self.last_label.is_none() => {
                model_reply.map(|r| self.mark_reply(r, dict))
            }
            HistoryReplies::Label | HistoryReplies::LabelElseModel => self.last_label.clone(),
        };
        if let Some(reply) = reply {
            self.extend(&reply);
        }

        if !message.text.is_empty() {
            if self.person_tokens {
                self.extend(&[dict.end_idx()]);
            }
            let text = dict.txt2vec(&message.text)?;
            self.extend(&text);
        }

        self.episode_done = message.episode_done;
        // Unlabelled turns keep the previous label
        if let Some(label) = message.labels.first() {
            self.last_label = Some(self.mark_reply(&dict.txt2vec(label)?, dict));
        }

        Ok(self.tokens.iter().copied().collect())
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
        self.last_label = None;
        self.episode_done = false;
    }

    fn mark_reply(&self, reply: &[u32], dict: &Dictionary) -> Vec<u32> {
        let mut out = Vec::with_capacity(reply.len() + 1);
        if self.person_tokens {
            out.push(dict.start_idx());
        }
        out.extend_from_slice(reply);
        out
    }

    fn extend(&mut self, ids: &[u32]) {
        self.tokens.extend(ids.iter().copied());
        if let Some(max) = self.max_len {
            while self.tokens.len() > max {
                self.tokens.pop_front();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::options::DictOptions;

    fn dict() -> Dictionary {
        Dictionary::build(&["hi there", "how are you", "fine thanks", "bye"], &DictOptions::default())
            .unwrap()
    }

    fn text(d: &Dictionary, ids: &[u32]) -> String {
        d.vec2txt(ids)
    }

    #[test]
    fn test_labels_feed_back_into_history() {
        let d = dict();
        let mut h = DialogueHistory::new(None, HistoryReplies::LabelElseModel, false);
        h.update(&Message::new("hi there").with_labels(["how are you"]), None, &d)
            .unwrap();
        let ctx = h
            .update(&Message::new("fine thanks").with_labels(["bye"]), None, &d)
            .unwrap();
        assert_eq!(text(&d, &ctx), "hi there how are you fine thanks");
    }

    #[test]
    fn test_unlabelled_turn_keeps_previous_label() {
        let d = dict();
        let mut h = DialogueHistory::new(None, HistoryReplies::Label, false);
        h.update(&Message::new("hi there").with_labels(["bye"]), None, &d).unwrap();
        h.update(&Message::new("how are you"), None, &d).unwrap();
        let ctx = h.update(&Message::new("fine thanks"), None, &d).unwrap();
        assert_eq!(text(&d, &ctx), "hi there bye how are you bye fine thanks");
    }

    #[test]
    fn test_model_reply_used_without_label() {
        let d = dict();
        let mut h = DialogueHistory::new(None, HistoryReplies::LabelElseModel, false);
        h.update(&Message::new("hi there"), None, &d).unwrap();
        let reply = d.txt2vec("bye").unwrap();
        let ctx = h.update(&Message::new("how are you"), Some(&reply), &d).unwrap();
        assert_eq!(text(&d, &ctx), "hi there bye how are you");
    }

    #[test]
    fn test_none_mode_ignores_replies() {
        let d = dict();
        let mut h = DialogueHistory::new(None, HistoryReplies::None, false);
        h.update(&Message::new("hi there").with_labels(["bye"]), None, &d)
            .unwrap();
        let ctx = h.update(&Message::new("how are you"), None, &d).unwrap();
        assert_eq!(text(&d, &ctx), "hi there how are you");
    }

    #[test]
    fn test_episode_end_resets_history() {
        let d = dict();
        let mut h = DialogueHistory::new(None, HistoryReplies::Label, false);
        h.update(&Message::new("hi there").with_labels(["bye"]).done(true), None, &d)
            .unwrap();
        let ctx = h.update(&Message::new("how are you"), None, &d).unwrap();
        assert_eq!(text(&d, &ctx), "how are you");
    }

    #[test]
    fn test_truncation_keeps_latest_tokens() {
        let d = dict();
        let mut h = DialogueHistory::new(Some(3), HistoryReplies::None, false);
        let ctx = h.update(&Message::new("hi there how are you"), None, &d).unwrap();
        assert_eq!(text(&d, &ctx), "how are you");
    }

    #[test]
    fn test_person_tokens_mark_speakers() {
        let d = dict();
        let mut h = DialogueHistory::new(None, HistoryReplies::Label, true);
        h.update(&Message::new("hi").with_labels(["bye"]), None, &d).unwrap();
        let ctx = h.update(&Message::new("bye"), None, &d).unwrap();
        assert_eq!(ctx[0], d.end_idx());
        assert!(ctx.contains(&d.start_idx()));
    }
}
