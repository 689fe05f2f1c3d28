// ============================================================
// Layer 4 — Dialogue Samples & Dataset
// ============================================================
// Turns whole episodes into independent (context, target) pairs
// the DataLoader can shuffle freely.
//
// Every episode is replayed through a fresh DialogueHistory with
// the gold labels standing in for our replies, so sample i holds
// exactly what the model would see at turn i of the conversation.
//
//   episode:  [hi → hello] [how are you → fine]
//   samples:  ctx "hi"                         → "hello"
//             ctx "hi hello how are you"        → "fine"

use anyhow::Result;
use burn::data::dataset::Dataset;
use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};

use crate::data::history::DialogueHistory;
use crate::domain::{
    dialogue::Episode,
    options::{AgentOptions, HistoryReplies},
};
use crate::infra::dictionary::Dictionary;

/// One vectorised turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueSample {
    pub context:    Vec<u32>,
    /// Gold reply without `__end__`; `None` for unlabelled turns
    pub target:     Option<Vec<u32>>,
    pub candidates: Vec<Vec<u32>>,
}

impl DialogueSample {
    pub fn target_len(&self) -> usize {
        self.target.as_ref().map_or(0, |t| t.len())
    }
}

// ─── SampleBuilder ────────────────────────────────────────────────────────────
pub struct SampleBuilder<'a> {
    dict:          &'a Dictionary,
    truncate:      Option<usize>,
    replies:       HistoryReplies,
    person_tokens: bool,
}

impl<'a> SampleBuilder<'a> {
    pub fn new(dict: &'a Dictionary, opts: &AgentOptions) -> Self {
        // There is no model output while building offline, so the
        // model-only mode falls back to the gold labels.
        let replies = match opts.history_replies {
            HistoryReplies::Model => HistoryReplies::LabelElseModel,
            other => other,
        };
        Self {
            dict,
            truncate: opts.truncate,
            replies,
            person_tokens: opts.person_tokens,
        }
    }

    /// Replay `episodes` and collect one sample per turn. When a turn has
    /// several labels one is picked at random as the target.
    pub fn build<R: Rng>(&self, episodes: &[Episode], rng: &mut R) -> Result<Vec<DialogueSample>> {
        let mut samples = Vec::new();
        let mut skipped = 0usize;

        for episode in episodes {
            let mut history = DialogueHistory::new(self.truncate, self.replies, self.person_tokens);
            for message in episode {
                let context = history.update(message, None, self.dict)?;
                if context.is_empty() {
                    skipped += 1;
                    continue;
                }

                let target = match message.labels.choose(rng) {
                    Some(label) => Some(self.vectorise_reply(label)?),
                    None => None,
                };
                let candidates = message
                    .label_candidates
                    .iter()
                    .map(|c| self.vectorise_reply(c))
                    .collect::<Result<Vec<_>>>()?;

                samples.push(DialogueSample { context, target, candidates });
            }
        }

        if skipped > 0 {
            tracing::debug!("Skipped {skipped} turns with empty context");
        }
        tracing::info!("Built {} samples from {} episodes", samples.len(), episodes.len());
        Ok(samples)
    }

    fn vectorise_reply(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = self.dict.txt2vec(text)?;
        if let Some(max) = self.truncate {
            ids.truncate(max);
        }
        Ok(ids)
    }
}

// ─── DialogueDataset ──────────────────────────────────────────────────────────
#[derive(Debug, Clone)]
pub struct DialogueDataset {
    samples: Vec<DialogueSample>,
}

impl DialogueDataset {
    pub fn new(samples: Vec<DialogueSample>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[DialogueSample] {
        &self.samples
    }

    /// Number of target tokens including the `__end__` of every reply.
    pub fn target_tokens(&self) -> usize {
        self.samples
            .iter()
            .filter(|s| s.target.is_some())
            .map(|s| s.target_len() + 1)
            .sum()
    }
}

impl Dataset<DialogueSample> for DialogueDataset {
    fn get(&self, index: usize) -> Option<DialogueSample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{dialogue::Message, options::DictOptions};
    use rand::{rngs::StdRng, SeedableRng};

    fn dict() -> Dictionary {
        Dictionary::build(
            &["hi", "hello", "how are you", "fine thanks", "bye"],
            &DictOptions::default(),
        )
        .unwrap()
    }

    fn episode() -> Episode {
        vec![
            Message::new("hi").with_labels(["hello"]),
            Message::new("how are you")
                .with_labels(["fine thanks"])
                .with_candidates(["fine thanks", "bye"])
                .done(true),
        ]
    }

    #[test]
    fn test_one_sample_per_turn_with_history() {
        let d = dict();
        let builder = SampleBuilder::new(&d, &AgentOptions::default());
        let samples = builder.build(&[episode()], &mut StdRng::seed_from_u64(0)).unwrap();

        assert_eq!(samples.len(), 2);
        assert_eq!(d.vec2txt(&samples[0].context), "hi");
        assert_eq!(d.vec2txt(&samples[1].context), "hi hello how are you");
        assert_eq!(d.vec2txt(samples[1].target.as_ref().unwrap()), "fine thanks");
        assert_eq!(samples[1].candidates.len(), 2);
    }

    #[test]
    fn test_episodes_do_not_leak_into_each_other() {
        let d = dict();
        let builder = SampleBuilder::new(&d, &AgentOptions::default());
        let samples = builder
            .build(&[episode(), episode()], &mut StdRng::seed_from_u64(0))
            .unwrap();
        assert_eq!(samples[2].context, samples[0].context);
    }

    #[test]
    fn test_targets_are_truncated() {
        let d = dict();
        let opts = AgentOptions {
            truncate: Some(1),
            ..Default::default()
        };
        let samples = SampleBuilder::new(&d, &opts)
            .build(&[episode()], &mut StdRng::seed_from_u64(0))
            .unwrap();
        assert_eq!(samples[1].target_len(), 1);
    }

    #[test]
    fn test_empty_context_is_skipped() {
        let d = dict();
        let ep = vec![Message::new("").with_labels(["hello"]).done(true)];
        let samples = SampleBuilder::new(&d, &AgentOptions::default())
            .build(&[ep], &mut StdRng::seed_from_u64(0))
            .unwrap();
        assert!(samples.is_empty());
    }

    #[test]
    fn test_dataset_counts_end_tokens() {
        let ds = DialogueDataset::new(vec![
            DialogueSample { context: vec![4], target: Some(vec![5, 6]), candidates: vec![] },
            DialogueSample { context: vec![4], target: None, candidates: vec![] },
        ]);
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.target_tokens(), 3);
        assert!(ds.get(5).is_none());
    }
}
