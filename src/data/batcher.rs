// ============================================================
// Layer 4 — Dialogue Batcher
// ============================================================
// Implements Burn's Batcher trait to stack DialogueSamples into
// right-padded integer tensors.
//
// Layout for a batch of N samples:
//
//   src     [N, S]  context ids, padded with __null__
//   tgt_in  [N, T]  __start__ y1 y2 ... yk   (decoder input)
//   tgt_out [N, T]  y1 y2 ... yk __end__     (what we predict)
//
// S is the longest context in the batch (capped at max_seq_len,
// keeping the most recent tokens), T the longest target + 1.
//
// Samples with an empty context cannot be encoded and are dropped.
// `valid` records which input positions survived so replies can be
// mapped back to the right slot.

use burn::{data::dataloader::batcher::Batcher, prelude::*};

use crate::data::dataset::DialogueSample;
use crate::infra::dictionary::Dictionary;

// ─── DialogueBatch ────────────────────────────────────────────────────────────
#[derive(Debug, Clone)]
pub struct TargetTensors<B: Backend> {
    pub tgt_in:     Tensor<B, 2, Int>,
    pub tgt_out:    Tensor<B, 2, Int>,
    /// Non-pad positions of `tgt_out`
    pub num_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct DialogueBatch<B: Backend> {
    /// `None` when every sample had an empty context
    pub src:        Option<Tensor<B, 2, Int>>,
    /// Present when at least one sample carried a target
    pub targets:    Option<TargetTensors<B>>,
    /// Indices (into the input Vec) of the samples kept in the batch
    pub valid:      Vec<usize>,
    /// Candidate replies of the kept samples, not tensorised
    pub candidates: Vec<Vec<Vec<u32>>>,
}

impl<B: Backend> DialogueBatch<B> {
    pub fn is_empty(&self) -> bool {
        self.src.is_none()
    }

    pub fn size(&self) -> usize {
        self.valid.len()
    }
}

// ─── DialogueBatcher ──────────────────────────────────────────────────────────
#[derive(Clone, Debug)]
pub struct DialogueBatcher {
    null_idx:    u32,
    start_idx:   u32,
    end_idx:     u32,
    max_seq_len: usize,
}

impl DialogueBatcher {
    pub fn new(dict: &Dictionary, max_seq_len: usize) -> Self {
        Self {
            null_idx:  dict.null_idx(),
            start_idx: dict.start_idx(),
            end_idx:   dict.end_idx(),
            max_seq_len,
        }
    }

    /// Stack `items` on `device`. Used directly by the agent, and by the
    /// DataLoader through the Batcher impl below.
    pub fn build<B: Backend>(&self, items: &[DialogueSample], device: &B::Device) -> DialogueBatch<B> {
        let valid: Vec<usize> = items
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.context.is_empty())
            .map(|(i, _)| i)
            .collect();

        if valid.is_empty() {
            return DialogueBatch { src: None, targets: None, valid, candidates: Vec::new() };
        }

        // ── Source ────────────────────────────────────────────────────────────
        let contexts: Vec<&[u32]> = valid
            .iter()
            .map(|&i| {
                let ctx = items[i].context.as_slice();
                &ctx[ctx.len().saturating_sub(self.max_seq_len)..]
            })
            .collect();
        let src = self.pad::<B>(&contexts, device);

        // ── Targets ───────────────────────────────────────────────────────────
        let has_targets = valid.iter().any(|&i| items[i].target.is_some());
        let targets = has_targets.then(|| {
            // Reply length excluding the start / end marker
            let max_target = self.max_seq_len.saturating_sub(1).max(1);
            let replies: Vec<&[u32]> = valid
                .iter()
                .map(|&i| {
                    let t = items[i].target.as_deref().unwrap_or(&[]);
                    &t[..t.len().min(max_target)]
                })
                .collect();

            let tgt_in_rows: Vec<Vec<u32>> = replies
                .iter()
                .map(|r| std::iter::once(self.start_idx).chain(r.iter().copied()).collect())
                .collect();
            let tgt_out_rows: Vec<Vec<u32>> = replies
                .iter()
                .map(|r| r.iter().copied().chain(std::iter::once(self.end_idx)).collect())
                .collect();
            let num_tokens = tgt_out_rows.iter().map(Vec::len).sum();

            let tgt_in_refs: Vec<&[u32]> = tgt_in_rows.iter().map(Vec::as_slice).collect();
            let tgt_out_refs: Vec<&[u32]> = tgt_out_rows.iter().map(Vec::as_slice).collect();
            TargetTensors {
                tgt_in: self.pad::<B>(&tgt_in_refs, device),
                tgt_out: self.pad::<B>(&tgt_out_refs, device),
                num_tokens,
            }
        });

        let candidates = valid.iter().map(|&i| items[i].candidates.clone()).collect();

        DialogueBatch { src: Some(src), targets, valid, candidates }
    }

    fn pad<B: Backend>(&self, rows: &[&[u32]], device: &B::Device) -> Tensor<B, 2, Int> {
        let width = rows.iter().map(|r| r.len()).max().unwrap_or(0).max(1);
        let flat: Vec<i32> = rows
            .iter()
            .flat_map(|r| {
                r.iter()
                    .map(|&x| x as i32)
                    .chain(std::iter::repeat(self.null_idx as i32).take(width - r.len()))
            })
            .collect();

        Tensor::<B, 1, Int>::from_ints(flat.as_slice(), device).reshape([rows.len(), width])
    }
}

// ─── Burn Batcher Trait Implementation ────────────────────────────────────────
impl<B: Backend> Batcher<B, DialogueSample, DialogueBatch<B>> for DialogueBatcher {
    fn batch(&self, items: Vec<DialogueSample>, device: &B::Device) -> DialogueBatch<B> {
        self.build(&items, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn batcher(max_seq_len: usize) -> DialogueBatcher {
        DialogueBatcher { null_idx: 0, start_idx: 1, end_idx: 2, max_seq_len }
    }

    fn sample(context: Vec<u32>, target: Option<Vec<u32>>) -> DialogueSample {
        DialogueSample { context, target, candidates: vec![] }
    }

    fn rows(t: Tensor<TestBackend, 2, Int>) -> Vec<i64> {
        t.into_data().convert::<i64>().to_vec::<i64>().unwrap()
    }

    #[test]
    fn test_pads_source_and_targets() {
        let device = Default::default();
        let items = vec![sample(vec![5, 6, 7], Some(vec![8])), sample(vec![9], Some(vec![10, 11]))];
        let batch: DialogueBatch<TestBackend> = batcher(100).build(&items, &device);

        let src = batch.src.unwrap();
        assert_eq!(src.dims(), [2, 3]);
        assert_eq!(rows(src), vec![5, 6, 7, 9, 0, 0]);

        let t = batch.targets.unwrap();
        assert_eq!(rows(t.tgt_in), vec![1, 8, 0, 1, 10, 11]);
        assert_eq!(rows(t.tgt_out), vec![8, 2, 0, 10, 11, 2]);
        assert_eq!(t.num_tokens, 5);
    }

    #[test]
    fn test_empty_contexts_are_dropped() {
        let device = Default::default();
        let items = vec![sample(vec![], Some(vec![8])), sample(vec![5], None)];
        let batch: DialogueBatch<TestBackend> = batcher(100).build(&items, &device);
        assert_eq!(batch.valid, vec![1]);
        assert!(batch.targets.is_none());
    }

    #[test]
    fn test_all_empty_gives_empty_batch() {
        let device = Default::default();
        let batch: DialogueBatch<TestBackend> =
            batcher(100).build(&[sample(vec![], None)], &device);
        assert!(batch.is_empty());
        assert_eq!(batch.size(), 0);
    }

    #[test]
    fn test_long_context_keeps_latest_tokens() {
        let device = Default::default();
        let batch: DialogueBatch<TestBackend> =
            batcher(2).build(&[sample(vec![5, 6, 7], None)], &device);
        assert_eq!(rows(batch.src.unwrap()), vec![6, 7]);
    }

    #[test]
    fn test_missing_target_becomes_end_only() {
        let device = Default::default();
        let items = vec![sample(vec![5], Some(vec![8])), sample(vec![6], None)];
        let batch: DialogueBatch<TestBackend> = batcher(100).build(&items, &device);
        let t = batch.targets.unwrap();
        assert_eq!(rows(t.tgt_out), vec![8, 2, 2, 0]);
    }
}
