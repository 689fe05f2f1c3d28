// ============================================================
// Layer 5 — Decoding
// ============================================================
// Turns a trained Seq2Seq into replies.
//
//   greedy      beam_size = 1, topk = 1   argmax at every step
//   top-k       topk > 1                  sample among the k best
//   beam search beam_size > 1             keep the best partial replies
//
// Every strategy starts from __start__ and stops at __end__ or
// after `max_len` tokens. The returned ids contain neither marker.
//
// Also here: candidate ranking (mean token log-prob of each
// candidate) and the next-word distribution used for word-level
// perplexity.

use std::collections::HashMap;

use burn::{prelude::*, tensor::activation::log_softmax};
use rand::{distributions::WeightedIndex, prelude::Distribution, Rng};

use crate::ml::model::{Encoded, Seq2Seq};

/// Probability returned for words the model never scored.
pub const UNSEEN_WORD_PROB: f64 = 1e-7;

#[derive(Debug, Clone)]
pub struct DecodeSettings {
    pub start_idx:    u32,
    pub end_idx:      u32,
    pub pad_idx:      u32,
    pub max_len:      usize,
    pub beam_size:    usize,
    pub topk:         usize,
    /// Length normalisation exponent for beam search (0 = raw sum)
    pub length_alpha: f32,
}

/// Pick the strategy from the settings and decode every row of `src`.
pub fn generate<B: Backend, R: Rng>(
    model:    &Seq2Seq<B>,
    src:      Tensor<B, 2, Int>,
    settings: &DecodeSettings,
    rng:      &mut R,
) -> Vec<Vec<u32>> {
    let encoded = model.encode(src);
    if settings.beam_size > 1 {
        (0..encoded.batch_size())
            .map(|row| beam_search(model, &encoded.select(&[row]), settings))
            .collect()
    } else {
        sample_or_greedy(model, &encoded, settings, rng)
    }
}

/// Log-probabilities of the next token after each prefix. All prefixes
/// must have the same length and line up with the rows of `encoded`.
fn next_log_probs<B: Backend>(
    model:    &Seq2Seq<B>,
    encoded:  &Encoded<B>,
    prefixes: &[Vec<u32>],
) -> Vec<Vec<f32>> {
    let device = encoded.memory.device();
    let rows = prefixes.len();
    let len = prefixes[0].len();

    let flat: Vec<i32> = prefixes.iter().flat_map(|p| p.iter().map(|&t| t as i32)).collect();
    let tgt_in = Tensor::<B, 1, Int>::from_ints(flat.as_slice(), &device).reshape([rows, len]);

    let logits = model.decode(encoded, tgt_in);
    let [_, steps, vocab] = logits.dims();
    let last = logits.slice([0..rows, steps - 1..steps, 0..vocab]).reshape([rows, vocab]);
    let values = log_softmax(last, 1)
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .unwrap_or_default();

    values.chunks(vocab).map(|c| c.to_vec()).collect()
}

// ─── Greedy / top-k ───────────────────────────────────────────────────────────
fn sample_or_greedy<B: Backend, R: Rng>(
    model:    &Seq2Seq<B>,
    encoded:  &Encoded<B>,
    settings: &DecodeSettings,
    rng:      &mut R,
) -> Vec<Vec<u32>> {
    let rows = encoded.batch_size();
    let mut prefixes: Vec<Vec<u32>> = vec![vec![settings.start_idx]; rows];
    let mut done = vec![false; rows];

    for _ in 0..settings.max_len {
        let log_probs = next_log_probs(model, encoded, &prefixes);
        for (row, scores) in log_probs.iter().enumerate() {
            // Finished rows keep growing with padding so shapes line up
            let token = if done[row] {
                settings.pad_idx
            } else if settings.topk > 1 {
                sample_top_k(scores, settings.topk, rng)
            } else {
                argmax(scores)
            };
            if token == settings.end_idx {
                done[row] = true;
            }
            prefixes[row].push(token);
        }
        if done.iter().all(|&d| d) {
            break;
        }
    }

    prefixes.into_iter().map(|p| strip_markers(&p, settings)).collect()
}

fn argmax(scores: &[f32]) -> u32 {
    scores
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map_or(0, |(i, _)| i as u32)
}

fn top_k(scores: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut ranked: Vec<(u32, f32)> = scores.iter().enumerate().map(|(i, &s)| (i as u32, s)).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.truncate(k);
    ranked
}

fn sample_top_k<R: Rng>(scores: &[f32], k: usize, rng: &mut R) -> u32 {
    let best = top_k(scores, k);
    // Renormalise in probability space, relative to the best score
    let top = best.first().map_or(0.0, |b| b.1);
    let weights: Vec<f64> = best.iter().map(|(_, s)| ((s - top) as f64).exp()).collect();
    match WeightedIndex::new(&weights) {
        Ok(dist) => best[dist.sample(rng)].0,
        Err(_) => best.first().map_or(0, |b| b.0),
    }
}

fn strip_markers(tokens: &[u32], settings: &DecodeSettings) -> Vec<u32> {
    tokens
        .iter()
        .copied()
        .skip_while(|&t| t == settings.start_idx)
        .take_while(|&t| t != settings.end_idx && t != settings.pad_idx)
        .collect()
}

// ─── Beam search ──────────────────────────────────────────────────────────────
/// A partial reply kept on the beam.
#[derive(Debug, Clone)]
pub struct BeamCandidate {
    /// Tokens so far, starting with __start__
    pub tokens:   Vec<u32>,
    /// Sum of token log-probabilities
    pub score:    f64,
    pub finished: bool,
}

impl BeamCandidate {
    /// Score divided by the GNMT length penalty ((5 + len) / 6)^alpha.
    pub fn normalized_score(&self, alpha: f32) -> f64 {
        let len = self.tokens.len().saturating_sub(1);
        if alpha == 0.0 || len == 0 {
            self.score
        } else {
            let penalty = ((5.0 + len as f64) / 6.0).powf(alpha as f64);
            self.score / penalty
        }
    }
}

/// Beam state for one example.
pub struct BeamSearch {
    beam_size: usize,
    end_idx:   u32,
    alpha:     f32,
    active:    Vec<BeamCandidate>,
    finished:  Vec<BeamCandidate>,
}

impl BeamSearch {
    pub fn new(start_idx: u32, end_idx: u32, beam_size: usize, alpha: f32) -> Self {
        Self {
            beam_size,
            end_idx,
            alpha,
            active: vec![BeamCandidate { tokens: vec![start_idx], score: 0.0, finished: false }],
            finished: Vec::new(),
        }
    }

    pub fn active(&self) -> &[BeamCandidate] {
        &self.active
    }

    pub fn is_done(&self) -> bool {
        self.active.is_empty() || self.finished.len() >= self.beam_size
    }

    /// Expand every active candidate with its own next-token
    /// log-probabilities (one row per candidate) and keep the best.
    pub fn step(&mut self, log_probs: &[Vec<f32>]) {
        let mut expansions: Vec<BeamCandidate> = Vec::new();
        for (cand, scores) in self.active.iter().zip(log_probs) {
            for (token, lp) in top_k(scores, self.beam_size) {
                let mut tokens = cand.tokens.clone();
                tokens.push(token);
                expansions.push(BeamCandidate {
                    tokens,
                    score: cand.score + lp as f64,
                    finished: token == self.end_idx,
                });
            }
        }
        expansions.sort_by(|a, b| b.score.total_cmp(&a.score));
        expansions.truncate(self.beam_size);

        let (finished, active): (Vec<_>, Vec<_>) = expansions.into_iter().partition(|c| c.finished);
        self.finished.extend(finished);
        self.active = active;
    }

    /// Best finished reply, or the best partial one if none finished.
    pub fn best_sequence(&self) -> Vec<u32> {
        let pool = if self.finished.is_empty() { &self.active } else { &self.finished };
        pool.iter()
            .max_by(|a, b| {
                a.normalized_score(self.alpha)
                    .total_cmp(&b.normalized_score(self.alpha))
            })
            .map(|c| c.tokens.clone())
            .unwrap_or_default()
    }
}

fn beam_search<B: Backend>(model: &Seq2Seq<B>, encoded: &Encoded<B>, settings: &DecodeSettings) -> Vec<u32> {
    let mut beam = BeamSearch::new(
        settings.start_idx,
        settings.end_idx,
        settings.beam_size,
        settings.length_alpha,
    );

    for _ in 0..settings.max_len {
        if beam.is_done() {
            break;
        }
        let prefixes: Vec<Vec<u32>> = beam.active().iter().map(|c| c.tokens.clone()).collect();
        let repeated = encoded.select(&vec![0; prefixes.len()]);
        let log_probs = next_log_probs(model, &repeated, &prefixes);
        beam.step(&log_probs);
    }

    strip_markers(&beam.best_sequence(), settings)
}

// ─── Candidate ranking ────────────────────────────────────────────────────────
/// Order `candidates` best-first by mean token log-probability of
/// (candidate + __end__) given the context in `src` ([1, S], may be
/// padded). Returns indices into `candidates`. Empty candidates are
/// ranked last.
pub fn rank_candidates<B: Backend>(
    model:      &Seq2Seq<B>,
    src:        Tensor<B, 2, Int>,
    candidates: &[Vec<u32>],
    settings:   &DecodeSettings,
) -> Vec<usize> {
    let scored: Vec<usize> = (0..candidates.len()).filter(|&i| !candidates[i].is_empty()).collect();
    if scored.is_empty() {
        return (0..candidates.len()).collect();
    }
    let device = src.device();

    // Candidate plus __start__ / __end__ must fit the decoder, so keep
    // the first max_seq_len - 1 tokens like the batcher does for targets
    let max_reply = model.max_seq_len.saturating_sub(1).max(1);
    let clipped: Vec<&[u32]> = scored
        .iter()
        .map(|&i| &candidates[i][..candidates[i].len().min(max_reply)])
        .collect();

    let n = scored.len();
    let width = clipped.iter().map(|c| c.len()).max().unwrap_or(0) + 1;
    let pad = settings.pad_idx as i32;

    let mut tgt_in = Vec::with_capacity(n * width);
    let mut tgt_out = Vec::with_capacity(n * width);
    for &cand in &clipped {
        tgt_in.push(settings.start_idx as i32);
        tgt_in.extend(cand.iter().map(|&t| t as i32));
        tgt_out.extend(cand.iter().map(|&t| t as i32));
        tgt_out.push(settings.end_idx as i32);
        let fill = width - cand.len() - 1;
        tgt_in.extend(std::iter::repeat(pad).take(fill));
        tgt_out.extend(std::iter::repeat(pad).take(fill));
    }

    let encoded = model.encode(src).select(&vec![0; n]);

    let tgt_in = Tensor::<B, 1, Int>::from_ints(tgt_in.as_slice(), &device).reshape([n, width]);
    let tgt_out = Tensor::<B, 1, Int>::from_ints(tgt_out.as_slice(), &device).reshape([n, width]);

    let logits = model.decode(&encoded, tgt_in);
    let [_, _, vocab] = logits.dims();
    let log_probs = log_softmax(logits.reshape([n * width, vocab]), 1);
    let targets = tgt_out.reshape([n * width, 1]);
    let keep = targets.clone().equal_elem(settings.pad_idx as i64).bool_not().float();

    let token_lp = log_probs.gather(1, targets) * keep.clone();
    let sums = token_lp.reshape([n, width]).sum_dim(1);
    let counts = keep.reshape([n, width]).sum_dim(1);
    let means = (sums / counts)
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .unwrap_or_default();

    let mut order: Vec<(usize, f32)> = scored.iter().copied().zip(means).collect();
    order.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut ranked: Vec<usize> = order.into_iter().map(|(i, _)| i).collect();
    ranked.extend((0..candidates.len()).filter(|i| candidates[*i].is_empty()));
    ranked
}

// ─── Next-word distribution ───────────────────────────────────────────────────
/// Probability of every vocabulary word as the next token.
#[derive(Debug, Clone, Default)]
pub struct WordDistribution {
    probs: HashMap<String, f64>,
}

impl WordDistribution {
    pub fn new(probs: HashMap<String, f64>) -> Self {
        Self { probs }
    }

    /// Probability of `word`; words the model did not score get a tiny
    /// non-zero value so log-probabilities stay finite.
    pub fn get(&self, word: &str) -> f64 {
        self.probs.get(word).copied().unwrap_or(UNSEEN_WORD_PROB)
    }
}

/// Softmax over the vocabulary for the token following `partial`
/// (which must not include __start__).
pub fn next_token_probs<B: Backend>(
    model:    &Seq2Seq<B>,
    context:  &[u32],
    partial:  &[u32],
    settings: &DecodeSettings,
    device:   &B::Device,
) -> Vec<f32> {
    if context.is_empty() {
        return Vec::new();
    }
    let ctx: Vec<i32> = context.iter().map(|&t| t as i32).collect();
    let src = Tensor::<B, 1, Int>::from_ints(ctx.as_slice(), device).reshape([1, ctx.len()]);
    let encoded = model.encode(src);

    let mut prefix = Vec::with_capacity(partial.len() + 1);
    prefix.push(settings.start_idx);
    prefix.extend_from_slice(partial);

    next_log_probs(model, &encoded, &[prefix])
        .into_iter()
        .next()
        .unwrap_or_default()
        .into_iter()
        .map(f32::exp)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::model::Seq2SeqConfig;
    use burn::backend::NdArray;
    use rand::{rngs::StdRng, SeedableRng};

    type TestBackend = NdArray;

    fn settings(beam_size: usize, topk: usize) -> DecodeSettings {
        DecodeSettings {
            start_idx: 1,
            end_idx: 2,
            pad_idx: 0,
            max_len: 5,
            beam_size,
            topk,
            length_alpha: 0.6,
        }
    }

    fn model() -> Seq2Seq<TestBackend> {
        Seq2SeqConfig::new(10, 8, 16, 2, 1, 20)
            .with_dropout(0.0)
            .init(&Default::default())
    }

    fn src() -> Tensor<TestBackend, 2, Int> {
        Tensor::<TestBackend, 1, Int>::from_ints([4, 5, 6, 7, 8, 0], &Default::default())
            .reshape([2, 3])
    }

    #[test]
    fn test_greedy_respects_max_len_and_markers() {
        let out = generate(&model(), src(), &settings(1, 1), &mut StdRng::seed_from_u64(0));
        assert_eq!(out.len(), 2);
        for reply in out {
            assert!(reply.len() <= 5);
            assert!(!reply.contains(&1) && !reply.contains(&2));
        }
    }

    #[test]
    fn test_topk_and_beam_return_one_reply_per_row() {
        let m = model();
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(generate(&m, src(), &settings(1, 3), &mut rng).len(), 2);
        let beams = generate(&m, src(), &settings(3, 1), &mut rng);
        assert_eq!(beams.len(), 2);
        assert!(beams.iter().all(|b| b.len() <= 5));
    }

    #[test]
    fn test_beam_keeps_best_scores() {
        let mut beam = BeamSearch::new(1, 2, 2, 0.0);
        // vocab of 4: token 3 best, then end (2)
        beam.step(&[vec![-9.0, -9.0, -0.5, -0.1]]);
        assert_eq!(beam.active().len(), 1);
        assert_eq!(beam.active()[0].tokens, vec![1, 3]);
        // the finished "1 2" candidate scores -0.5
        assert_eq!(beam.best_sequence(), vec![1, 2]);
    }

    #[test]
    fn test_length_penalty() {
        let c = BeamCandidate { tokens: vec![1, 4, 5, 6], score: -3.0, finished: true };
        assert_eq!(c.normalized_score(0.0), -3.0);
        assert!(c.normalized_score(1.0) > -3.0);
    }

    #[test]
    fn test_sample_top_k_stays_in_top() {
        let scores = [-5.0, -0.1, -0.2, -6.0];
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let t = sample_top_k(&scores, 2, &mut rng);
            assert!(t == 1 || t == 2);
        }
    }

    #[test]
    fn test_rank_candidates_returns_permutation() {
        let m = model();
        let cands = vec![vec![4, 5], vec![], vec![6]];
        let src = Tensor::<TestBackend, 1, Int>::from_ints([4, 5, 6], &Default::default()).reshape([1, 3]);
        let order = rank_candidates(&m, src, &cands, &settings(1, 1));
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(sorted, vec![0, 1, 2]);
        assert_eq!(order[2], 1);
    }

    /// Mean ln p over `cand` + __end__, one forward pass per token.
    fn mean_log_prob(m: &Seq2Seq<TestBackend>, context: &[u32], cand: &[u32]) -> f32 {
        let s = settings(1, 1);
        let mut full = cand.to_vec();
        full.push(s.end_idx);
        let total: f32 = (0..full.len())
            .map(|j| next_token_probs(m, context, &full[..j], &s, &Default::default())[full[j] as usize].ln())
            .sum();
        total / full.len() as f32
    }

    #[test]
    fn test_rank_order_follows_mean_log_prob() {
        let m = model();
        let context = [4, 5, 6];
        let cands: Vec<Vec<u32>> = vec![vec![7], vec![4, 5, 6, 7], vec![9, 3], vec![8, 8, 8]];
        let src = Tensor::<TestBackend, 1, Int>::from_ints([4, 5, 6], &Default::default()).reshape([1, 3]);
        let order = rank_candidates(&m, src, &cands, &settings(1, 1));
        assert_eq!(order.len(), cands.len());

        let scores: Vec<f32> = order.iter().map(|&i| mean_log_prob(&m, &context, &cands[i])).collect();
        for pair in scores.windows(2) {
            assert!(pair[0] >= pair[1] - 1e-4, "out of order: {scores:?}");
        }
    }

    #[test]
    fn test_rank_candidates_clips_long_candidates() {
        let m: Seq2Seq<TestBackend> = Seq2SeqConfig::new(10, 8, 16, 2, 1, 6)
            .with_dropout(0.0)
            .init(&Default::default());
        let cands = vec![vec![4, 5, 6, 7, 8, 9, 4, 5, 6, 7], vec![4]];
        let src = Tensor::<TestBackend, 1, Int>::from_ints([4, 5, 6], &Default::default()).reshape([1, 3]);
        let mut order = rank_candidates(&m, src, &cands, &settings(1, 1));
        order.sort();
        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    fn test_next_token_probs_sum_to_one() {
        let probs = next_token_probs(&model(), &[4, 5], &[6], &settings(1, 1), &Default::default());
        assert_eq!(probs.len(), 10);
        let total: f32 = probs.iter().sum();
        assert!((total - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_word_distribution_default() {
        let mut probs = HashMap::new();
        probs.insert("hello".to_string(), 0.6);
        let dist = WordDistribution::new(probs);
        assert_eq!(dist.get("hello"), 0.6);
        assert_eq!(dist.get("missing"), UNSEEN_WORD_PROB);
    }
}
