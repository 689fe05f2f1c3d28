// ============================================================
// Layer 5 — Transformer Agent
// ============================================================
// Coordinates dictionary, model, optimizer and per-turn I/O.
//
// Life of a turn:
//
//   observe(message, slot)
//       │  history.update(...) with the slot's previous answer
//       ▼
//   Observation { slot, message, sample }
//       │
//   batch_act([observations])
//       │  DialogueBatcher → tensors
//       ├─ training + labels → train_step (loss, backward, step)
//       └─ otherwise         → eval_step  (loss if labels, decode)
//       ▼
//   Vec<Reply>   (answers are stored back in their slots)
//
// Each slot is one conversation running in parallel, so batching
// B slots is the same as talking to B partners at once.
//
// Loading order: `init_model` first, then `model_file` (which wins)
// when its `.opt` file exists. Saved architecture options override
// the ones given on the command line.

use anyhow::{bail, Result};
use burn::{
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    prelude::*,
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use crate::data::{
    batcher::{DialogueBatch, DialogueBatcher},
    dataset::DialogueSample,
    history::DialogueHistory,
};
use crate::domain::{
    dialogue::{Message, Reply},
    options::{AgentOptions, OptimizerKind},
    traits::ConversationalAgent,
};
use crate::infra::{
    checkpoint::{CheckpointManager, CheckpointMeta},
    dictionary::Dictionary,
    metrics::{Report, TokenMetrics},
};
use crate::ml::{
    decoding::{self, DecodeSettings, WordDistribution},
    model::{Seq2Seq, Seq2SeqConfig},
    scheduler::ReduceLrOnPlateau,
};

pub const AGENT_ID: &str = "Transformer";

/// GNMT length penalty exponent used by beam search
const BEAM_LENGTH_ALPHA: f32 = 0.6;

// ─── Option resolution ────────────────────────────────────────────────────────
/// Options after merging in a saved checkpoint.
#[derive(Debug, Clone)]
pub struct ResolvedOptions {
    pub options:         AgentOptions,
    /// Checkpoint to load weights from
    pub checkpoint:      Option<PathBuf>,
    /// Optimizer kind stored with that checkpoint
    pub saved_optimizer: Option<OptimizerKind>,
}

/// Find the checkpoint to start from and let its architecture options
/// override `opts`. Also decides which dictionary file to use.
pub fn resolve_options(mut opts: AgentOptions) -> Result<ResolvedOptions> {
    let mut checkpoint: Option<PathBuf> = None;
    for candidate in [&opts.init_model, &opts.model_file].into_iter().flatten() {
        if CheckpointManager::new(candidate).exists() {
            checkpoint = Some(PathBuf::from(candidate));
        }
    }

    let mut saved_optimizer = None;
    if let Some(base) = &checkpoint {
        tracing::info!("Loading existing model params from '{}'", base.display());
        let ckpt = CheckpointManager::new(base);
        let meta = ckpt.load_meta()?;
        opts.override_from(&meta.options)?;
        saved_optimizer = meta.optimizer_type;

        let dict_path = ckpt.dict_path();
        if dict_path.is_file() || opts.dict_file.is_none() {
            opts.dict_file = Some(dict_path.to_string_lossy().into_owned());
        }
    }

    if opts.dict_file.is_none() {
        if let Some(model_file) = &opts.model_file {
            opts.dict_file = Some(format!("{model_file}.dict"));
        }
    }

    opts.validate()?;
    Ok(ResolvedOptions { options: opts, checkpoint, saved_optimizer })
}

// ─── Observation ──────────────────────────────────────────────────────────────
/// A message after it went through the slot's history.
#[derive(Debug, Clone)]
pub struct Observation {
    pub slot:    usize,
    pub message: Message,
    pub sample:  DialogueSample,
}

struct SlotState {
    history:     DialogueHistory,
    /// Our last reply in this conversation
    answer:      Option<Vec<u32>>,
    observation: Option<Observation>,
}

impl SlotState {
    fn new(opts: &AgentOptions) -> Self {
        Self {
            history: DialogueHistory::new(opts.truncate, opts.history_replies, opts.person_tokens),
            answer: None,
            observation: None,
        }
    }

    fn clear(&mut self) {
        self.history.clear();
        self.answer = None;
        self.observation = None;
    }
}

/// What an evaluation pass produced for the kept rows of a batch.
#[derive(Debug, Default)]
pub struct EvalOutput {
    /// Generated reply per kept row; empty when generation was off
    pub predictions: Vec<Vec<u32>>,
    /// Candidate order per kept row when ranking is enabled
    pub rankings:    Vec<Option<Vec<usize>>>,
}

// ─── TransformerAgent ─────────────────────────────────────────────────────────
pub struct TransformerAgent<B: AutodiffBackend, O: Optimizer<Seq2Seq<B>, B>> {
    id:        String,
    opts:      AgentOptions,
    dict:      Dictionary,
    model:     Seq2Seq<B>,
    optim:     O,
    scheduler: ReduceLrOnPlateau,
    batcher:   DialogueBatcher,
    decode:    DecodeSettings,
    device:    B::Device,
    metrics:   TokenMetrics,
    slots:     Vec<SlotState>,
    training:  bool,
    rng:       StdRng,
}

impl<B: AutodiffBackend, O: Optimizer<Seq2Seq<B>, B>> TransformerAgent<B, O> {
    /// Build the model for `resolved.options` and restore any checkpoint.
    /// Optimizer state is only restored when `training` and the saved
    /// optimizer kind matches.
    pub fn new(
        resolved: ResolvedOptions,
        dict:     Dictionary,
        optim:    O,
        device:   B::Device,
        training: bool,
    ) -> Result<Self> {
        let ResolvedOptions { options: opts, checkpoint, saved_optimizer } = resolved;
        if dict.is_empty() {
            bail!("Cannot build an agent with an empty dictionary");
        }

        let model_cfg = Seq2SeqConfig::new(
            dict.len(),
            opts.d_model,
            opts.d_inner,
            opts.n_head,
            opts.n_layers,
            opts.max_seq_len,
        )
        .with_dropout(opts.dropout)
        .with_share_embeddings(opts.share_embeddings)
        .with_pad_idx(dict.null_idx() as usize);

        let mut model: Seq2Seq<B> = model_cfg.init(&device);
        let mut optim = optim;

        if let Some(base) = &checkpoint {
            let ckpt = CheckpointManager::new(base);
            model = ckpt.load_model(model, &device)?;

            if training {
                match saved_optimizer {
                    Some(kind) if kind != opts.optimizer => tracing::warn!(
                        "Not loading optimizer state since optimizer class changed ({kind} => {})",
                        opts.optimizer
                    ),
                    Some(_) => match ckpt.load_optimizer_record::<B, O>(&device) {
                        Ok(record) => optim = optim.load_record(record),
                        Err(e) => tracing::warn!("Not loading optimizer state: {e:#}"),
                    },
                    None => {}
                }
            }
        }

        tracing::info!(
            "Transformer ready: vocab={} d_model={} layers={} heads={}",
            dict.len(),
            opts.d_model,
            opts.n_layers,
            opts.n_head
        );

        let decode = DecodeSettings {
            start_idx:    dict.start_idx(),
            end_idx:      dict.end_idx(),
            pad_idx:      dict.null_idx(),
            max_len:      opts.max_response_len.min(opts.max_seq_len.saturating_sub(1)).max(1),
            beam_size:    opts.beam_size,
            topk:         opts.topk,
            length_alpha: BEAM_LENGTH_ALPHA,
        };

        Ok(Self {
            id: AGENT_ID.to_string(),
            batcher: DialogueBatcher::new(&dict, opts.max_seq_len),
            scheduler: ReduceLrOnPlateau::new(opts.learning_rate),
            decode,
            slots: Vec::new(),
            metrics: TokenMetrics::default(),
            rng: StdRng::from_entropy(),
            opts,
            dict,
            model,
            optim,
            device,
            training,
        })
    }

    // ── Accessors ─────────────────────────────────────────────────────────────
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> &AgentOptions {
        &self.opts
    }

    pub fn dict(&self) -> &Dictionary {
        &self.dict
    }

    pub fn batcher(&self) -> &DialogueBatcher {
        &self.batcher
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn lr(&self) -> f64 {
        self.scheduler.lr()
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// History tokens of the last observation in `slot`.
    pub fn observed_context(&self, slot: usize) -> Option<&[u32]> {
        self.slots
            .get(slot)
            .and_then(|s| s.observation.as_ref())
            .map(|o| o.sample.context.as_slice())
    }

    // ── Observe / act ─────────────────────────────────────────────────────────
    /// Fold `message` into the history of `slot` and vectorise it.
    pub fn observe(&mut self, message: Message, slot: usize) -> Result<Observation> {
        while self.slots.len() <= slot {
            self.slots.push(SlotState::new(&self.opts));
        }

        let answer = self.slots[slot].answer.take();
        let context = self.slots[slot]
            .history
            .update(&message, answer.as_deref(), &self.dict)?;

        let target = match message.labels.choose(&mut self.rng) {
            Some(label) => Some(self.vectorise_reply(label)?),
            None => None,
        };
        let candidates = message
            .label_candidates
            .iter()
            .map(|c| self.vectorise_reply(c))
            .collect::<Result<Vec<_>>>()?;

        let observation = Observation {
            slot,
            message,
            sample: DialogueSample { context, target, candidates },
        };
        self.slots[slot].observation = Some(observation.clone());
        Ok(observation)
    }

    /// Reply to the pending observation of `slot`.
    pub fn act(&mut self, slot: usize) -> Result<Reply> {
        let Some(observation) = self.slots.get_mut(slot).and_then(|s| s.observation.take()) else {
            return Ok(Reply::empty(&self.id));
        };
        let mut replies = self.batch_act(std::slice::from_ref(&observation))?;
        Ok(replies.pop().unwrap_or_else(|| Reply::empty(&self.id)))
    }

    /// Process several observations as one batch. Trains when the agent
    /// is training and any observation carries a label; otherwise scores
    /// labels (if any) and generates replies.
    pub fn batch_act(&mut self, observations: &[Observation]) -> Result<Vec<Reply>> {
        let mut replies: Vec<Reply> = observations.iter().map(|_| Reply::empty(&self.id)).collect();
        if observations.is_empty() {
            return Ok(replies);
        }

        let samples: Vec<DialogueSample> = observations.iter().map(|o| o.sample.clone()).collect();
        let has_labels = samples.iter().any(|s| s.target.is_some());

        let (valid, output) = if self.training && has_labels {
            let batch = self.batcher.build::<B>(&samples, &self.device);
            let valid = batch.valid.clone();
            let predictions = self.train_step(batch)?.unwrap_or_default();
            (valid, EvalOutput { predictions, rankings: Vec::new() })
        } else {
            let batch = self.batcher.build::<B::InnerBackend>(&samples, &self.device);
            let valid = batch.valid.clone();
            (valid, self.eval_step(batch, true)?.unwrap_or_default())
        };

        for (row, &i) in valid.iter().enumerate() {
            let observation = &observations[i];
            if let Some(prediction) = output.predictions.get(row) {
                replies[i].text = Some(self.dict.vec2txt(prediction));
                if let Some(state) = self.slots.get_mut(observation.slot) {
                    state.answer = Some(prediction.clone());
                }
            }
            if let Some(Some(order)) = output.rankings.get(row) {
                replies[i].text_candidates = order
                    .iter()
                    .filter_map(|&j| observation.message.label_candidates.get(j).cloned())
                    .collect();
            }
        }
        Ok(replies)
    }

    // ── Steps ─────────────────────────────────────────────────────────────────
    /// One optimisation step. Returns the argmax reply (given the gold prefix) of
    /// every kept row, or `None` when the batch had nothing to train on.
    pub fn train_step(&mut self, batch: DialogueBatch<B>) -> Result<Option<Vec<Vec<u32>>>> {
        let (Some(src), Some(targets)) = (batch.src, batch.targets) else {
            self.metrics.skip_batch();
            return Ok(None);
        };
        if !self.training {
            bail!("train_step called on an agent that is not training");
        }

        let logits = self.model.forward(src, targets.tgt_in);
        let out = self
            .model
            .sequence_loss(logits, targets.tgt_out, self.opts.label_smoothing);

        let loss_sum: f64 = out.loss_sum.clone().into_scalar().elem();
        let correct: i64 = out.correct.into_scalar().elem();
        self.metrics.record(loss_sum, targets.num_tokens, correct.max(0) as usize);

        // Average per target token before backprop
        let loss = out.loss_sum.div_scalar(targets.num_tokens.max(1) as f32);
        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &self.model);
        self.model = self.optim.step(self.scheduler.lr(), self.model.clone(), grads);

        Ok(Some(self.cut_predictions(out.preds)))
    }

    /// Score targets (when present) without updating weights. With
    /// `generate`, also decode a reply (and rank candidates) per row.
    pub fn eval_step(
        &mut self,
        batch:    DialogueBatch<B::InnerBackend>,
        generate: bool,
    ) -> Result<Option<EvalOutput>> {
        let Some(src) = batch.src else {
            self.metrics.skip_batch();
            return Ok(None);
        };
        let model = self.model.valid();

        if let Some(targets) = batch.targets {
            let logits = model.forward(src.clone(), targets.tgt_in);
            let out = model.sequence_loss(logits, targets.tgt_out, self.opts.label_smoothing);
            let loss_sum: f64 = out.loss_sum.into_scalar().elem();
            let correct: i64 = out.correct.into_scalar().elem();
            self.metrics.record(loss_sum, targets.num_tokens, correct.max(0) as usize);
        }

        if !generate {
            return Ok(Some(EvalOutput::default()));
        }

        let predictions = decoding::generate(&model, src.clone(), &self.decode, &mut self.rng);

        let [rows, width] = src.dims();
        let rankings = (0..rows)
            .map(|row| {
                let candidates = batch.candidates.get(row)?;
                if !self.opts.rank_candidates || candidates.is_empty() {
                    return None;
                }
                let row_src = src.clone().slice([row..row + 1, 0..width]);
                Some(decoding::rank_candidates(&model, row_src, candidates, &self.decode))
            })
            .collect();

        Ok(Some(EvalOutput { predictions, rankings }))
    }

    // ── Metrics ───────────────────────────────────────────────────────────────
    pub fn report(&self) -> Report {
        self.metrics.report()
    }

    pub fn reset_metrics(&mut self) {
        self.metrics.reset();
    }

    /// Forget every conversation and the running metrics.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.clear();
        }
        self.reset_metrics();
    }

    /// Feed a validation report to the learning-rate schedule.
    pub fn receive_metrics(&mut self, valid: &Report) {
        if let Some(loss) = valid.loss {
            self.scheduler.step(loss);
        }
    }

    /// Distribution of the word following `partial_out` given `context`.
    pub fn next_word_probability(&self, context: &[u32], partial_out: &[String]) -> WordDistribution {
        let partial: Vec<u32> = partial_out
            .iter()
            .map(|w| {
                let w = if self.opts.dict.lower { w.to_lowercase() } else { w.clone() };
                self.dict.tok2ind(&w).unwrap_or(self.dict.unk_idx())
            })
            .collect();

        let model = self.model.valid();
        let probs = decoding::next_token_probs(&model, context, &partial, &self.decode, &self.device);

        let words: HashMap<String, f64> = probs
            .into_iter()
            .enumerate()
            .filter_map(|(id, p)| self.dict.ind2tok(id as u32).map(|w| (w, p as f64)))
            .collect();
        WordDistribution::new(words)
    }

    // ── Persistence ───────────────────────────────────────────────────────────
    /// Write weights, dictionary and options to `path` (or `model_file`).
    /// Optimizer state is included while training.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let Some(base) = path
            .map(Path::to_path_buf)
            .or_else(|| self.opts.model_file.as_ref().map(PathBuf::from))
        else {
            tracing::debug!("No model file configured, nothing saved");
            return Ok(());
        };

        let ckpt = CheckpointManager::new(&base);
        ckpt.save_model(&self.model)?;
        let optimizer_type = if self.training {
            ckpt.save_optimizer::<B, O>(&self.optim)?;
            Some(self.opts.optimizer)
        } else {
            None
        };
        self.dict.save(ckpt.dict_path())?;

        let mut options = self.opts.clone();
        options.dict_file = Some(ckpt.dict_path().to_string_lossy().into_owned());
        ckpt.save_meta(&CheckpointMeta { options, optimizer_type })?;

        tracing::info!("Saved model to '{}'", base.display());
        Ok(())
    }

    /// Save to `<model_file>.shutdown_state` when training.
    pub fn shutdown(&self) -> Result<()> {
        if !self.training {
            return Ok(());
        }
        if let Some(model_file) = &self.opts.model_file {
            self.save(Some(Path::new(&format!("{model_file}.shutdown_state"))))?;
        }
        Ok(())
    }

    // ── Helpers ───────────────────────────────────────────────────────────────
    fn vectorise_reply(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = self.dict.txt2vec(text)?;
        if let Some(max) = self.opts.truncate {
            ids.truncate(max);
        }
        Ok(ids)
    }

    /// Rows of `preds` up to (not including) the first __end__.
    fn cut_predictions<BB: Backend>(&self, preds: Tensor<BB, 2, Int>) -> Vec<Vec<u32>> {
        let [_, width] = preds.dims();
        let flat = preds
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .unwrap_or_default();
        let end = self.dict.end_idx() as i64;
        flat.chunks(width.max(1))
            .map(|row| {
                row.iter()
                    .take_while(|&&t| t != end)
                    .map(|&t| t as u32)
                    .collect()
            })
            .collect()
    }
}

impl<B: AutodiffBackend, O: Optimizer<Seq2Seq<B>, B>> ConversationalAgent for TransformerAgent<B, O> {
    fn observe(&mut self, message: Message, slot: usize) -> Result<()> {
        TransformerAgent::observe(self, message, slot).map(|_| ())
    }

    fn act(&mut self, slot: usize) -> Result<Reply> {
        TransformerAgent::act(self, slot)
    }

    fn reset(&mut self) {
        TransformerAgent::reset(self)
    }
}
