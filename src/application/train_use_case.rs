// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// Orchestrates the full training pipeline in order:
//
//   Step 1: Load fbdialog episodes        (Layer 4 - data)
//   Step 2: Split train/validation        (Layer 4 - data)
//   Step 3: Resolve options / checkpoint  (Layer 5 - ml)
//   Step 4: Build or load dictionary      (Layer 6 - infra)
//   Step 5: Vectorise samples             (Layer 4 - data)
//   Step 6: Build agent on a backend      (Layer 2 - backend)
//   Step 7: Run the training loop         (Layer 5 - ml)

use anyhow::{bail, Result};
use burn::{optim::Optimizer, tensor::backend::AutodiffBackend};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::application::backend::{run_with_agent, AgentTask};
use crate::data::{
    dataset::{DialogueDataset, SampleBuilder},
    loader::FbDialogLoader,
    splitter::split_train_val,
};
use crate::domain::{dialogue::Episode, options::AgentOptions, traits::DialogueSource};
use crate::infra::dictionary::DictionaryStore;
use crate::ml::{
    agent::{resolve_options, TransformerAgent},
    model::Seq2Seq,
    trainer::{run_training, TrainSummary},
};

// ─── Training Configuration ──────────────────────────────────────────────────
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub train_file:          String,
    /// Separate validation file; when absent the training episodes are split
    pub valid_file:          Option<String>,
    /// Share of episodes kept for training when splitting
    pub train_fraction:      f64,
    pub max_episodes:        Option<usize>,
    pub epochs:              usize,
    /// Log the running report every N batches (0 = never)
    pub log_every:           usize,
    /// Validate every N epochs (0 = never)
    pub validate_every:      usize,
    /// Stop after N validations without improvement (0 = never)
    pub validation_patience: usize,
    pub metrics_csv:         String,
    pub seed:                u64,
    pub no_gpu:              bool,
    pub agent:               AgentOptions,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            train_file:          "data/convai2/train.txt".to_string(),
            valid_file:          None,
            train_fraction:      0.9,
            max_episodes:        None,
            epochs:              10,
            log_every:           100,
            validate_every:      1,
            validation_patience: 12,
            metrics_csv:         "checkpoints/metrics.csv".to_string(),
            seed:                42,
            no_gpu:              false,
            agent:               AgentOptions::default(),
        }
    }
}

// ─── TrainUseCase ─────────────────────────────────────────────────────────────
pub struct TrainUseCase {
    config: TrainConfig,
}

impl TrainUseCase {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    pub fn execute(&self) -> Result<TrainSummary> {
        let cfg = &self.config;
        if cfg.agent.model_file.is_none() {
            bail!("Training needs a model file to save checkpoints to");
        }
        let mut rng = StdRng::seed_from_u64(cfg.seed);

        // ── Step 1–2: Episodes ────────────────────────────────────────────────
        let episodes = FbDialogLoader::new(&cfg.train_file)
            .with_max_episodes(cfg.max_episodes)
            .load_all()?;
        if episodes.is_empty() {
            bail!("No dialogues found in '{}'", cfg.train_file);
        }

        let (train_episodes, valid_episodes) = match &cfg.valid_file {
            Some(path) => (
                episodes,
                FbDialogLoader::new(path).with_max_episodes(cfg.max_episodes).load_all()?,
            ),
            None => split_train_val(episodes, cfg.train_fraction, &mut rng),
        };
        tracing::info!(
            "Episodes: {} training, {} validation",
            train_episodes.len(),
            valid_episodes.len()
        );

        // ── Step 3: Options ───────────────────────────────────────────────────
        let resolved = resolve_options(cfg.agent.clone())?;
        let opts = &resolved.options;

        // ── Step 4: Dictionary (training data only) ───────────────────────────
        let Some(dict_file) = &opts.dict_file else {
            bail!("No dictionary path could be derived from the model file");
        };
        let dict = DictionaryStore::new(dict_file).load_or_build(&dictionary_texts(&train_episodes), &opts.dict)?;
        tracing::info!("Dictionary size: {}", dict.len());

        // ── Step 5: Samples ───────────────────────────────────────────────────
        let builder = SampleBuilder::new(&dict, opts);
        let train = DialogueDataset::new(builder.build(&train_episodes, &mut rng)?);
        let valid = DialogueDataset::new(builder.build(&valid_episodes, &mut rng)?);
        if train.samples().is_empty() {
            bail!("Training data produced no usable samples");
        }

        // ── Step 6–7: Agent + loop ────────────────────────────────────────────
        let task = TrainTask { config: cfg, train, valid };
        let summary = run_with_agent(resolved, dict, true, cfg.no_gpu, task)?;

        tracing::info!(
            "Training finished after {} epochs (best valid ppl: {})",
            summary.epochs_run,
            summary.best_valid_ppl.map_or("n/a".to_string(), |p| p.to_string())
        );
        Ok(summary)
    }
}

/// Every partner text and gold label, the corpus the dictionary is built on.
fn dictionary_texts(episodes: &[Episode]) -> Vec<String> {
    episodes
        .iter()
        .flatten()
        .flat_map(|m| std::iter::once(m.text.clone()).chain(m.labels.iter().cloned()))
        .filter(|t| !t.is_empty())
        .collect()
}

struct TrainTask<'a> {
    config: &'a TrainConfig,
    train:  DialogueDataset,
    valid:  DialogueDataset,
}

impl AgentTask for TrainTask<'_> {
    type Output = TrainSummary;

    fn run<B, O>(self, mut agent: TransformerAgent<B, O>) -> Result<TrainSummary>
    where
        B: AutodiffBackend,
        O: Optimizer<Seq2Seq<B>, B>,
    {
        run_training(&mut agent, self.config, self.train, self.valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::dialogue::Message;

    #[test]
    fn test_dictionary_texts_include_labels() {
        let episodes = vec![vec![
            Message::new("hi").with_labels(["hello", "hey"]),
            Message::new("").with_labels(["bye"]).done(true),
        ]];
        assert_eq!(dictionary_texts(&episodes), vec!["hi", "hello", "hey", "bye"]);
    }

    #[test]
    fn test_end_to_end_on_cpu() {
        let dir = std::env::temp_dir().join(format!("convai_train_uc_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let train_file = dir.join("train.txt");
        std::fs::write(
            &train_file,
            "1 your persona: i like cats.\n\
             2 hi there\thello friend\n\
             3 how are you\tfine thanks\n\
             1 good morning\tmorning to you\n\
             2 nice day\tyes it is\n",
        )
        .unwrap();

        let config = TrainConfig {
            train_file: train_file.to_string_lossy().into_owned(),
            train_fraction: 0.5,
            epochs: 1,
            log_every: 0,
            metrics_csv: dir.join("metrics.csv").to_string_lossy().into_owned(),
            no_gpu: true,
            agent: AgentOptions {
                d_model: 8,
                d_inner: 16,
                n_head: 2,
                n_layers: 1,
                max_seq_len: 16,
                dropout: 0.0,
                batch_size: 2,
                model_file: Some(dir.join("model").to_string_lossy().into_owned()),
                ..Default::default()
            },
            ..Default::default()
        };

        let summary = TrainUseCase::new(config).execute().unwrap();
        assert_eq!(summary.epochs_run, 1);
        assert!(dir.join("model.opt").is_file());
        assert!(dir.join("model.dict").is_file());
        std::fs::remove_dir_all(&dir).ok();
    }
}
