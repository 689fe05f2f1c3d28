// ============================================================
// Layer 5 — Training Loop
// ============================================================
// Epoch loop around TransformerAgent using Burn's DataLoader.
//
//   for each epoch:
//     train   shuffled batches → agent.train_step
//             running report logged every `log_every` batches
//     valid   every `validate_every` epochs, no weight updates
//             → receive_metrics (LR plateau schedule)
//             → CSV row
//             → save when valid ppl improves, else lose patience
//
// Backends:
//   - training batches are built on B (Autodiff<_>)
//   - validation batches are built on B::InnerBackend, matching
//     `model.valid()` inside the agent

use anyhow::Result;
use burn::{data::dataloader::DataLoaderBuilder, optim::Optimizer, tensor::backend::AutodiffBackend};

use crate::application::train_use_case::TrainConfig;
use crate::data::dataset::{DialogueDataset, DialogueSample};
use crate::infra::metrics::{Report, ValidationLogger, ValidationRow};
use crate::ml::{agent::TransformerAgent, model::Seq2Seq};

/// How a training run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    pub epochs_run:     usize,
    pub best_valid_ppl: Option<f64>,
    pub stopped_early:  bool,
}

pub fn run_training<B, O>(
    agent: &mut TransformerAgent<B, O>,
    cfg:   &TrainConfig,
    train: DialogueDataset,
    valid: DialogueDataset,
) -> Result<TrainSummary>
where
    B: AutodiffBackend,
    O: Optimizer<Seq2Seq<B>, B>,
{
    let logger = ValidationLogger::new(&cfg.metrics_csv)?;
    let batch_size = agent.options().batch_size;

    tracing::info!(
        "Training on {} samples ({} target tokens), validating on {}",
        train.samples().len(),
        train.target_tokens(),
        valid.samples().len()
    );

    let loader = DataLoaderBuilder::new(agent.batcher().clone())
        .batch_size(batch_size)
        .shuffle(cfg.seed)
        .num_workers(1)
        .build(train);

    let mut best_ppl = f64::INFINITY;
    let mut impatience = 0usize;
    let mut summary = TrainSummary { epochs_run: 0, best_valid_ppl: None, stopped_early: false };

    for epoch in 1..=cfg.epochs {
        // ── Training phase ────────────────────────────────────────────────────
        agent.set_training(true);
        agent.reset_metrics();

        for (i, batch) in loader.iter().enumerate() {
            agent.train_step(batch)?;
            if cfg.log_every > 0 && (i + 1) % cfg.log_every == 0 {
                tracing::info!("epoch {epoch} | batch {} | lr {:.6} | {}", i + 1, agent.lr(), agent.report());
            }
        }
        let train_report = agent.report();
        tracing::info!("Epoch {epoch} train: {train_report}");
        summary.epochs_run = epoch;

        // ── Validation phase ──────────────────────────────────────────────────
        let due = cfg.validate_every > 0 && epoch % cfg.validate_every == 0;
        if !due || valid.samples().is_empty() {
            continue;
        }

        let valid_report = evaluate(agent, valid.samples(), batch_size)?;
        tracing::info!("Epoch {epoch} valid: {valid_report}");
        agent.receive_metrics(&valid_report);

        let row = ValidationRow { epoch, train: train_report, valid: valid_report, lr: agent.lr() };
        logger.log(&row)?;

        if row.is_improvement(best_ppl) {
            best_ppl = row.valid.ppl.unwrap_or(best_ppl);
            summary.best_valid_ppl = Some(best_ppl);
            impatience = 0;
            tracing::info!("New best valid ppl: {best_ppl}");
            agent.save(None)?;
        } else {
            impatience += 1;
            tracing::info!(
                "Did not beat best valid ppl {best_ppl} ({impatience} of {} validations)",
                cfg.validation_patience
            );
            if cfg.validation_patience > 0 && impatience >= cfg.validation_patience {
                tracing::info!("Ran out of patience, stopping training");
                summary.stopped_early = true;
                break;
            }
        }
    }

    // Nothing was validated, keep whatever we trained
    if summary.best_valid_ppl.is_none() {
        agent.save(None)?;
    }
    agent.shutdown()?;
    Ok(summary)
}

/// Token-level loss / ppl / accuracy over `samples` without touching the
/// weights. The agent's running metrics are reset before and after.
pub fn evaluate<B, O>(
    agent:      &mut TransformerAgent<B, O>,
    samples:    &[DialogueSample],
    batch_size: usize,
) -> Result<Report>
where
    B: AutodiffBackend,
    O: Optimizer<Seq2Seq<B>, B>,
{
    agent.reset_metrics();
    for chunk in samples.chunks(batch_size.max(1)) {
        let batch = agent.batcher().build::<B::InnerBackend>(chunk, agent.device());
        agent.eval_step(batch, false)?;
    }
    let report = agent.report();
    agent.reset_metrics();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::SampleBuilder;
    use crate::domain::dialogue::Message;
    use crate::domain::options::{AgentOptions, DictOptions};
    use crate::infra::dictionary::Dictionary;
    use crate::ml::{agent::resolve_options, optim};
    use burn::backend::{Autodiff, NdArray};
    use rand::{rngs::StdRng, SeedableRng};

    type TestBackend = Autodiff<NdArray>;

    fn setup(tag: &str) -> (AgentOptions, TrainConfig, Dictionary, DialogueDataset, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("convai_trainer_{}_{}", tag, std::process::id()));
        let opts = AgentOptions {
            d_model: 8,
            d_inner: 16,
            n_head: 2,
            n_layers: 1,
            max_seq_len: 16,
            dropout: 0.0,
            batch_size: 2,
            learning_rate: 0.5,
            model_file: Some(dir.join("model").to_string_lossy().into_owned()),
            ..Default::default()
        };
        let cfg = TrainConfig {
            epochs: 2,
            log_every: 1,
            validate_every: 1,
            metrics_csv: dir.join("metrics.csv").to_string_lossy().into_owned(),
            ..Default::default()
        };

        let episodes = vec![vec![
            Message::new("hi there").with_labels(["hello friend"]),
            Message::new("how are you").with_labels(["fine thanks"]).done(true),
        ]];
        let dict = Dictionary::build(
            &["hi there", "hello friend", "how are you", "fine thanks"],
            &DictOptions::default(),
        )
        .unwrap();
        let samples = SampleBuilder::new(&dict, &opts)
            .build(&episodes, &mut StdRng::seed_from_u64(1))
            .unwrap();
        (opts, cfg, dict, DialogueDataset::new(samples), dir)
    }

    #[test]
    fn test_training_run_saves_and_logs() {
        let (opts, cfg, dict, data, dir) = setup("run");
        let resolved = resolve_options(opts).unwrap();
        let optim = optim::sgd::<TestBackend>(&resolved.options);
        let mut agent = TransformerAgent::new(resolved, dict, optim, Default::default(), true).unwrap();

        let summary = run_training(&mut agent, &cfg, data.clone(), data).unwrap();
        assert_eq!(summary.epochs_run, 2);
        assert!(summary.best_valid_ppl.is_some());
        assert!(dir.join("model.opt").is_file());
        assert!(dir.join("model.shutdown_state.opt").is_file());

        let csv = std::fs::read_to_string(&cfg.metrics_csv).unwrap();
        assert_eq!(csv.lines().count(), 3);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_evaluate_leaves_metrics_clean() {
        let (opts, _, dict, data, dir) = setup("eval");
        let resolved = resolve_options(opts).unwrap();
        let optim = optim::sgd::<TestBackend>(&resolved.options);
        let mut agent = TransformerAgent::new(resolved, dict, optim, Default::default(), false).unwrap();

        let report = evaluate(&mut agent, data.samples(), 4).unwrap();
        assert!(report.loss.is_some());
        assert!(agent.report().loss.is_none());
        std::fs::remove_dir_all(&dir).ok();
    }
}
