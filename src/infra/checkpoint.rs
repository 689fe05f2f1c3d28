// ============================================================
// Layer 6 — Checkpoint Manager
// ============================================================
// Saves and restores an agent using Burn's CompactRecorder.
//
// A checkpoint is addressed by a base path, e.g. `models/convai`:
//
//   models/convai.opt                options + saved optimizer kind (JSON)
//   models/convai.dict               dictionary (tokenizer JSON)
//   models/convai_model.mpk.gz       model weights
//   models/convai_optim.mpk.gz       optimizer state (training only)
//
// The recorder replaces anything after the last '.' of a file name
// with its own extension, so record stems are derived from the base
// name with dots turned into underscores. `models/convai.shutdown_state`
// therefore records to `models/convai_shutdown_state_model.mpk.gz`
// and never overwrites the main checkpoint.
//
// The `.opt` file is written last and doubles as the marker that a
// checkpoint is complete.

use anyhow::{Context, Result};
use burn::{
    optim::Optimizer,
    prelude::*,
    record::{CompactRecorder, Recorder},
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
};

use crate::domain::options::{AgentOptions, OptimizerKind};
use crate::ml::model::Seq2Seq;

/// Contents of the `.opt` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub options:        AgentOptions,
    /// Kind of optimizer whose state was recorded, if any
    pub optimizer_type: Option<OptimizerKind>,
}

pub struct CheckpointManager {
    base: PathBuf,
}

impl CheckpointManager {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn opt_path(&self) -> PathBuf {
        self.sibling(".opt")
    }

    pub fn dict_path(&self) -> PathBuf {
        self.sibling(".dict")
    }

    /// A checkpoint exists once its `.opt` file has been written.
    pub fn exists(&self) -> bool {
        self.opt_path().is_file()
    }

    // ── Model ─────────────────────────────────────────────────────────────────
    pub fn save_model<B: Backend>(&self, model: &Seq2Seq<B>) -> Result<()> {
        self.ensure_parent()?;
        let path = self.record_stem("model");
        CompactRecorder::new()
            .record(model.clone().into_record(), path.clone())
            .with_context(|| format!("Failed to save model weights to '{}'", path.display()))?;
        tracing::debug!("Saved model weights to '{}'", path.display());
        Ok(())
    }

    /// Restore weights into `model`, which must have the saved architecture.
    pub fn load_model<B: Backend>(&self, model: Seq2Seq<B>, device: &B::Device) -> Result<Seq2Seq<B>> {
        let path = self.record_stem("model");
        let record = CompactRecorder::new()
            .load(path.clone(), device)
            .with_context(|| format!("Cannot load model weights '{}'", path.display()))?;
        Ok(model.load_record(record))
    }

    // ── Optimizer ─────────────────────────────────────────────────────────────
    pub fn save_optimizer<B, O>(&self, optim: &O) -> Result<()>
    where
        B: AutodiffBackend,
        O: Optimizer<Seq2Seq<B>, B>,
    {
        self.ensure_parent()?;
        let path = self.record_stem("optim");
        <CompactRecorder as Recorder<B>>::record(&CompactRecorder::new(), optim.to_record(), path.clone())
            .with_context(|| format!("Failed to save optimizer state to '{}'", path.display()))?;
        Ok(())
    }

    /// Read the optimizer record without touching the live optimizer, so
    /// a failed load leaves it usable.
    pub fn load_optimizer_record<B, O>(
        &self,
        device: &B::Device,
    ) -> Result<<O as Optimizer<Seq2Seq<B>, B>>::Record>
    where
        B: AutodiffBackend,
        O: Optimizer<Seq2Seq<B>, B>,
    {
        let path = self.record_stem("optim");
        <CompactRecorder as Recorder<B>>::load(&CompactRecorder::new(), path.clone(), device)
            .with_context(|| format!("Cannot load optimizer state '{}'", path.display()))
    }

    // ── Options ───────────────────────────────────────────────────────────────
    pub fn save_meta(&self, meta: &CheckpointMeta) -> Result<()> {
        self.ensure_parent()?;
        let path = self.opt_path();
        let json = serde_json::to_string_pretty(meta)?;
        fs::write(&path, json)
            .with_context(|| format!("Cannot write options to '{}'", path.display()))?;
        tracing::debug!("Saved options to '{}'", path.display());
        Ok(())
    }

    pub fn load_meta(&self) -> Result<CheckpointMeta> {
        let path = self.opt_path();
        let json = fs::read_to_string(&path).with_context(|| {
            format!("Cannot read options from '{}'. Has this model been trained?", path.display())
        })?;
        serde_json::from_str(&json)
            .with_context(|| format!("Malformed options file '{}'", path.display()))
    }

    // ── Paths ─────────────────────────────────────────────────────────────────
    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut s = self.base.clone().into_os_string();
        s.push(suffix);
        PathBuf::from(s)
    }

    fn record_stem(&self, kind: &str) -> PathBuf {
        let name = self
            .base
            .file_name()
            .map(|n| n.to_string_lossy().replace('.', "_"))
            .unwrap_or_else(|| "checkpoint".to_string());
        self.base.with_file_name(format!("{name}_{kind}"))
    }

    fn ensure_parent(&self) -> Result<()> {
        if let Some(dir) = self.base.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("Cannot create checkpoint directory '{}'", dir.display()))?;
            }
        }
        Ok(())
    }
}
