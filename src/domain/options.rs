// ============================================================
// Layer 3 — Agent Options
// ============================================================
// Every knob the agent understands, in one serialisable struct.
// The same struct is written next to a checkpoint as `<model>.opt`
// so a later run can rebuild the exact same architecture.
//
// Only the architecture-defining subset (MODEL_ARGS) is taken
// from a saved file when resuming; everything else (learning
// rate, batch size, decoding settings...) stays as given on the
// command line.

use std::{fmt, str::FromStr};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Options that describe the network itself and must match the
/// weights on disk.
pub const MODEL_ARGS: &[&str] = &[
    "d_model",
    "d_inner",
    "n_head",
    "n_layers",
    "max_seq_len",
    "share_embeddings",
    "optimizer",
    "dict",
];

// ─── OptimizerKind ────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

impl FromStr for OptimizerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sgd" => Ok(Self::Sgd),
            "adam" => Ok(Self::Adam),
            other => bail!("unknown optimizer '{other}' (expected sgd or adam)"),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sgd => f.write_str("sgd"),
            Self::Adam => f.write_str("adam"),
        }
    }
}

// ─── HistoryReplies ───────────────────────────────────────────────────────────
/// Which reply is appended to the dialogue history before the
/// partner's next message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryReplies {
    /// Never keep our own side of the conversation
    None,
    /// Keep what the model actually said
    Model,
    /// Keep the gold label
    Label,
    /// Keep the gold label if there was one, otherwise the model's reply
    LabelElseModel,
}

impl FromStr for HistoryReplies {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "model" => Ok(Self::Model),
            "label" => Ok(Self::Label),
            "label_else_model" => Ok(Self::LabelElseModel),
            other => bail!(
                "unknown history mode '{other}' (expected none, model, label or label_else_model)"
            ),
        }
    }
}

// ─── DictTokenizer ────────────────────────────────────────────────────────────
/// How raw text is cut into dictionary tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DictTokenizer {
    /// Pad `. , ; : ! ?` with spaces, then split on whitespace
    Split,
    /// Runs of word characters or of punctuation
    Re,
}

impl FromStr for DictTokenizer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "split" => Ok(Self::Split),
            "re" => Ok(Self::Re),
            other => bail!("unknown dictionary tokenizer '{other}' (expected split or re)"),
        }
    }
}

/// Vocabulary construction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DictOptions {
    pub lower:      bool,
    pub tokenizer:  DictTokenizer,
    /// Tokens seen fewer times than this are left out of the vocabulary
    pub min_freq:   usize,
    /// Upper bound on regular (non-special) tokens
    pub max_tokens: Option<usize>,
}

impl Default for DictOptions {
    fn default() -> Self {
        Self {
            lower:      true,
            tokenizer:  DictTokenizer::Split,
            min_freq:   0,
            max_tokens: None,
        }
    }
}

// ─── AgentOptions ─────────────────────────────────────────────────────────────
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOptions {
    // architecture
    pub d_model:          usize,
    pub d_inner:          usize,
    pub n_head:           usize,
    pub n_layers:         usize,
    pub max_seq_len:      usize,
    pub dropout:          f64,
    /// Encoder and decoder use one embedding table
    pub share_embeddings: bool,

    // optimisation
    pub optimizer:        OptimizerKind,
    pub learning_rate:    f64,
    pub momentum:         f64,
    pub gradient_clip:    f64,
    pub label_smoothing:  f32,
    pub batch_size:       usize,

    // dialogue handling
    /// Keep only the last N tokens of history and of each label
    pub truncate:         Option<usize>,
    pub history_replies:  HistoryReplies,
    pub person_tokens:    bool,

    // generation
    pub beam_size:        usize,
    pub topk:             usize,
    pub max_response_len: usize,
    pub rank_candidates:  bool,

    // files
    pub model_file:       Option<String>,
    pub init_model:       Option<String>,
    pub dict_file:        Option<String>,
    pub dict:             DictOptions,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            d_model:          256,
            d_inner:          2048,
            n_head:           2,
            n_layers:         4,
            max_seq_len:      1000,
            dropout:          0.1,
            share_embeddings: true,
            optimizer:        OptimizerKind::Sgd,
            learning_rate:    1.0,
            momentum:         0.0,
            gradient_clip:    0.1,
            label_smoothing:  0.0,
            batch_size:       64,
            truncate:         None,
            history_replies:  HistoryReplies::LabelElseModel,
            person_tokens:    false,
            beam_size:        1,
            topk:             1,
            max_response_len: 32,
            rank_candidates:  false,
            model_file:       None,
            init_model:       None,
            dict_file:        None,
            dict:             DictOptions::default(),
        }
    }
}

impl AgentOptions {
    /// Basic consistency checks run before any model is built.
    pub fn validate(&self) -> Result<()> {
        if self.n_head == 0 || self.d_model % self.n_head != 0 {
            bail!(
                "d_model ({}) must be a positive multiple of n_head ({})",
                self.d_model,
                self.n_head
            );
        }
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if self.beam_size == 0 || self.topk == 0 {
            bail!("beam_size and topk must be at least 1");
        }
        if !(0.0..1.0).contains(&self.dropout) {
            bail!("dropout must be in [0, 1), got {}", self.dropout);
        }
        Ok(())
    }

    /// Take the architecture options from a saved file, logging every
    /// value that changes. Also inherits the saved dictionary path when
    /// none was given.
    pub fn override_from(&mut self, saved: &AgentOptions) -> Result<()> {
        let mut current = serde_json::to_value(&*self)?;
        let saved_value = serde_json::to_value(saved)?;

        for key in MODEL_ARGS {
            let Some(new) = saved_value.get(*key) else { continue };
            match current.get(*key) {
                Some(old) if old != new => {
                    tracing::info!("Overriding option: | {key}: {old} => {new} |");
                }
                None => tracing::info!("Adding new option: | {key}: {new} |"),
                _ => {}
            }
            current[*key] = new.clone();
        }

        let mut merged: AgentOptions = serde_json::from_value(current)?;
        if merged.dict_file.is_none() {
            if let Some(path) = &saved.dict_file {
                tracing::info!("No dictionary path given, using previous path {path}");
                merged.dict_file = Some(path.clone());
            }
        }
        *self = merged;
        Ok(())
    }
}
