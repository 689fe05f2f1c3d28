// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Defines the three subcommands: `train`, `eval` and `interactive`
// and all their configurable flags.
//
// Flags shared by every command (model file, architecture,
// history handling, decoding) live in `ModelArgs` and are
// flattened into each subcommand. When a trained model is loaded
// its saved architecture wins over the flags given here.

use clap::{Args, Subcommand};

use crate::application::{eval_use_case::EvalConfig, train_use_case::TrainConfig};
use crate::domain::options::{AgentOptions, DictOptions, DictTokenizer, HistoryReplies, OptimizerKind};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train the dialogue agent on an fbdialog file
    Train(TrainArgs),

    /// Score a trained agent (token / word perplexity)
    Eval(EvalArgs),

    /// Chat with a trained agent on the terminal
    Interactive(InteractiveArgs),
}

// ─── Shared model flags ───────────────────────────────────────────────────────
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Checkpoint base path (`<path>.opt`, `<path>.dict`, records next to it)
    #[arg(long, default_value = "checkpoints/convai")]
    pub model_file: String,

    /// Checkpoint to initialise from when `model_file` does not exist yet
    #[arg(long)]
    pub init_model: Option<String>,

    /// Dictionary file (defaults to `<model_file>.dict`)
    #[arg(long)]
    pub dict_file: Option<String>,

    /// Keep case when building the dictionary
    #[arg(long)]
    pub dict_no_lower: bool,

    /// `split` or `re`
    #[arg(long, default_value = "split")]
    pub dict_tokenizer: DictTokenizer,

    #[arg(long, default_value_t = 0)]
    pub dict_min_freq: usize,

    #[arg(long)]
    pub dict_max_tokens: Option<usize>,

    /// Hidden size of the Transformer
    #[arg(long, default_value_t = 256)]
    pub d_model: usize,

    /// Inner size of the feed-forward layers
    #[arg(long, default_value_t = 2048)]
    pub d_inner: usize,

    /// Attention heads; must divide d_model
    #[arg(long, default_value_t = 2)]
    pub n_head: usize,

    /// Encoder and decoder layers (each)
    #[arg(long, default_value_t = 4)]
    pub n_layers: usize,

    /// Longest sequence the model accepts
    #[arg(long, default_value_t = 1000)]
    pub max_seq_len: usize,

    #[arg(long, default_value_t = 0.1)]
    pub dropout: f64,

    /// Separate embedding tables for encoder and decoder
    #[arg(long)]
    pub no_share_embeddings: bool,

    /// Keep only the last N tokens of the history and of each label
    #[arg(long)]
    pub truncate: Option<usize>,

    /// none, model, label or label_else_model
    #[arg(long, default_value = "label_else_model")]
    pub history_replies: HistoryReplies,

    /// Mark turns with __start__ / __end__ in the history
    #[arg(long)]
    pub person_tokens: bool,

    /// Beam width; 1 means greedy or top-k sampling
    #[arg(long, default_value_t = 1)]
    pub beam_size: usize,

    /// Sample from the k most likely tokens (1 = greedy)
    #[arg(long, default_value_t = 1)]
    pub topk: usize,

    #[arg(long, default_value_t = 32)]
    pub max_response_len: usize,

    /// Rank label candidates when the data provides them
    #[arg(long)]
    pub rank_candidates: bool,

    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,

    /// Run on the NdArray CPU backend instead of WGPU
    #[arg(long)]
    pub no_gpu: bool,
}

impl ModelArgs {
    pub fn agent_options(&self) -> AgentOptions {
        AgentOptions {
            d_model:          self.d_model,
            d_inner:          self.d_inner,
            n_head:           self.n_head,
            n_layers:         self.n_layers,
            max_seq_len:      self.max_seq_len,
            dropout:          self.dropout,
            share_embeddings: !self.no_share_embeddings,
            batch_size:       self.batch_size,
            truncate:         self.truncate,
            history_replies:  self.history_replies,
            person_tokens:    self.person_tokens,
            beam_size:        self.beam_size,
            topk:             self.topk,
            max_response_len: self.max_response_len,
            rank_candidates:  self.rank_candidates,
            model_file:       Some(self.model_file.clone()),
            init_model:       self.init_model.clone(),
            dict_file:        self.dict_file.clone(),
            dict: DictOptions {
                lower:      !self.dict_no_lower,
                tokenizer:  self.dict_tokenizer,
                min_freq:   self.dict_min_freq,
                max_tokens: self.dict_max_tokens,
            },
            ..Default::default()
        }
    }
}

// ─── train ────────────────────────────────────────────────────────────────────
#[derive(Args, Debug)]
pub struct TrainArgs {
    /// fbdialog training file
    #[arg(long)]
    pub train_file: String,

    /// fbdialog validation file; without it the training file is split
    #[arg(long)]
    pub valid_file: Option<String>,

    /// Share of episodes kept for training when splitting
    #[arg(long, default_value_t = 0.9)]
    pub train_fraction: f64,

    /// Only read this many episodes from each file
    #[arg(long)]
    pub max_episodes: Option<usize>,

    #[arg(long, default_value_t = 10)]
    pub epochs: usize,

    /// Log the running metrics every N batches
    #[arg(long, default_value_t = 100)]
    pub log_every: usize,

    /// Validate every N epochs
    #[arg(long, default_value_t = 1)]
    pub validate_every: usize,

    /// Stop after N validations without a better perplexity
    #[arg(long, default_value_t = 12)]
    pub validation_patience: usize,

    #[arg(long, default_value = "checkpoints/metrics.csv")]
    pub metrics_csv: String,

    /// Seed for the data split and batch shuffling
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// sgd or adam
    #[arg(long, default_value = "sgd")]
    pub optimizer: OptimizerKind,

    #[arg(long, default_value_t = 3.0)]
    pub learning_rate: f64,

    /// Nesterov momentum for SGD (0 disables it)
    #[arg(long, default_value_t = 0.9)]
    pub momentum: f64,

    /// Gradient norm clip (0 disables it)
    #[arg(long, default_value_t = 0.1)]
    pub gradient_clip: f64,

    #[arg(long, default_value_t = 0.0)]
    pub label_smoothing: f32,

    #[command(flatten)]
    pub model: ModelArgs,
}

impl From<TrainArgs> for TrainConfig {
    fn from(a: TrainArgs) -> Self {
        let agent = AgentOptions {
            optimizer:       a.optimizer,
            learning_rate:   a.learning_rate,
            momentum:        a.momentum,
            gradient_clip:   a.gradient_clip,
            label_smoothing: a.label_smoothing,
            ..a.model.agent_options()
        };
        TrainConfig {
            train_file:          a.train_file,
            valid_file:          a.valid_file,
            train_fraction:      a.train_fraction,
            max_episodes:        a.max_episodes,
            epochs:              a.epochs,
            log_every:           a.log_every,
            validate_every:      a.validate_every,
            validation_patience: a.validation_patience,
            metrics_csv:         a.metrics_csv,
            seed:                a.seed,
            no_gpu:              a.model.no_gpu,
            agent,
        }
    }
}

// ─── eval ─────────────────────────────────────────────────────────────────────
#[derive(Args, Debug)]
pub struct EvalArgs {
    /// fbdialog file to evaluate on
    #[arg(long)]
    pub eval_file: String,

    #[arg(long)]
    pub max_episodes: Option<usize>,

    /// Also compute word-level perplexity
    #[arg(long)]
    pub word_ppl: bool,

    /// Number of generated replies to print
    #[arg(long, default_value_t = 5)]
    pub num_examples: usize,

    #[command(flatten)]
    pub model: ModelArgs,
}

impl From<EvalArgs> for EvalConfig {
    fn from(a: EvalArgs) -> Self {
        EvalConfig {
            eval_file:    a.eval_file,
            max_episodes: a.max_episodes,
            word_ppl:     a.word_ppl,
            num_examples: a.num_examples,
            no_gpu:       a.model.no_gpu,
            agent:        a.model.agent_options(),
        }
    }
}

// ─── interactive ──────────────────────────────────────────────────────────────
#[derive(Args, Debug)]
pub struct InteractiveArgs {
    #[command(flatten)]
    pub model: ModelArgs,
}

#[cfg(test)]
mod tests {
    use crate::cli::Cli;
    use clap::Parser;

    use super::*;

    #[test]
    fn test_train_defaults() {
        let cli = Cli::try_parse_from(["convai-transformer", "train", "--train-file", "t.txt"]).unwrap();
        let Commands::Train(args) = cli.command else { panic!("expected train") };
        let cfg: TrainConfig = args.into();
        assert_eq!(cfg.agent.optimizer, OptimizerKind::Sgd);
        assert_eq!(cfg.agent.learning_rate, 3.0);
        assert_eq!(cfg.agent.momentum, 0.9);
        assert_eq!(cfg.agent.batch_size, 64);
        assert!(cfg.agent.share_embeddings);
        assert!(cfg.agent.dict.lower);
        assert_eq!(cfg.agent.model_file.as_deref(), Some("checkpoints/convai"));
        assert_eq!(cfg.validation_patience, 12);
    }

    #[test]
    fn test_enum_flags_parse() {
        let cli = Cli::try_parse_from([
            "convai-transformer", "train", "--train-file", "t.txt",
            "--optimizer", "adam", "--history-replies", "none", "--dict-tokenizer", "re",
        ])
        .unwrap();
        let Commands::Train(args) = cli.command else { panic!("expected train") };
        let cfg: TrainConfig = args.into();
        assert_eq!(cfg.agent.optimizer, OptimizerKind::Adam);
        assert_eq!(cfg.agent.history_replies, HistoryReplies::None);
        assert_eq!(cfg.agent.dict.tokenizer, DictTokenizer::Re);
    }

    #[test]
    fn test_bad_optimizer_is_rejected() {
        let res = Cli::try_parse_from(["convai-transformer", "train", "--train-file", "t", "--optimizer", "rmsprop"]);
        assert!(res.is_err());
    }

    #[test]
    fn test_eval_args() {
        let cli = Cli::try_parse_from(["convai-transformer", "eval", "--eval-file", "v.txt", "--word-ppl", "--no-gpu"]).unwrap();
        let Commands::Eval(args) = cli.command else { panic!("expected eval") };
        let cfg: EvalConfig = args.into();
        assert!(cfg.word_ppl);
        assert!(cfg.no_gpu);
        assert_eq!(cfg.num_examples, 5);
    }
}
