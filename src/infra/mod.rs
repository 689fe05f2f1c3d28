// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Cross-cutting concerns used by several layers:
//
//   dictionary.rs — Vocabulary
//                   Counts words over the training dialogues and
//                   stores them as a tokenizers WordLevel JSON, so
//                   training, evaluation and chat share one mapping.
//
//   checkpoint.rs — Saving and loading an agent
//                   Model and optimizer records via Burn's
//                   CompactRecorder, options as JSON (`.opt`).
//
//   metrics.rs    — Token loss / ppl / accuracy bookkeeping and
//                   a CSV row per validation run.

/// Word-level vocabulary and its on-disk store
pub mod dictionary;

/// Model / optimizer / options persistence
pub mod checkpoint;

/// Metrics and validation CSV logger
pub mod metrics;
