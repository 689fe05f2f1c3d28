// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// Everything from fbdialog text files to tensor batches.
//
//   fbdialog .txt
//       │
//       ▼
//   FbDialogLoader    → episodes of Messages
//       │
//       ▼
//   DialogueHistory   → running token context per conversation
//       │
//       ▼
//   SampleBuilder     → (context, target) pairs
//       │
//       ▼
//   DialogueDataset   → Burn Dataset
//       │
//       ▼
//   DialogueBatcher   → padded src / tgt_in / tgt_out tensors
//
// Each module is responsible for exactly one step.

/// Reads ParlAI fbdialog files
pub mod loader;

/// Cleans raw turn text
pub mod preprocessor;

/// Maintains the token history of a conversation
pub mod history;

/// Samples and Burn's Dataset impl
pub mod dataset;

/// Burn's Batcher impl
pub mod batcher;

/// Shuffles and splits episodes into train/validation sets
pub mod splitter;
