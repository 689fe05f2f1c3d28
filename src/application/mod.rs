// ============================================================
// Layer 2 — Application / Use Cases
// ============================================================
// This layer orchestrates all the other layers to accomplish
// a specific goal (training, evaluating or chatting).
//
// Rules for this layer:
//   - No ML math or model code here
//   - No argument parsing here (that's Layer 1)
//   - Only workflow coordination
//
// The backend and optimizer types are chosen here, once, and a
// fully typed agent is handed to each workflow.

// Runtime choice of Burn backend and optimizer
pub mod backend;

// The training workflow
pub mod train_use_case;

// Token / word perplexity and sample replies
pub mod eval_use_case;

// Chatting on stdin
pub mod interact_use_case;
