// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain Rust types and traits describing conversations and the
// options of an agent. Nothing in here knows about tensors.

// Messages, episodes and replies
pub mod dialogue;

// Serialisable agent configuration
pub mod options;

// Abstractions implemented by the data and ml layers
pub mod traits;
