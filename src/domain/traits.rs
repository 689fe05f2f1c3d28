// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// The application layer talks to data sources and agents only
// through these traits, so a new dataset format or a different
// model can be dropped in without touching the use cases.

use anyhow::Result;

use crate::domain::dialogue::{Episode, Message, Reply};

// ─── DialogueSource ───────────────────────────────────────────────────────────
/// Anything that can produce a list of conversations.
///
/// Implementations:
///   - FbDialogLoader → ParlAI fbdialog text files
pub trait DialogueSource {
    fn load_all(&self) -> Result<Vec<Episode>>;
}

// ─── ConversationalAgent ──────────────────────────────────────────────────────
/// The per-turn interface of a dialogue agent.
///
/// A caller alternates `observe` and `act`. Agents that serve several
/// conversations at once keep one history per `slot`.
pub trait ConversationalAgent {
    /// Feed the next partner message of conversation `slot`.
    fn observe(&mut self, message: Message, slot: usize) -> Result<()>;

    /// Produce the reply to the last message observed in `slot`.
    fn act(&mut self, slot: usize) -> Result<Reply>;

    /// Forget all conversation state.
    fn reset(&mut self);
}
