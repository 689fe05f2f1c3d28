// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// Everything that builds, runs or updates the network lives
// here. The data layer only produces tensors for it; the
// application layer only talks to the agent.
//
// What's in this layer:
//
//   model.rs     — Encoder-decoder Transformer
//                  • shared or separate token embeddings
//                  • sinusoidal positions
//                  • post-norm encoder / decoder blocks
//                  • token cross entropy ignoring __null__
//
//   decoding.rs  — Greedy, top-k sampling and beam search;
//                  candidate ranking; next-word distribution
//
//   scheduler.rs — ReduceLROnPlateau on validation loss
//
//   optim.rs     — SGD (Nesterov momentum) / Adam with clipping
//
//   agent.rs     — TransformerAgent: observe / act, train and
//                  eval steps, metrics, save / load
//
//   trainer.rs   — Epoch loop with validation and patience
//
// Reference: Vaswani et al. (2017) Attention Is All You Need

pub mod model;

pub mod decoding;

pub mod scheduler;

pub mod optim;

/// Dialogue agent wrapping the model
pub mod agent;

/// Full training loop with validation and checkpointing
pub mod trainer;
