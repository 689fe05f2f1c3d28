// ============================================================
// Layer 5 — Optimizers
// ============================================================
// Builds the optimizer named in AgentOptions.
//
//   sgd   plain SGD; Nesterov momentum when momentum > 0
//   adam  Adam with default betas / epsilon
//
// Both clip gradients by L2 norm when gradient_clip > 0. Burn
// clips each parameter tensor separately rather than over the
// global norm of all gradients.
//
// The learning rate is not part of the optimizer: the agent passes
// the scheduler's current value to every `step`.

use burn::{
    grad_clipping::GradientClippingConfig,
    optim::{momentum::MomentumConfig, AdamConfig, Optimizer, SgdConfig},
    tensor::backend::AutodiffBackend,
};

use crate::domain::options::AgentOptions;
use crate::ml::model::Seq2Seq;

fn clipping(opts: &AgentOptions) -> Option<GradientClippingConfig> {
    (opts.gradient_clip > 0.0).then(|| GradientClippingConfig::Norm(opts.gradient_clip as f32))
}

pub fn sgd<B: AutodiffBackend>(opts: &AgentOptions) -> impl Optimizer<Seq2Seq<B>, B> {
    let momentum = (opts.momentum > 0.0).then(|| {
        MomentumConfig::new()
            .with_momentum(opts.momentum)
            .with_dampening(0.0)
            .with_nesterov(true)
    });
    SgdConfig::new()
        .with_momentum(momentum)
        .with_gradient_clipping(clipping(opts))
        .init::<B, Seq2Seq<B>>()
}

pub fn adam<B: AutodiffBackend>(opts: &AgentOptions) -> impl Optimizer<Seq2Seq<B>, B> {
    AdamConfig::new()
        .with_grad_clipping(clipping(opts))
        .init::<B, Seq2Seq<B>>()
}
