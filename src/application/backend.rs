// ============================================================
// Layer 2 — Backend Dispatch
// ============================================================
// The agent is generic over the Burn backend and the optimizer
// type, but both are only known at runtime (CLI flags / saved
// options). This module picks the concrete types once and hands
// a ready agent to an `AgentTask`.
//
//   --no-gpu  → Autodiff<NdArray>   (CPU)
//   default   → Autodiff<Wgpu>
//
//   optimizer = sgd  → SgdConfig
//   optimizer = adam → AdamConfig

use anyhow::Result;
use burn::{
    backend::{Autodiff, NdArray, Wgpu},
    optim::Optimizer,
    tensor::backend::AutodiffBackend,
};

use crate::domain::options::OptimizerKind;
use crate::infra::dictionary::Dictionary;
use crate::ml::{
    agent::{ResolvedOptions, TransformerAgent},
    model::Seq2Seq,
    optim,
};

pub type GpuBackend = Autodiff<Wgpu>;
pub type CpuBackend = Autodiff<NdArray>;

/// Work that needs a concrete agent.
pub trait AgentTask {
    type Output;

    fn run<B, O>(self, agent: TransformerAgent<B, O>) -> Result<Self::Output>
    where
        B: AutodiffBackend,
        O: Optimizer<Seq2Seq<B>, B>;
}

/// Build the agent on the requested backend and run `task` with it.
pub fn run_with_agent<T: AgentTask>(
    resolved: ResolvedOptions,
    dict:     Dictionary,
    training: bool,
    no_gpu:   bool,
    task:     T,
) -> Result<T::Output> {
    if no_gpu {
        tracing::info!("Using NdArray CPU backend");
        with_optimizer::<CpuBackend, T>(resolved, dict, training, Default::default(), task)
    } else {
        let device = burn::backend::wgpu::WgpuDevice::default();
        tracing::info!("Using WGPU device: {:?}", device);
        with_optimizer::<GpuBackend, T>(resolved, dict, training, device, task)
    }
}

fn with_optimizer<B: AutodiffBackend, T: AgentTask>(
    resolved: ResolvedOptions,
    dict:     Dictionary,
    training: bool,
    device:   B::Device,
    task:     T,
) -> Result<T::Output> {
    match resolved.options.optimizer {
        OptimizerKind::Sgd => {
            let optim = optim::sgd::<B>(&resolved.options);
            task.run(TransformerAgent::new(resolved, dict, optim, device, training)?)
        }
        OptimizerKind::Adam => {
            let optim = optim::adam::<B>(&resolved.options);
            task.run(TransformerAgent::new(resolved, dict, optim, device, training)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::options::{AgentOptions, DictOptions};
    use crate::ml::agent::resolve_options;

    struct Describe;

    impl AgentTask for Describe {
        type Output = (String, bool);

        fn run<B, O>(self, agent: TransformerAgent<B, O>) -> Result<Self::Output>
        where
            B: AutodiffBackend,
            O: Optimizer<Seq2Seq<B>, B>,
        {
            Ok((agent.id().to_string(), agent.is_training()))
        }
    }

    #[test]
    fn test_cpu_dispatch_for_both_optimizers() {
        for optimizer in [OptimizerKind::Sgd, OptimizerKind::Adam] {
            let opts = AgentOptions {
                d_model: 8,
                d_inner: 16,
                n_head: 2,
                n_layers: 1,
                max_seq_len: 8,
                optimizer,
                ..Default::default()
            };
            let dict = Dictionary::build(&["a b c"], &DictOptions::default()).unwrap();
            let resolved = resolve_options(opts).unwrap();
            let (id, training) = run_with_agent(resolved, dict, true, true, Describe).unwrap();
            assert_eq!(id, "Transformer");
            assert!(training);
        }
    }
}
