// ============================================================
// Layer 2 — EvalUseCase
// ============================================================
// Scores a trained agent on an fbdialog file:
//
//   token level   loss / ppl / token_acc over every gold reply
//                 (gold prefixes, no weight updates)
//   word level    ppl from next_word_probability, one word at a
//                 time, with __end__ as the final word (optional)
//   examples      the first N replies the agent generates, next to
//                 the gold reply
//
// Word-level ppl uses surface words, so words missing from the
// dictionary are charged the unseen-word probability instead of
// the probability of __unk__.

use anyhow::{bail, Result};
use burn::{optim::Optimizer, tensor::backend::AutodiffBackend};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::application::backend::{run_with_agent, AgentTask};
use crate::data::{
    dataset::{DialogueDataset, SampleBuilder},
    loader::FbDialogLoader,
};
use crate::domain::{dialogue::Episode, options::AgentOptions, traits::DialogueSource};
use crate::infra::{
    dictionary::{DictionaryStore, END_TOKEN},
    metrics::{round_sigfigs, Report},
};
use crate::ml::{
    agent::{resolve_options, TransformerAgent},
    model::Seq2Seq,
    trainer::evaluate,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    pub eval_file:    String,
    pub max_episodes: Option<usize>,
    /// Also compute word-level perplexity (slow: one forward per word)
    pub word_ppl:     bool,
    /// How many generated replies to show
    pub num_examples: usize,
    pub no_gpu:       bool,
    /// Must name a trained model; decoding options apply as given
    pub agent:        AgentOptions,
}

/// One generated reply shown next to the gold reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub text:  String,
    pub gold:  String,
    pub model: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalSummary {
    pub report:   Report,
    pub word_ppl: Option<f64>,
    pub examples: Vec<Example>,
}

impl fmt::Display for EvalSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, ex) in self.examples.iter().enumerate() {
            writeln!(f, "── example {} ──", i + 1)?;
            writeln!(f, "[text]:  {}", ex.text.replace('\n', " / "))?;
            writeln!(f, "[gold]:  {}", ex.gold)?;
            writeln!(f, "[model]: {}", ex.model)?;
        }
        write!(f, "{}", self.report)?;
        if let Some(ppl) = self.word_ppl {
            write!(f, " | word_ppl={ppl}")?;
        }
        Ok(())
    }
}

pub struct EvalUseCase {
    config: EvalConfig,
}

impl EvalUseCase {
    pub fn new(config: EvalConfig) -> Self {
        Self { config }
    }

    pub fn execute(&self) -> Result<EvalSummary> {
        let cfg = &self.config;

        let resolved = resolve_options(cfg.agent.clone())?;
        if resolved.checkpoint.is_none() {
            bail!("No trained model found. Run `train` first or pass --model-file");
        }
        let Some(dict_file) = &resolved.options.dict_file else {
            bail!("The model has no dictionary file");
        };
        let dict = DictionaryStore::new(dict_file).load()?;

        let episodes = FbDialogLoader::new(&cfg.eval_file)
            .with_max_episodes(cfg.max_episodes)
            .load_all()?;

        let samples = SampleBuilder::new(&dict, &resolved.options)
            .build(&episodes, &mut StdRng::seed_from_u64(0))?;

        let task = EvalTask { config: cfg, episodes, data: DialogueDataset::new(samples) };
        let summary = run_with_agent(resolved, dict, false, cfg.no_gpu, task)?;
        tracing::info!("Evaluation of '{}': {}", cfg.eval_file, summary.report);
        Ok(summary)
    }
}

struct EvalTask<'a> {
    config:   &'a EvalConfig,
    episodes: Vec<Episode>,
    data:     DialogueDataset,
}

impl AgentTask for EvalTask<'_> {
    type Output = EvalSummary;

    fn run<B, O>(self, mut agent: TransformerAgent<B, O>) -> Result<EvalSummary>
    where
        B: AutodiffBackend,
        O: Optimizer<Seq2Seq<B>, B>,
    {
        let batch_size = agent.options().batch_size;
        let report = evaluate(&mut agent, self.data.samples(), batch_size)?;

        let word_ppl = if self.config.word_ppl {
            Some(word_perplexity(&mut agent, &self.episodes)?)
        } else {
            None
        };

        let examples = generate_examples(&mut agent, &self.episodes, self.config.num_examples)?;
        Ok(EvalSummary { report, word_ppl, examples })
    }
}

/// exp(mean -ln p(word | context, previous words)) over every word of
/// every first gold reply, __end__ included.
pub fn word_perplexity<B, O>(agent: &mut TransformerAgent<B, O>, episodes: &[Episode]) -> Result<f64>
where
    B: AutodiffBackend,
    O: Optimizer<Seq2Seq<B>, B>,
{
    agent.reset();
    let mut loss = 0.0f64;
    let mut words = 0usize;

    for episode in episodes {
        for message in episode {
            let observation = agent.observe(message.clone(), 0)?;
            let Some(label) = message.labels.first() else { continue };
            if observation.sample.context.is_empty() {
                continue;
            }

            let mut reply = agent.dict().tokenize(label)?;
            reply.push(END_TOKEN.to_string());
            for i in 0..reply.len() {
                let dist = agent.next_word_probability(&observation.sample.context, &reply[..i]);
                loss -= dist.get(&reply[i]).ln();
                words += 1;
            }
        }
    }
    agent.reset();

    if words == 0 {
        bail!("No labelled turns to compute word perplexity on");
    }
    let ppl = (loss / words as f64).exp();
    tracing::info!("Word-level ppl over {words} words: {ppl}");
    Ok(round_sigfigs(ppl, 4))
}

/// Let the agent reply to the first `n` labelled turns.
fn generate_examples<B, O>(
    agent:    &mut TransformerAgent<B, O>,
    episodes: &[Episode],
    n:        usize,
) -> Result<Vec<Example>>
where
    B: AutodiffBackend,
    O: Optimizer<Seq2Seq<B>, B>,
{
    let mut examples = Vec::with_capacity(n);
    if n == 0 {
        return Ok(examples);
    }
    agent.reset();

    'episodes: for episode in episodes {
        for message in episode {
            agent.observe(message.clone(), 0)?;
            let reply = agent.act(0)?;
            if let (Some(gold), Some(model)) = (message.labels.first(), reply.text) {
                examples.push(Example {
                    text: message.text.clone(),
                    gold: gold.clone(),
                    model,
                });
                if examples.len() >= n {
                    break 'episodes;
                }
            }
        }
    }

    agent.reset();
    Ok(examples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::dialogue::Message;
    use crate::domain::options::DictOptions;
    use crate::infra::dictionary::Dictionary;
    use crate::ml::optim;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray>;

    fn agent() -> TransformerAgent<TestBackend, impl Optimizer<Seq2Seq<TestBackend>, TestBackend>> {
        let opts = AgentOptions {
            d_model: 8,
            d_inner: 16,
            n_head: 2,
            n_layers: 1,
            max_seq_len: 16,
            dropout: 0.0,
            max_response_len: 3,
            ..Default::default()
        };
        let dict = Dictionary::build(&["hi there", "hello friend", "bye"], &DictOptions::default()).unwrap();
        let resolved = resolve_options(opts).unwrap();
        let optim = optim::sgd::<TestBackend>(&resolved.options);
        TransformerAgent::new(resolved, dict, optim, Default::default(), false).unwrap()
    }

    fn episodes() -> Vec<Episode> {
        vec![vec![
            Message::new("hi there").with_labels(["hello friend"]),
            Message::new("bye").with_labels(["bye zebra"]).done(true),
        ]]
    }

    #[test]
    fn test_word_perplexity_is_finite() {
        let mut a = agent();
        let ppl = word_perplexity(&mut a, &episodes()).unwrap();
        assert!(ppl.is_finite());
        assert!(ppl > 1.0);
    }

    #[test]
    fn test_word_perplexity_needs_labels() {
        let mut a = agent();
        let unlabelled = vec![vec![Message::new("hi there").done(true)]];
        assert!(word_perplexity(&mut a, &unlabelled).is_err());
    }

    #[test]
    fn test_examples_are_capped() {
        let mut a = agent();
        let examples = generate_examples(&mut a, &episodes(), 1).unwrap();
        assert_eq!(examples.len(), 1);
        assert_eq!(examples[0].gold, "hello friend");
        assert!(generate_examples(&mut a, &episodes(), 0).unwrap().is_empty());
    }

    #[test]
    fn test_summary_display() {
        let summary = EvalSummary {
            report: Report { loss: Some(1.0), ppl: Some(2.718), ..Default::default() },
            word_ppl: Some(3.5),
            examples: vec![],
        };
        assert_eq!(summary.to_string(), "loss=1 | ppl=2.718 | word_ppl=3.5");
    }
}
