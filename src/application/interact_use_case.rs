// ============================================================
// Layer 2 — InteractUseCase
// ============================================================
// Chat with a trained agent on stdin / stdout.
//
//   Enter Your Message: hi!
//   [Transformer]: hello , how are you ?
//
// Commands:
//   quit   leave the chat
//   reset  start a new conversation (history cleared)
//
// Every line is one observation for slot 0 that never ends the
// episode, so the agent keeps the whole conversation as context.

use anyhow::{bail, Context, Result};
use burn::{optim::Optimizer, tensor::backend::AutodiffBackend};
use std::io::{self, BufRead, Write};

use crate::application::backend::{run_with_agent, AgentTask};
use crate::domain::{dialogue::Message, options::AgentOptions, traits::ConversationalAgent};
use crate::infra::dictionary::DictionaryStore;
use crate::ml::{
    agent::{resolve_options, TransformerAgent},
    model::Seq2Seq,
};

pub struct InteractUseCase {
    agent:  AgentOptions,
    no_gpu: bool,
}

impl InteractUseCase {
    pub fn new(agent: AgentOptions, no_gpu: bool) -> Self {
        Self { agent, no_gpu }
    }

    pub fn execute(&self) -> Result<()> {
        let resolved = resolve_options(self.agent.clone())?;
        if resolved.checkpoint.is_none() {
            bail!("No trained model found. Run `train` first or pass --model-file");
        }
        let Some(dict_file) = &resolved.options.dict_file else {
            bail!("The model has no dictionary file");
        };
        let dict = DictionaryStore::new(dict_file).load()?;

        run_with_agent(resolved, dict, false, self.no_gpu, StdioChat)
    }
}

struct StdioChat;

impl AgentTask for StdioChat {
    type Output = ();

    fn run<B, O>(self, mut agent: TransformerAgent<B, O>) -> Result<()>
    where
        B: AutodiffBackend,
        O: Optimizer<Seq2Seq<B>, B>,
    {
        let stdin = io::stdin();
        let stdout = io::stdout();
        chat_loop(&mut agent, stdin.lock(), stdout.lock())
    }
}

/// Read lines from `input` until EOF or `quit`, replying on `output`.
pub fn chat_loop<A, R, W>(agent: &mut A, mut input: R, mut output: W) -> Result<()>
where
    A: ConversationalAgent,
    R: BufRead,
    W: Write,
{
    let mut line = String::new();
    loop {
        write!(output, "Enter Your Message: ")?;
        output.flush()?;

        line.clear();
        if input.read_line(&mut line).context("Cannot read from stdin")? == 0 {
            break;
        }
        let text = line.trim();
        match text {
            "" => continue,
            "quit" => break,
            "reset" => {
                agent.reset();
                writeln!(output, "[history cleared]")?;
                continue;
            }
            _ => {}
        }

        agent.observe(Message::new(text).done(false), 0)?;
        let reply = agent.act(0)?;
        let said = reply.text.unwrap_or_default();
        writeln!(output, "[{}]: {}", reply.id, said)?;
        tracing::debug!("turn: {text:?} -> {said:?}");
    }
    Ok(())
}
