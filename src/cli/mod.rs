// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// This is the entry point for all user interaction.
// It uses the `clap` crate to parse command line arguments.
// All business logic is delegated to Layer 2 (application).
//
// Three commands are supported:
//   1. `train`       — trains the agent on fbdialog files
//   2. `eval`        — scores a trained agent on an fbdialog file
//   3. `interactive` — chat with a trained agent
//
// Reference: Rust Book §12 (CLI programs)

pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, EvalArgs, InteractiveArgs, TrainArgs};

#[derive(Parser, Debug)]
#[command(
    name = "convai-transformer",
    version = "0.1.0",
    about = "Train, evaluate and chat with a seq2seq Transformer dialogue agent."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Route the subcommand to its use case.
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args)       => run_train(args),
            Commands::Eval(args)        => run_eval(args),
            Commands::Interactive(args) => run_interactive(args),
        }
    }
}

fn run_train(args: TrainArgs) -> Result<()> {
    use crate::application::train_use_case::TrainUseCase;

    tracing::info!("Starting training on: {}", args.train_file);
    let summary = TrainUseCase::new(args.into()).execute()?;

    match summary.best_valid_ppl {
        Some(ppl) => println!("Training complete after {} epochs. Best valid ppl: {ppl}", summary.epochs_run),
        None => println!("Training complete after {} epochs.", summary.epochs_run),
    }
    if summary.stopped_early {
        println!("Stopped early: validation ppl stopped improving.");
    }
    Ok(())
}

fn run_eval(args: EvalArgs) -> Result<()> {
    use crate::application::eval_use_case::EvalUseCase;

    let summary = EvalUseCase::new(args.into()).execute()?;
    println!("{summary}");
    Ok(())
}

fn run_interactive(args: InteractiveArgs) -> Result<()> {
    use crate::application::interact_use_case::InteractUseCase;

    println!("Type `reset` to start a new conversation, `quit` to leave.");
    InteractUseCase::new(args.model.agent_options(), args.model.no_gpu).execute()
}
