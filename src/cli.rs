use crate::preview::PreviewArgs;
use crate::train::TrainArgs;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about = "Completion-only SFT for causal LMs", long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fine-tune a model on a chat dataset
    Train(TrainArgs),

    /// Show the per-token loss mask for the first examples
    Preview(PreviewArgs),
}
