//! Training Arguments - CLI configuration for a fine-tuning run

use clap::{Args, ValueEnum};
use std::path::PathBuf;

/// Dataset selection, split names
#[derive(Args, Debug, Clone)]
pub struct ScriptArgs {
    /// Path to the chat dataset (JSON array or JSON-lines)
    #[arg(long, required = true)]
    pub dataset_name: PathBuf,

    /// Split the dataset file is registered under
    #[arg(long, default_value = "train")]
    pub dataset_train_split: String,

    /// Reserved; evaluation is not wired into the run
    #[arg(long, default_value = "test")]
    pub dataset_test_split: String,
}

/// Optimization hyperparameters and run control
#[derive(Args, Debug, Clone)]
pub struct TrainingArgs {
    /// Directory for checkpoints and the final model
    #[arg(long, required = true)]
    pub output_dir: PathBuf,

    #[arg(long, default_value_t = 8)]
    pub batch_size: usize,

    /// Micro-batches accumulated per optimizer step
    #[arg(long, default_value_t = 1)]
    pub grad_accum: usize,

    #[arg(long, default_value_t = 2e-5)]
    pub lr: f64,

    #[arg(long, default_value_t = 1e-6)]
    pub min_lr: f64,

    #[arg(long, default_value_t = 100)]
    pub warmup_steps: usize,

    #[arg(long, default_value_t = 0.0)]
    pub weight_decay: f64,

    #[arg(long, default_value_t = 3)]
    pub epochs: usize,

    /// Cap on total optimizer steps across all epochs
    #[arg(long)]
    pub max_steps: Option<usize>,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long, default_value_t = 1024)]
    pub max_seq_len: usize,

    #[arg(long, default_value_t = 10)]
    pub log_interval: usize,

    #[arg(long, default_value_t = 500)]
    pub save_interval: usize,

    /// Rotated step checkpoints kept on disk
    #[arg(long, default_value_t = 3)]
    pub save_total_limit: usize,

    #[arg(long, action)]
    pub gradient_checkpointing: bool,

    /// Checkpoint to resume from (defaults to the latest in output-dir)
    #[arg(long)]
    pub resume: Option<PathBuf>,

    #[arg(long, action)]
    pub push_to_hub: bool,

    /// Hub repo id for --push-to-hub (defaults to the output dir name)
    #[arg(long)]
    pub hub_model_id: Option<String>,
}

/// Model identity and loading options
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Hub repo id or local checkpoint directory
    #[arg(long, required = true)]
    pub model: String,

    #[arg(long, default_value = "main")]
    pub revision: String,

    /// Accept a config whose model_type is not a known llama family
    #[arg(long, action)]
    pub trust_remote_code: bool,

    #[arg(long, value_enum, default_value_t = AttnArg::Eager)]
    pub attn_implementation: AttnArg,

    #[arg(long, value_enum, default_value_t = DtypeArg::Auto)]
    pub dtype: DtypeArg,

    #[arg(long, action, conflicts_with = "load_in_8bit")]
    pub load_in_4bit: bool,

    #[arg(long, action)]
    pub load_in_8bit: bool,

    /// Restrict training to the target modules (frozen base)
    #[arg(long, action)]
    pub use_peft: bool,

    /// Module name patterns trained when --use-peft is set
    #[arg(long, value_delimiter = ',', default_values_t = [String::from("q_proj"), String::from("v_proj")])]
    pub lora_target_modules: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum AttnArg {
    Eager,
    FlashAttn,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum DtypeArg {
    Auto,
    F32,
    F16,
    Bf16,
}

/// Full argument set of the `train` subcommand
#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    #[command(flatten)]
    pub script: ScriptArgs,

    #[command(flatten)]
    pub training: TrainingArgs,

    #[command(flatten)]
    pub model: ModelArgs,
}
