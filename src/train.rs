//! Fine-tuning pipeline: args -> model/tokenizer -> dataset -> collator -> loop

pub mod args;
pub mod checkpoint;
pub mod training_loop;

pub use args::TrainArgs;
pub use training_loop::SftTrainer;

use anyhow::Result;
use tracing::info;

use crate::collator::CompletionOnlyCollator;
use crate::dataset::{ChatDataset, ChatTemplate};
use crate::model::{self, ModelInitKwargs};
use crate::peft;
use crate::push;

/// Marker opening an assistant turn in rendered ChatML text. The collator
/// masks every label before the end of this span.
pub const RESPONSE_TEMPLATE: &str = "<|im_start|>assistant\n";

/// Main training entry
pub fn run(args: TrainArgs) -> Result<()> {
    let TrainArgs {
        script,
        training,
        model: model_args,
    } = args;

    info!("--- Completion-Only SFT ---");
    info!("Model: {} (revision {})", model_args.model, model_args.revision);
    info!(
        "Dataset: {:?} (split '{}')",
        script.dataset_name, script.dataset_train_split
    );

    // Model init kwargs & Tokenizer
    let kwargs = ModelInitKwargs::resolve(&model_args, &training)?;
    let tokenizer = model::load_tokenizer(&model_args)?;
    let loaded = model::load_model(&model_args.model, &kwargs)?;

    // Dataset
    let dataset = ChatDataset::load_json(&script.dataset_name, &script.dataset_train_split)?;
    let train_split = dataset.split(&script.dataset_train_split)?.to_vec();

    let mut max_seq_len = training.max_seq_len;
    if max_seq_len > loaded.config.seq_len {
        tracing::warn!(
            "⚠️ max_seq_len {} exceeds the model's {} positions; clamping",
            max_seq_len,
            loaded.config.seq_len
        );
        max_seq_len = loaded.config.seq_len;
    }

    let collator = CompletionOnlyCollator::new(
        RESPONSE_TEMPLATE,
        tokenizer.clone(),
        ChatTemplate::chatml(),
        max_seq_len,
    )?;
    let peft_config = peft::get_peft_config(&model_args);

    // Training
    let output_dir = training.output_dir.clone();
    let push_requested = training.push_to_hub;
    let hub_model_id = training.hub_model_id.clone();

    let mut trainer = SftTrainer::new(
        loaded,
        kwargs.device.clone(),
        tokenizer,
        collator,
        train_split,
        training,
        peft_config,
    );

    trainer.train()?;

    // Save and push to hub
    trainer.save_model(&output_dir)?;
    if push_requested {
        let dataset_name = script.dataset_name.display().to_string();
        let url = push::push_to_hub(
            &output_dir,
            hub_model_id.as_deref(),
            &dataset_name,
            &model_args.model,
        )?;
        info!("✅ Pushed to {}", url);
    }

    Ok(())
}
