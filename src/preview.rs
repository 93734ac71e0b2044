//! Mask preview - per-token LEARN/SKIP check of the collator output

use anyhow::Result;
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};

use crate::collator::{CompletionOnlyCollator, IGNORE_INDEX};
use crate::dataset::{ChatDataset, ChatTemplate};
use crate::model;
use crate::train::args::{ModelArgs, ScriptArgs};
use crate::train::RESPONSE_TEMPLATE;

#[derive(Args, Debug, Clone)]
pub struct PreviewArgs {
    #[command(flatten)]
    pub script: ScriptArgs,

    #[command(flatten)]
    pub model: ModelArgs,

    /// Conversations to preview
    #[arg(long, default_value_t = 2)]
    pub count: usize,

    #[arg(long, default_value_t = 1024)]
    pub max_seq_len: usize,

    /// Tokens shown per conversation
    #[arg(long, default_value_t = 50)]
    pub limit: usize,
}

pub fn run(args: PreviewArgs) -> Result<()> {
    let tokenizer = model::load_tokenizer(&args.model)?;
    let dataset = ChatDataset::load_json(&args.script.dataset_name, &args.script.dataset_train_split)?;
    let split = dataset.split(&args.script.dataset_train_split)?;

    let collator = CompletionOnlyCollator::new(
        RESPONSE_TEMPLATE,
        tokenizer.clone(),
        ChatTemplate::chatml(),
        args.max_seq_len,
    )?;

    let count = args.count.min(split.len());
    let pb = ProgressBar::new(count as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )?
            .progress_chars("#>-"),
    );

    let mut rows = Vec::with_capacity(count);
    for conversation in split.iter().take(count) {
        let ids = collator.encode(conversation)?;
        let labels = collator.mask_labels(&ids);
        rows.push((ids, labels));
        pb.inc(1);
    }
    pb.finish_with_message("Tokenization complete");

    for (idx, (ids, labels)) in rows.iter().enumerate() {
        let learn = labels.iter().filter(|&&l| l != IGNORE_INDEX).count();
        println!(
            "--- Conversation {} ({} tokens, {} trainable) ---",
            idx,
            ids.len(),
            learn
        );
        for i in 0..args.limit.min(ids.len()) {
            let status = if labels[i] == IGNORE_INDEX { "SKIP " } else { "LEARN" };
            let piece = tokenizer
                .id_to_token(ids[i])
                .unwrap_or_else(|| "?".to_string());
            println!("[{:03}] ID:{:6} Mask:{} {}", i, ids[i], status, piece);
        }
    }

    Ok(())
}
