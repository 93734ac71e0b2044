//! Training Loop - masked-loss optimization over collated chat batches

use anyhow::Result;
use candle_core::{Device, Tensor, D};
use candle_nn::{ops, AdamW, Optimizer, ParamsAdamW, VarMap};
use candle_transformers::models::llama2_c::{Cache, Llama};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::VecDeque;
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokenizers::Tokenizer;
use tracing::{error, info, warn};

use super::args::TrainingArgs;
use super::checkpoint::{
    find_checkpoint_path, load_start_step, save_securely, save_training_state,
};
use crate::collator::CompletionOnlyCollator;
use crate::dataset::Conversation;
use crate::model::{LoadedModel, ModelConfig};
use crate::peft::{self, PeftConfig};

/// Owns the model, collator and train split for one blocking `train()` call.
pub struct SftTrainer {
    model: Llama,
    cache: Cache,
    varmap: VarMap,
    config: ModelConfig,
    device: Device,
    tokenizer: Tokenizer,
    collator: CompletionOnlyCollator,
    conversations: Vec<Conversation>,
    args: TrainingArgs,
    peft: Option<PeftConfig>,
}

impl SftTrainer {
    pub fn new(
        loaded: LoadedModel,
        device: Device,
        tokenizer: Tokenizer,
        collator: CompletionOnlyCollator,
        conversations: Vec<Conversation>,
        args: TrainingArgs,
        peft: Option<PeftConfig>,
    ) -> Self {
        Self {
            model: loaded.model,
            cache: loaded.cache,
            varmap: loaded.varmap,
            config: loaded.config,
            device,
            tokenizer,
            collator,
            conversations,
            args,
            peft,
        }
    }

    /// Run the full optimization loop. Blocks until the planned steps are
    /// exhausted or an interrupt asks for a graceful stop.
    pub fn train(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.args.output_dir)?;

        if self.conversations.is_empty() {
            anyhow::bail!("❌ Training dataset is empty! Check the input file and split name.");
        }

        let batch_size = self.args.batch_size.max(1);
        let accum = self.args.grad_accum.max(1);
        let batches_per_epoch = self.conversations.len().div_ceil(batch_size);
        let steps_per_epoch = batches_per_epoch.div_ceil(accum).max(1);
        let mut total_steps = self.args.epochs * steps_per_epoch;
        if let Some(max_steps) = self.args.max_steps {
            total_steps = total_steps.min(max_steps);
        }
        if total_steps == 0 {
            anyhow::bail!("Nothing to do: zero optimizer steps (epochs={})", self.args.epochs);
        }

        let optim_vars = peft::trainable_vars(&self.varmap, self.peft.as_ref())?;
        let params = ParamsAdamW {
            lr: self.args.lr,
            weight_decay: self.args.weight_decay,
            ..Default::default()
        };
        let mut optimizer = AdamW::new(optim_vars, params)?;

        let mut start_step = 0;
        match find_checkpoint_path(self.args.resume.as_ref(), &self.args.output_dir) {
            Some(path) if path.exists() => {
                info!("Resuming from checkpoint: {:?}", path);
                match self.varmap.load(&path) {
                    Ok(()) => {
                        info!("✅ Checkpoint loaded successfully.");
                        start_step = load_start_step(&self.args.output_dir);
                    }
                    Err(e) => {
                        if self.args.resume.is_some() {
                            // User explicitly requested this checkpoint, fail hard.
                            anyhow::bail!("❌ Failed to load requested checkpoint {:?}: {}", path, e);
                        }
                        warn!("⚠️ Failed to load auto-checkpoint {:?}: {}", path, e);
                        warn!("⚠️ Likely shape mismatch or corrupt file. Starting fresh instead.");
                    }
                }
            }
            Some(path) => anyhow::bail!("⚠️ Specified checkpoint not found: {:?}", path),
            None => info!("No checkpoint found. Starting fresh."),
        }
        if start_step > 0 {
            info!("Resuming from Step {}", start_step);
        }

        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();
        let ctrl_c_count = Arc::new(AtomicUsize::new(0));
        let c = ctrl_c_count.clone();

        if let Err(e) = ctrlc::set_handler(move || {
            let count = c.fetch_add(1, Ordering::SeqCst) + 1;
            if count == 1 {
                info!("\n\n🛑 Ctrl+C detected! Finishing current step and saving...");
                info!("   (Press Ctrl+C again to force quit WITHOUT saving)");
                r.store(false, Ordering::SeqCst);
            } else {
                error!("\n⚠️  Force quit! Exiting immediately without saving.");
                std::process::exit(1);
            }
        }) {
            warn!("Failed to install Ctrl-C handler: {}", e);
        }

        info!(
            "Starting SFT Loop (Target: {} steps, {} examples, batch {} x accum {})",
            total_steps,
            self.conversations.len(),
            batch_size,
            accum
        );

        let mut rng = StdRng::seed_from_u64(self.args.seed);
        let mut queue: VecDeque<Vec<usize>> = VecDeque::new();
        let mut best_loss = f32::MAX;
        let mut last_loss = f32::NAN;
        let mut checkpoint_history: Vec<std::path::PathBuf> = Vec::new();
        let mut tokens_seen = 0usize;
        let start_time = std::time::Instant::now();

        for step in start_step..total_steps {
            let current_lr = if step < self.args.warmup_steps {
                self.args.lr * (step as f64 / self.args.warmup_steps as f64)
            } else {
                let progress = (step - self.args.warmup_steps) as f64
                    / (total_steps.saturating_sub(self.args.warmup_steps)) as f64;
                let progress = progress.clamp(0.0, 1.0);
                let cosine = (progress * std::f64::consts::PI).cos();
                let decay = 0.5 * (1.0 + cosine);
                self.args.min_lr + (self.args.lr - self.args.min_lr) * decay
            };
            optimizer.set_learning_rate(current_lr);

            let mut accumulated: Option<Tensor> = None;
            let mut micro_batches = 0usize;

            for _ in 0..accum {
                if queue.is_empty() {
                    refill_queue(&mut queue, self.conversations.len(), batch_size, &mut rng);
                }
                let indices = queue.pop_front().expect("refilled queue");
                let batch_convs: Vec<Conversation> =
                    indices.iter().map(|&i| self.conversations[i].clone()).collect();

                let batch = self.collator.collate(&batch_convs, &self.device)?;
                let (b, l) = batch.inputs.dims2()?;
                tokens_seen += b * l;

                let mask_sum = batch.mask.sum_all()?.to_scalar::<f32>()?;
                if mask_sum == 0.0 {
                    warn!("Batch with no trainable tokens; skipping");
                    continue;
                }

                let logits = self.model.forward(&batch.inputs, 0, &mut self.cache)?;
                let loss = masked_cross_entropy(&logits, &batch.targets, &batch.mask, mask_sum)?;

                accumulated = Some(match accumulated {
                    Some(acc) => (acc + loss)?,
                    None => loss,
                });
                micro_batches += 1;
            }

            let Some(total_loss) = accumulated else {
                warn!("Step {}: no trainable batch; skipping optimizer step", step);
                continue;
            };
            let step_loss = (total_loss / micro_batches as f64)?;
            let loss_value = step_loss.to_scalar::<f32>()?;
            last_loss = loss_value;

            optimizer.backward_step(&step_loss)?;

            if step % self.args.log_interval == 0 {
                let elapsed = start_time.elapsed().as_secs_f64();
                let tok_s = if elapsed > 0.0 {
                    tokens_seen as f64 / elapsed
                } else {
                    0.0
                };
                info!(
                    "Step {:4} | Loss: {:.4} | LR: {:.7} | {:.2} tok/s",
                    step, loss_value, current_lr, tok_s
                );

                // Checkpoint Logic: Best Model
                if step > 0 && loss_value < best_loss {
                    best_loss = loss_value;
                    info!("🌟 New Best Loss: {:.4}", best_loss);
                    save_securely(
                        &self.varmap,
                        &self.args.output_dir.join("model-best.safetensors"),
                    )?;
                }
            }

            if step % self.args.save_interval == 0 && step > 0 {
                let name = format!("checkpoint_step_{}", step);
                let ckpt_path = self.args.output_dir.join(format!("{}.safetensors", name));

                save_securely(&self.varmap, &ckpt_path)?;
                save_securely(
                    &self.varmap,
                    &self.args.output_dir.join("model-latest.safetensors"),
                )?;
                save_training_state(&self.args.output_dir, &name, step, loss_value)?;

                // Rotate
                checkpoint_history.push(ckpt_path);
                if checkpoint_history.len() > self.args.save_total_limit {
                    let old = checkpoint_history.remove(0);
                    if old.exists() {
                        let _ = std::fs::remove_file(&old);
                    }
                }
            }

            if !running.load(Ordering::SeqCst) {
                info!("[Shutdown] Saving checkpoint at step {}...", step);
                save_securely(
                    &self.varmap,
                    &self.args.output_dir.join("model-latest.safetensors"),
                )?;
                save_training_state(&self.args.output_dir, "model-latest", step, loss_value)?;
                info!("Exiting gracefully.");
                return Ok(());
            }
        }

        info!("Training complete ({} steps).", total_steps);
        save_training_state(&self.args.output_dir, "final", total_steps, last_loss)?;
        Ok(())
    }

    /// Write the final checkpoint directory: weights, model config, tokenizer.
    pub fn save_model(&self, output_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(output_dir)?;

        save_securely(&self.varmap, &output_dir.join("model.safetensors"))?;

        let config_file = File::create(output_dir.join("config.json"))?;
        serde_json::to_writer_pretty(config_file, &self.config)?;

        self.tokenizer
            .save(&output_dir.join("tokenizer.json"), false)
            .map_err(|e| anyhow::anyhow!("Failed to save tokenizer: {}", e))?;

        info!("✅ Model saved to {:?}", output_dir);
        Ok(())
    }
}

fn refill_queue(
    queue: &mut VecDeque<Vec<usize>>,
    n_examples: usize,
    batch_size: usize,
    rng: &mut StdRng,
) {
    let mut indices: Vec<usize> = (0..n_examples).collect();
    indices.shuffle(rng);
    for chunk in indices.chunks(batch_size) {
        queue.push_back(chunk.to_vec());
    }
}

/// Cross-entropy over the unmasked positions only.
///
/// Element-wise loss (log-softmax + gather), multiplied by the mask and
/// normalized by the unmasked token count, kept as a tensor for backprop.
fn masked_cross_entropy(
    logits: &Tensor,
    targets: &Tensor,
    mask: &Tensor,
    mask_sum: f32,
) -> Result<Tensor> {
    let (b, l, v) = logits.dims3()?;
    let logits_flat = logits.reshape((b * l, v))?;
    let targets_flat = targets.reshape(b * l)?;

    let log_sm = ops::log_softmax(&logits_flat, D::Minus1)?;
    let token_loss = log_sm
        .gather(&targets_flat.unsqueeze(1)?, D::Minus1)?
        .squeeze(D::Minus1)?
        .neg()?;

    let mask_flat = mask.reshape(b * l)?;
    let masked = (token_loss * mask_flat)?;
    Ok((masked.sum_all()? / f64::from(mask_sum))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_loss_ignores_masked_positions() -> Result<()> {
        let device = Device::Cpu;
        // Two positions, vocab of 2. Position 0 predicts its target
        // perfectly, position 1 is maximally wrong but masked out.
        let logits = Tensor::from_vec(
            vec![10.0f32, -10.0, 10.0, -10.0],
            (1, 2, 2),
            &device,
        )?;
        let targets = Tensor::from_vec(vec![0u32, 1], (1, 2), &device)?;
        let mask = Tensor::from_vec(vec![1f32, 0.0], (1, 2), &device)?;

        let loss = masked_cross_entropy(&logits, &targets, &mask, 1.0)?;
        let value = loss.to_scalar::<f32>()?;
        assert!(value < 1e-3, "masked position leaked into the loss: {}", value);
        Ok(())
    }

    #[test]
    fn queue_refill_covers_every_example() {
        let mut queue = VecDeque::new();
        let mut rng = StdRng::seed_from_u64(7);
        refill_queue(&mut queue, 10, 3, &mut rng);

        let mut seen: Vec<usize> = queue.iter().flatten().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert_eq!(queue.len(), 4); // 3+3+3+1
    }
}
