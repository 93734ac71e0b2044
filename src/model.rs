//! Model/tokenizer setup: init-kwargs resolution, checkpoint + config loading
//!
//! The architecture itself is external (`candle-transformers` llama family);
//! this module resolves loading options and materializes the model over a
//! `VarMap` so the trainer can own the variables.

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use candle_transformers::models::llama2_c::{Cache, Config as LlamaConfig, Llama};
use hf_hub::{api::sync::Api, Repo, RepoType};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokenizers::{FromPretrainedParameters, Tokenizer};
use tracing::{info, warn};

use crate::quant::{self, QuantizationConfig};
use crate::train::args::{AttnArg, DtypeArg, ModelArgs, TrainingArgs};

/// Model configuration, deserializable from a HF-style `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(alias = "hidden_size")]
    pub dim: usize,
    #[serde(alias = "intermediate_size")]
    pub hidden_dim: usize,
    #[serde(alias = "num_hidden_layers")]
    pub n_layers: usize,
    #[serde(alias = "num_attention_heads")]
    pub n_heads: usize,
    #[serde(alias = "num_key_value_heads", default)]
    pub n_kv_heads: Option<usize>,
    pub vocab_size: usize,
    #[serde(alias = "max_position_embeddings")]
    pub seq_len: usize,
    #[serde(alias = "rms_norm_eps", default = "default_norm_eps")]
    pub norm_eps: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
}

fn default_norm_eps() -> f64 {
    1e-5
}

impl ModelConfig {
    pub fn kv_heads(&self) -> usize {
        self.n_kv_heads.unwrap_or(self.n_heads)
    }

    pub fn to_llama_config(&self) -> LlamaConfig {
        LlamaConfig {
            dim: self.dim,
            hidden_dim: self.hidden_dim,
            n_layers: self.n_layers,
            n_heads: self.n_heads,
            n_kv_heads: self.kv_heads(),
            vocab_size: self.vocab_size,
            seq_len: self.seq_len,
            norm_eps: self.norm_eps,
        }
    }

    /// Reject configs for architectures this family cannot represent unless
    /// the user opted in.
    pub fn check_architecture(&self, trust_remote_code: bool) -> Result<()> {
        match self.model_type.as_deref() {
            None | Some("llama") => Ok(()),
            Some(other) if trust_remote_code => {
                warn!(
                    "⚠️ Unrecognized model_type '{}'; loading it as a llama-family model (--trust-remote-code)",
                    other
                );
                Ok(())
            }
            Some(other) => anyhow::bail!(
                "Unrecognized model_type '{}'; pass --trust-remote-code to load it as a llama-family model",
                other
            ),
        }
    }
}

/// Keyword set controlling how the base model is materialized.
#[derive(Debug, Clone)]
pub struct ModelInitKwargs {
    pub revision: String,
    pub trust_remote_code: bool,
    pub attn_implementation: AttnArg,
    pub dtype: DType,
    pub use_cache: bool,
    pub device: Device,
    pub quantization: Option<QuantizationConfig>,
}

impl ModelInitKwargs {
    /// Resolve loading options from the argument groups.
    ///
    /// The device map is only derived from the k-bit path when quantization
    /// is requested; otherwise the default accelerator probe decides.
    pub fn resolve(model_args: &ModelArgs, training_args: &TrainingArgs) -> Result<Self> {
        let quantization = quant::get_quantization_config(model_args)?;

        let device = match &quantization {
            Some(q) => {
                let device = quant::kbit_device_map();
                info!("k-bit loading ({:?}): placing the model on {:?}", q.bits, device);
                device
            }
            None => Device::cuda_if_available(0).unwrap_or(Device::Cpu),
        };

        let dtype = match model_args.dtype {
            DtypeArg::F32 => DType::F32,
            DtypeArg::F16 => DType::F16,
            DtypeArg::Bf16 => DType::BF16,
            DtypeArg::Auto => quantization
                .as_ref()
                .map(|q| q.compute_dtype)
                .unwrap_or(DType::F32),
        };

        match model_args.attn_implementation {
            AttnArg::Eager => {}
            AttnArg::FlashAttn => anyhow::bail!(
                "flash-attn is not available for this model family; use --attn-implementation eager"
            ),
        }

        if training_args.gradient_checkpointing {
            warn!(
                "⚠️ Activation recomputation is not available on this backend; \
                 --gradient-checkpointing only disables the kv-cache"
            );
        }

        Ok(Self {
            revision: model_args.revision.clone(),
            trust_remote_code: model_args.trust_remote_code,
            attn_implementation: model_args.attn_implementation,
            dtype,
            use_cache: !training_args.gradient_checkpointing,
            device,
            quantization,
        })
    }
}

/// A model materialized over a `VarMap`, ready for optimization.
pub struct LoadedModel {
    pub model: Llama,
    pub cache: Cache,
    pub varmap: VarMap,
    pub config: ModelConfig,
}

/// Load the tokenizer by hub name (pinned revision) or from a local
/// checkpoint directory.
pub fn load_tokenizer(args: &ModelArgs) -> Result<Tokenizer> {
    let dir = Path::new(&args.model);
    if dir.is_dir() {
        let path = dir.join("tokenizer.json");
        info!("Loading tokenizer from: {:?}", path);
        Tokenizer::from_file(&path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer {:?}: {}", path, e))
    } else {
        info!("Fetching tokenizer '{}' (revision {})", args.model, args.revision);
        let params = FromPretrainedParameters {
            revision: args.revision.clone(),
            ..Default::default()
        };
        Tokenizer::from_pretrained(&args.model, Some(params))
            .map_err(|e| anyhow::anyhow!("Failed to fetch tokenizer '{}': {}", args.model, e))
    }
}

/// Build the model and load its base weights.
///
/// A local directory without `model.safetensors` starts from a fresh
/// initialization; a hub repo must provide both files.
pub fn load_model(name_or_path: &str, kwargs: &ModelInitKwargs) -> Result<LoadedModel> {
    let (config_path, weights_path) = resolve_checkpoint_files(name_or_path, &kwargs.revision)?;

    let raw = std::fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read model config: {:?}", config_path))?;
    let config: ModelConfig = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse model config: {:?}", config_path))?;
    config.check_architecture(kwargs.trust_remote_code)?;

    info!(
        "Model config: dim={} hidden={} layers={} heads={} kv_heads={} vocab={} seq_len={}",
        config.dim,
        config.hidden_dim,
        config.n_layers,
        config.n_heads,
        config.kv_heads(),
        config.vocab_size,
        config.seq_len
    );
    info!(
        "Init kwargs: dtype={:?} device={:?} attn={:?} use_cache={} quantized={}",
        kwargs.dtype,
        kwargs.device,
        kwargs.attn_implementation,
        kwargs.use_cache,
        kwargs.quantization.is_some()
    );

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, kwargs.dtype, &kwargs.device);
    let llama_config = config.to_llama_config();

    // The kv-cache stays off while optimizing; incremental decode state must
    // not leak across steps.
    let cache = Cache::new(false, &llama_config, vb.pp("rot"))?;
    let model = Llama::load(vb, llama_config)?;

    match &weights_path {
        Some(path) => {
            varmap
                .load(path)
                .with_context(|| format!("Failed to load base weights from {:?}", path))?;
            info!("✅ Base weights loaded from {:?}", path);
        }
        None => info!("No model.safetensors found. Starting from fresh initialization."),
    }

    Ok(LoadedModel {
        model,
        cache,
        varmap,
        config,
    })
}

fn resolve_checkpoint_files(
    name_or_path: &str,
    revision: &str,
) -> Result<(PathBuf, Option<PathBuf>)> {
    let dir = Path::new(name_or_path);
    if dir.is_dir() {
        let config = dir.join("config.json");
        if !config.exists() {
            anyhow::bail!("No config.json in model directory {:?}", dir);
        }
        let weights = dir.join("model.safetensors");
        let weights = weights.exists().then_some(weights);
        return Ok((config, weights));
    }

    info!("Fetching model '{}' (revision {})", name_or_path, revision);
    let api = Api::new().context("Failed to initialize hub client")?;
    let repo = api.repo(Repo::with_revision(
        name_or_path.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));
    let config = repo
        .get("config.json")
        .with_context(|| format!("Failed to fetch config.json for '{}'", name_or_path))?;
    let weights = repo
        .get("model.safetensors")
        .with_context(|| format!("Failed to fetch model.safetensors for '{}'", name_or_path))?;
    Ok((config, Some(weights)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hf_style_config() -> Result<()> {
        let raw = r#"{
            "model_type": "llama",
            "hidden_size": 64,
            "intermediate_size": 128,
            "num_hidden_layers": 2,
            "num_attention_heads": 4,
            "num_key_value_heads": 2,
            "vocab_size": 1000,
            "max_position_embeddings": 256,
            "rms_norm_eps": 1e-6,
            "torch_dtype": "bfloat16"
        }"#;
        let config: ModelConfig = serde_json::from_str(raw)?;
        assert_eq!(config.dim, 64);
        assert_eq!(config.kv_heads(), 2);
        let llama = config.to_llama_config();
        assert_eq!(llama.n_layers, 2);
        assert_eq!(llama.seq_len, 256);
        Ok(())
    }

    #[test]
    fn kv_heads_default_to_query_heads() -> Result<()> {
        let raw = r#"{
            "dim": 32, "hidden_dim": 64, "n_layers": 1, "n_heads": 4,
            "vocab_size": 100, "seq_len": 64
        }"#;
        let config: ModelConfig = serde_json::from_str(raw)?;
        assert_eq!(config.kv_heads(), 4);
        assert_eq!(config.norm_eps, 1e-5);
        Ok(())
    }

    #[test]
    fn unknown_architecture_needs_trust() -> Result<()> {
        let raw = r#"{
            "model_type": "gpt_bigcode",
            "dim": 32, "hidden_dim": 64, "n_layers": 1, "n_heads": 4,
            "vocab_size": 100, "seq_len": 64
        }"#;
        let config: ModelConfig = serde_json::from_str(raw)?;
        assert!(config.check_architecture(false).is_err());
        assert!(config.check_architecture(true).is_ok());
        Ok(())
    }
}
