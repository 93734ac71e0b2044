//! Parameter-efficient fine-tuning: trainable-set restriction
//!
//! The model architecture is external, so adapters are not injected into its
//! forward pass. PEFT here freezes the base and trains only the variables
//! whose path matches a target-module pattern.

use candle_core::Var;
use candle_nn::VarMap;
use tracing::info;

use crate::train::args::ModelArgs;

#[derive(Debug, Clone)]
pub struct PeftConfig {
    pub target_modules: Vec<String>,
}

/// Resolve the PEFT config from the model arguments, `None` when full
/// fine-tuning is requested.
pub fn get_peft_config(args: &ModelArgs) -> Option<PeftConfig> {
    if !args.use_peft {
        return None;
    }
    Some(PeftConfig {
        target_modules: args.lora_target_modules.clone(),
    })
}

/// Collect the variables the optimizer is allowed to update.
///
/// Without a PEFT config this is every variable in the map. Order is sorted
/// by name; the optimizer state must line up across resumes.
pub fn trainable_vars(varmap: &VarMap, peft: Option<&PeftConfig>) -> anyhow::Result<Vec<Var>> {
    let data = varmap.data().lock().expect("Failed to lock VarMap");

    let mut named: Vec<(&String, &Var)> = data
        .iter()
        .filter(|(name, _)| match peft {
            Some(cfg) => matches_target(name.as_str(), &cfg.target_modules),
            None => true,
        })
        .collect();
    named.sort_by(|a, b| a.0.cmp(b.0));

    let selected: Vec<Var> = named.iter().map(|(_, v)| (*v).clone()).collect();

    let total: usize = data.values().map(|v| v.as_tensor().elem_count()).sum();
    let trainable: usize = selected.iter().map(|v| v.as_tensor().elem_count()).sum();

    if selected.is_empty() {
        anyhow::bail!(
            "No trainable parameters matched target modules {:?}",
            peft.map(|c| c.target_modules.clone()).unwrap_or_default()
        );
    }

    info!(
        "Trainable params: {} / {} ({:.2}%)",
        format_parameter_count(trainable),
        format_parameter_count(total),
        100.0 * trainable as f64 / total.max(1) as f64
    );

    Ok(selected)
}

fn matches_target(name: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| name.contains(p.as_str()))
}

/// Human-readable parameter count ("6.7M", "1.2B").
pub fn format_parameter_count(count: usize) -> String {
    let count = count as f64;
    if count >= 1e9 {
        format!("{:.1}B", count / 1e9)
    } else if count >= 1e6 {
        format!("{:.1}M", count / 1e6)
    } else if count >= 1e3 {
        format!("{:.1}K", count / 1e3)
    } else {
        format!("{}", count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::Init;

    #[test]
    fn filters_by_module_pattern() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let dev = Device::Cpu;
        varmap.get(
            (4, 4),
            "model.layers.0.self_attn.q_proj.weight",
            Init::Const(0.),
            DType::F32,
            &dev,
        )?;
        varmap.get(
            (4, 4),
            "model.layers.0.self_attn.k_proj.weight",
            Init::Const(0.),
            DType::F32,
            &dev,
        )?;
        varmap.get(
            (4, 4),
            "model.layers.0.mlp.gate_proj.weight",
            Init::Const(0.),
            DType::F32,
            &dev,
        )?;

        let cfg = PeftConfig {
            target_modules: vec!["q_proj".to_string(), "v_proj".to_string()],
        };
        let vars = trainable_vars(&varmap, Some(&cfg))?;
        assert_eq!(vars.len(), 1);

        let all = trainable_vars(&varmap, None)?;
        assert_eq!(all.len(), 3);
        Ok(())
    }

    #[test]
    fn no_match_is_an_error() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        varmap.get(
            (2, 2),
            "model.embed_tokens.weight",
            Init::Const(0.),
            DType::F32,
            &Device::Cpu,
        )?;
        let cfg = PeftConfig {
            target_modules: vec!["q_proj".to_string()],
        };
        assert!(trainable_vars(&varmap, Some(&cfg)).is_err());
        Ok(())
    }

    #[test]
    fn parameter_count_formatting() {
        assert_eq!(format_parameter_count(950), "950");
        assert_eq!(format_parameter_count(6_700_000), "6.7M");
        assert_eq!(format_parameter_count(1_200_000_000), "1.2B");
    }
}
