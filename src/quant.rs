//! Quantized-loading configuration (k-bit base weights)

use anyhow::Result;
use candle_core::{DType, Device};

use crate::train::args::ModelArgs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantBits {
    Four,
    Eight,
}

/// Resolved k-bit loading settings for the frozen base model.
///
/// Backprop needs dense dtypes, so the base is held in `compute_dtype`;
/// bit-packing of stored weights is the quantization backend's concern.
#[derive(Debug, Clone, Copy)]
pub struct QuantizationConfig {
    pub bits: QuantBits,
    pub compute_dtype: DType,
}

/// Resolve the quantization config from the model arguments.
///
/// k-bit loading freezes the base model, so it is only valid together with
/// `--use-peft`.
pub fn get_quantization_config(args: &ModelArgs) -> Result<Option<QuantizationConfig>> {
    let bits = if args.load_in_4bit {
        QuantBits::Four
    } else if args.load_in_8bit {
        QuantBits::Eight
    } else {
        return Ok(None);
    };

    if !args.use_peft {
        anyhow::bail!(
            "k-bit loading ({:?}) requires --use-peft; the quantized base is frozen",
            bits
        );
    }

    Ok(Some(QuantizationConfig {
        bits,
        compute_dtype: DType::BF16,
    }))
}

/// Device the whole quantized model is placed on.
///
/// Only resolved when a quantization config exists; non-quantized runs pick
/// their device through the default probe in the model loader.
pub fn kbit_device_map() -> Device {
    Device::cuda_if_available(0).unwrap_or(Device::Cpu)
}
