//! sftune - completion-only supervised fine-tuning for causal LMs on candle.
//!
//! The pipeline is linear: parse the three argument groups, resolve model
//! init options, load tokenizer + dataset, build the completion-only
//! collator, run the optimization loop, save the checkpoint directory and
//! optionally push it to the hub.

pub mod cli;
pub mod collator;
pub mod dataset;
pub mod model;
pub mod peft;
pub mod preview;
pub mod push;
pub mod quant;
pub mod train;
