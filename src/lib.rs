//! # reward-modeling-rs
//!
//! Fine-tune a sequence scorer as a reward model on chosen/rejected
//! preference pairs with [candle](https://github.com/huggingface/candle).
//!
//! The pipeline mirrors a minimal reward modeling script:
//!
//! 1. build a tokenizer from a [`config::TokenizerSetup`]
//! 2. load preference rows and tokenize them with [`data::process`]
//! 3. collate pairs with [`collator::ZeroPadRewardCollator`]
//! 4. train, save and evaluate with [`trainer::RewardTrainer`]

pub mod chat;
pub mod collator;
pub mod config;
pub mod data;
pub mod error;
pub mod loader;
pub mod loss;
pub mod model;
pub mod tldr;
pub mod tokenizer;
pub mod trainer;

pub use error::{RewardError, Result};
