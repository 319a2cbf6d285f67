//! Configuration for tokenizer setup and reward model training
//!
//! All settings are plain values constructed once and passed by reference to
//! the components that need them.

use crate::chat::ChatTemplate;
use crate::error::{RewardError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{read_to_string, File};
use std::path::Path;

pub const DEFAULT_BASE_MODEL: &str = "EleutherAI/pythia-1b-deduped";
pub const DEFAULT_DATASET: &str = "trl-internal-testing/descriptiveness-sentiment-trl-style";
pub const DEFAULT_SPLIT: &str = "descriptiveness";
pub const DEFAULT_PAD_TOKEN: &str = "[PAD]";
pub const DEFAULT_OUTPUT_DIR: &str = "minimal/reward";
pub const DATA_DIR: &str = "data";

/// Special tokens and chat template applied when building a tokenizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenizerSetup {
    /// Padding token registered with the tokenizer if it is missing.
    pub pad_token: String,
    /// End-of-sequence token appended by the chat template; must exist in the vocab.
    pub eos_token: String,
    pub chat_template: ChatTemplate,
}

impl Default for TokenizerSetup {
    fn default() -> Self {
        Self {
            pad_token: DEFAULT_PAD_TOKEN.to_string(),
            eos_token: "<|endoftext|>".to_string(),
            chat_template: ChatTemplate::default(),
        }
    }
}

/// When to run evaluation during training
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationStrategy {
    No,
    Steps,
    #[default]
    Epoch,
}

/// Training arguments for `RewardTrainer`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    pub per_device_train_batch_size: usize,
    pub per_device_eval_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub max_grad_norm: Option<f64>,
    pub warmup_steps: usize,
    pub logging_steps: usize,
    pub evaluation_strategy: EvaluationStrategy,
    /// Only used with `EvaluationStrategy::Steps`.
    pub eval_steps: usize,
    pub num_train_epochs: usize,
    pub output_dir: String,
    /// Pairs where either side tokenizes to more than this are dropped.
    pub max_length: Option<usize>,
    pub seed: u64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            per_device_train_batch_size: 16,
            per_device_eval_batch_size: 8,
            gradient_accumulation_steps: 4,
            learning_rate: 5e-5,
            weight_decay: 0.0,
            max_grad_norm: Some(1.0),
            warmup_steps: 0,
            logging_steps: 1,
            evaluation_strategy: EvaluationStrategy::Epoch,
            eval_steps: 500,
            num_train_epochs: 1,
            output_dir: DEFAULT_OUTPUT_DIR.to_string(),
            max_length: Some(512),
            seed: 42,
        }
    }
}

impl RewardConfig {
    /// Load a config from a JSON file; missing keys take their default value.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json_str = read_to_string(path.as_ref())?;
        let cfg: Self = serde_json::from_str(&json_str)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// Checks for values the trainer cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.per_device_train_batch_size == 0 || self.per_device_eval_batch_size == 0 {
            return Err(RewardError::Config(
                "batch sizes must be greater than zero".to_string(),
            ));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(RewardError::Config(
                "gradient_accumulation_steps must be greater than zero".to_string(),
            ));
        }
        if self.logging_steps == 0 {
            return Err(RewardError::Config(
                "logging_steps must be greater than zero".to_string(),
            ));
        }
        if self.evaluation_strategy == EvaluationStrategy::Steps && self.eval_steps == 0 {
            return Err(RewardError::Config(
                "eval_steps must be greater than zero with the `steps` strategy".to_string(),
            ));
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            return Err(RewardError::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if let Some(norm) = self.max_grad_norm {
            if norm <= 0.0 {
                return Err(RewardError::Config(format!(
                    "max_grad_norm must be positive, got {norm}"
                )));
            }
        }
        Ok(())
    }

    /// Number of examples consumed per optimizer step.
    pub fn effective_batch_size(&self) -> usize {
        self.per_device_train_batch_size * self.gradient_accumulation_steps
    }
}

/// Where the data and tokenizer come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptArguments {
    pub base_model: String,
    pub dataset_name: String,
    pub dataset_config: String,
    pub dataset_split: String,
    /// Number of trailing rows held out for evaluation.
    pub eval_samples: usize,
}

impl Default for ScriptArguments {
    fn default() -> Self {
        Self {
            base_model: DEFAULT_BASE_MODEL.to_string(),
            dataset_name: DEFAULT_DATASET.to_string(),
            dataset_config: "default".to_string(),
            dataset_split: DEFAULT_SPLIT.to_string(),
            eval_samples: 20,
        }
    }
}
