//! Sequence scorers that map a tokenized sequence to a scalar reward

use crate::error::Result;
use candle_core::{DType, Device, Module, ModuleT, Tensor, D};
use candle_nn::{embedding, linear_b, Dropout, Embedding, Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::fs::read_to_string;
use std::path::Path;

pub const WEIGHTS_NAME: &str = "model.safetensors";
pub const CONFIG_NAME: &str = "config.json";

/// A model producing one reward per sequence
///
/// `input_ids` and `attention_mask` are `(batch, seq_len)`; the returned
/// tensor has shape `(batch,)`.
pub trait RewardModel {
    fn score(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        train: bool,
    ) -> candle_core::Result<Tensor>;
}

/// Config for a `PooledRewardModel`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardModelConfig {
    pub vocab_size: usize,
    pub context_length: usize,
    pub emb_dim: usize,
    pub hidden_dim: usize,
    pub drop_rate: f32,
}

impl RewardModelConfig {
    /// A small scorer sized for a tokenizer with `vocab_size` entries
    pub fn small(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            context_length: 1_024,
            emb_dim: 256,
            hidden_dim: 256,
            drop_rate: 0.1,
        }
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(serde_json::from_str(&read_to_string(path)?)?)
    }

    #[cfg(test)]
    pub(crate) fn test() -> Self {
        Self {
            vocab_size: 16,
            context_length: 8,
            emb_dim: 4,
            hidden_dim: 4,
            drop_rate: 0.0,
        }
    }
}

/// Token and position embeddings, a `tanh` layer, masked mean pooling and a
/// single-label head
pub struct PooledRewardModel {
    cfg: RewardModelConfig,
    tok_emb: Embedding,
    pos_emb: Embedding,
    hidden: Linear,
    drop: Dropout,
    score_head: Linear,
}

impl PooledRewardModel {
    pub fn new(cfg: RewardModelConfig, vb: VarBuilder<'_>) -> candle_core::Result<Self> {
        let tok_emb = embedding(cfg.vocab_size, cfg.emb_dim, vb.pp("tok_emb"))?;
        let pos_emb = embedding(cfg.context_length, cfg.emb_dim, vb.pp("pos_emb"))?;
        let hidden = linear_b(cfg.emb_dim, cfg.hidden_dim, true, vb.pp("hidden"))?;
        let score_head = linear_b(cfg.hidden_dim, 1_usize, true, vb.pp("score"))?;
        Ok(Self {
            cfg,
            tok_emb,
            pos_emb,
            hidden,
            drop: Dropout::new(cfg.drop_rate),
            score_head,
        })
    }

    /// Builds the model on `device` and overwrites its weights from a
    /// safetensors checkpoint written by `RewardTrainer::save_model`.
    pub fn load<P: AsRef<Path>>(
        cfg: RewardModelConfig,
        checkpoint: P,
        device: &Device,
    ) -> Result<(Self, VarMap)> {
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Self::new(cfg, vb.pp("model"))?;
        varmap.load(checkpoint)?;
        Ok((model, varmap))
    }

    /// Loads a model directory written by `RewardTrainer::save_model`
    /// (`config.json` and `model.safetensors`).
    pub fn from_pretrained<P: AsRef<Path>>(dir: P, device: &Device) -> Result<(Self, VarMap)> {
        let dir = dir.as_ref();
        let cfg = RewardModelConfig::from_json_file(dir.join(CONFIG_NAME))?;
        tracing::info!(path = %dir.display(), ?cfg, "loading pretrained reward model");
        Self::load(cfg, dir.join(WEIGHTS_NAME), device)
    }

    pub fn cfg(&self) -> &RewardModelConfig {
        &self.cfg
    }
}

impl RewardModel for PooledRewardModel {
    fn score(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        train: bool,
    ) -> candle_core::Result<Tensor> {
        let (_batch_size, seq_len) = input_ids.dims2()?;
        if seq_len > self.cfg.context_length {
            candle_core::bail!(
                "sequence length {seq_len} exceeds context length {}",
                self.cfg.context_length
            )
        }
        let tok_embeds = self.tok_emb.forward(input_ids)?;
        let pos_ids = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let pos_embeds = self.pos_emb.forward(&pos_ids)?;
        let xs = tok_embeds.broadcast_add(&pos_embeds)?;
        let xs = self.hidden.forward(&xs)?.tanh()?;
        let xs = self.drop.forward_t(&xs, train)?;

        // mean over real tokens only
        let mask = attention_mask.to_dtype(xs.dtype())?.unsqueeze(D::Minus1)?;
        let summed = xs.broadcast_mul(&mask)?.sum(1)?;
        let counts = mask.sum(1)?.maximum(1f32)?;
        let pooled = summed.broadcast_div(&counts)?;

        self.score_head.forward(&pooled)?.squeeze(D::Minus1)
    }
}
