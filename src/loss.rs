//! Pairwise ranking loss for reward models
//!
//! ```text
//! L = -log(sigmoid(r_chosen - r_rejected - margin))
//! ```

use candle_core::{DType, Result, Tensor};

/// `log(1 + exp(x))` computed as `relu(x) + log(1 + exp(-|x|))`.
pub fn softplus(xs: &Tensor) -> Result<Tensor> {
    let tail = (xs.abs()?.neg()?.exp()? + 1.0)?.log()?;
    xs.relu()? + tail
}

/// Mean pairwise loss over the batch
pub fn pairwise_loss(
    chosen_rewards: &Tensor,
    rejected_rewards: &Tensor,
    margin: Option<&Tensor>,
) -> Result<Tensor> {
    let mut logits = (chosen_rewards - rejected_rewards)?;
    if let Some(margin) = margin {
        logits = (logits - margin.to_dtype(chosen_rewards.dtype())?)?;
    }
    softplus(&logits.neg()?)?.mean_all()
}

/// Fraction of pairs ranked correctly
///
/// A tie counts as correct, as an argmax over `[chosen, rejected]` picks the
/// first entry.
pub fn pairwise_accuracy(chosen_rewards: &Tensor, rejected_rewards: &Tensor) -> Result<f32> {
    chosen_rewards
        .ge(rejected_rewards)?
        .to_dtype(DType::F32)?
        .mean_all()?
        .to_scalar::<f32>()
}
