//! Collation of chosen/rejected pairs into padded batch tensors
//!
//! Collation runs in two steps. [`RewardDataCollatorWithPadding`] pads every
//! field to the longest sequence of that field in the batch using the
//! tokenizer's pad id. [`ZeroPadRewardCollator`] wraps any base collator and
//! then rewrites every padded id position to `0`, so the value found at
//! padding positions no longer depends on the tokenizer vocabulary. The
//! attention mask stays the only signal of which positions hold content.

use crate::data::{
    RewardExample, ATTENTION_MASK_CHOSEN, ATTENTION_MASK_REJECTED, INPUT_IDS_CHOSEN,
    INPUT_IDS_REJECTED,
};
use crate::error::{RewardError, Result};
use candle_core::{Device, Tensor};

/// Value written at padded id positions by [`mask_padding_ids`].
pub const MASKED_ID: u32 = 0;

/// A collated batch of preference pairs
///
/// Id and mask tensors are `u32` with shape `(batch, padded_len)`. Chosen and
/// rejected fields are padded independently, so their lengths may differ.
#[derive(Debug, Clone)]
pub struct RewardBatch {
    pub input_ids_chosen: Tensor,
    pub attention_mask_chosen: Tensor,
    pub input_ids_rejected: Tensor,
    pub attention_mask_rejected: Tensor,
    /// `f32` tensor of shape `(batch,)`, present when the examples carry margins.
    pub margin: Option<Tensor>,
}

impl RewardBatch {
    /// Looks up a field by its name.
    pub fn field(&self, name: &str) -> Result<&Tensor> {
        match name {
            INPUT_IDS_CHOSEN => Ok(&self.input_ids_chosen),
            ATTENTION_MASK_CHOSEN => Ok(&self.attention_mask_chosen),
            INPUT_IDS_REJECTED => Ok(&self.input_ids_rejected),
            ATTENTION_MASK_REJECTED => Ok(&self.attention_mask_rejected),
            "margin" => self
                .margin
                .as_ref()
                .ok_or_else(|| RewardError::MissingField(name.to_string())),
            _ => Err(RewardError::MissingField(name.to_string())),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.input_ids_chosen.dims().first().copied().unwrap_or(0)
    }
}

/// Turns a list of examples into a batch
pub trait Collator {
    fn collate(&self, examples: &[RewardExample]) -> Result<RewardBatch>;

    /// Collates loosely typed records, failing on the first one that lacks a
    /// token field.
    fn collate_records(&self, records: &[serde_json::Value]) -> Result<RewardBatch> {
        let examples = records
            .iter()
            .map(RewardExample::from_record)
            .collect::<Result<Vec<_>>>()?;
        self.collate(&examples)
    }
}

/// Pads every field of the batch to its longest sequence with the pad token id
#[derive(Debug, Clone)]
pub struct RewardDataCollatorWithPadding {
    pad_token_id: u32,
    pad_to_multiple_of: Option<usize>,
    device: Device,
}

impl RewardDataCollatorWithPadding {
    pub fn new(pad_token_id: u32) -> Self {
        Self {
            pad_token_id,
            pad_to_multiple_of: None,
            device: Device::Cpu,
        }
    }

    pub fn pad_to_multiple_of(mut self, multiple: Option<usize>) -> Self {
        self.pad_to_multiple_of = multiple.filter(|m| *m > 0);
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    fn padded_len(&self, max_len: usize) -> usize {
        match self.pad_to_multiple_of {
            Some(m) => max_len.div_ceil(m) * m,
            None => max_len,
        }
    }

    /// Right-pads `sequences` into a `(n, padded_len)` tensor.
    fn pad_field(&self, sequences: &[&[u32]], pad_value: u32) -> Result<Tensor> {
        let max_len = sequences.iter().map(|s| s.len()).max().unwrap_or(0);
        let padded_len = self.padded_len(max_len);
        let mut flat = Vec::with_capacity(sequences.len() * padded_len);
        for seq in sequences {
            flat.extend_from_slice(seq);
            flat.extend(std::iter::repeat(pad_value).take(padded_len - seq.len()));
        }
        Ok(Tensor::from_vec(
            flat,
            (sequences.len(), padded_len),
            &self.device,
        )?)
    }

    fn check_aligned(examples: &[RewardExample]) -> Result<()> {
        for (idx, ex) in examples.iter().enumerate() {
            if ex.input_ids_chosen.len() != ex.attention_mask_chosen.len() {
                return Err(RewardError::ShapeMismatch {
                    field: INPUT_IDS_CHOSEN.to_string(),
                    reason: format!(
                        "example {idx} has {} ids but {} mask entries",
                        ex.input_ids_chosen.len(),
                        ex.attention_mask_chosen.len()
                    ),
                });
            }
            if ex.input_ids_rejected.len() != ex.attention_mask_rejected.len() {
                return Err(RewardError::ShapeMismatch {
                    field: INPUT_IDS_REJECTED.to_string(),
                    reason: format!(
                        "example {idx} has {} ids but {} mask entries",
                        ex.input_ids_rejected.len(),
                        ex.attention_mask_rejected.len()
                    ),
                });
            }
        }
        Ok(())
    }

    fn collate_margin(&self, examples: &[RewardExample]) -> Result<Option<Tensor>> {
        let margins = examples.iter().map(|ex| ex.margin).collect::<Vec<_>>();
        if margins.iter().all(Option::is_none) {
            return Ok(None);
        }
        let margins = margins
            .into_iter()
            .collect::<Option<Vec<f32>>>()
            .ok_or_else(|| RewardError::ShapeMismatch {
                field: "margin".to_string(),
                reason: "only some examples in the batch carry a margin".to_string(),
            })?;
        Ok(Some(Tensor::new(margins.as_slice(), &self.device)?))
    }
}

impl Collator for RewardDataCollatorWithPadding {
    fn collate(&self, examples: &[RewardExample]) -> Result<RewardBatch> {
        Self::check_aligned(examples)?;

        let ids_chosen = examples
            .iter()
            .map(|ex| ex.input_ids_chosen.as_slice())
            .collect::<Vec<_>>();
        let mask_chosen = examples
            .iter()
            .map(|ex| ex.attention_mask_chosen.as_slice())
            .collect::<Vec<_>>();
        let ids_rejected = examples
            .iter()
            .map(|ex| ex.input_ids_rejected.as_slice())
            .collect::<Vec<_>>();
        let mask_rejected = examples
            .iter()
            .map(|ex| ex.attention_mask_rejected.as_slice())
            .collect::<Vec<_>>();

        Ok(RewardBatch {
            input_ids_chosen: self.pad_field(&ids_chosen, self.pad_token_id)?,
            attention_mask_chosen: self.pad_field(&mask_chosen, 0)?,
            input_ids_rejected: self.pad_field(&ids_rejected, self.pad_token_id)?,
            attention_mask_rejected: self.pad_field(&mask_rejected, 0)?,
            margin: self.collate_margin(examples)?,
        })
    }
}

fn zero_fill(ids: &Tensor, mask: &Tensor, field: &str) -> Result<Tensor> {
    if ids.dims() != mask.dims() {
        return Err(RewardError::ShapeMismatch {
            field: field.to_string(),
            reason: format!("ids {:?} vs mask {:?}", ids.dims(), mask.dims()),
        });
    }
    Ok(mask.where_cond(ids, &ids.zeros_like()?)?)
}

/// Writes [`MASKED_ID`] into every id position whose attention mask is 0
///
/// Masks and margins pass through untouched; applying this twice is the
/// same as applying it once.
pub fn mask_padding_ids(batch: RewardBatch) -> Result<RewardBatch> {
    let input_ids_chosen = zero_fill(
        &batch.input_ids_chosen,
        &batch.attention_mask_chosen,
        INPUT_IDS_CHOSEN,
    )?;
    let input_ids_rejected = zero_fill(
        &batch.input_ids_rejected,
        &batch.attention_mask_rejected,
        INPUT_IDS_REJECTED,
    )?;
    Ok(RewardBatch {
        input_ids_chosen,
        input_ids_rejected,
        ..batch
    })
}

/// Base collation followed by [`mask_padding_ids`]
#[derive(Debug, Clone)]
pub struct ZeroPadRewardCollator<C: Collator = RewardDataCollatorWithPadding> {
    base: C,
}

impl<C: Collator> ZeroPadRewardCollator<C> {
    pub fn new(base: C) -> Self {
        Self { base }
    }

    pub fn base(&self) -> &C {
        &self.base
    }
}

impl<C: Collator> Collator for ZeroPadRewardCollator<C> {
    fn collate(&self, examples: &[RewardExample]) -> Result<RewardBatch> {
        mask_padding_ids(self.base.collate(examples)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use itertools::izip;
    use rstest::*;

    fn example(chosen: &[u32], rejected: &[u32]) -> RewardExample {
        RewardExample::from_ids(chosen.to_vec(), rejected.to_vec())
    }

    #[fixture]
    fn examples() -> Vec<RewardExample> {
        vec![
            example(&[5, 7], &[11, 12, 13, 14]),
            example(&[5, 7, 9], &[11]),
        ]
    }

    #[rstest]
    fn test_base_collator_pads_with_pad_token(examples: Vec<RewardExample>) -> Result<()> {
        let collator = RewardDataCollatorWithPadding::new(3_u32);
        let batch = collator.collate(&examples)?;

        assert_eq!(
            batch.input_ids_chosen.to_vec2::<u32>()?,
            &[[5_u32, 7, 3], [5, 7, 9]]
        );
        assert_eq!(
            batch.attention_mask_chosen.to_vec2::<u32>()?,
            &[[1_u32, 1, 0], [1, 1, 1]]
        );
        assert_eq!(
            batch.input_ids_rejected.to_vec2::<u32>()?,
            &[[11_u32, 12, 13, 14], [11, 3, 3, 3]]
        );
        assert!(batch.margin.is_none());
        Ok(())
    }

    #[rstest]
    fn test_zero_pad_collator(examples: Vec<RewardExample>) -> Result<()> {
        let collator = ZeroPadRewardCollator::new(RewardDataCollatorWithPadding::new(3_u32));
        let batch = collator.collate(&examples)?;

        assert_eq!(
            batch.input_ids_chosen.to_vec2::<u32>()?,
            &[[5_u32, 7, 0], [5, 7, 9]]
        );
        assert_eq!(
            batch.input_ids_rejected.to_vec2::<u32>()?,
            &[[11_u32, 12, 13, 14], [11, 0, 0, 0]]
        );
        Ok(())
    }

    #[rstest]
    fn test_masking_only_touches_padding(examples: Vec<RewardExample>) -> Result<()> {
        let base = RewardDataCollatorWithPadding::new(50_257_u32).collate(&examples)?;
        let masked = mask_padding_ids(base.clone())?;

        for name in [INPUT_IDS_CHOSEN, INPUT_IDS_REJECTED] {
            let mask_name = name.replace("input_ids", "attention_mask");
            let base_ids = base.field(name)?.to_vec2::<u32>()?;
            let masked_ids = masked.field(name)?.to_vec2::<u32>()?;
            let mask = masked.field(&mask_name)?.to_vec2::<u32>()?;

            // masks pass through unchanged
            assert_eq!(mask, base.field(&mask_name)?.to_vec2::<u32>()?);

            for (base_row, masked_row, mask_row) in izip!(&base_ids, &masked_ids, &mask) {
                for (b, m, keep) in izip!(base_row, masked_row, mask_row) {
                    if *keep == 0 {
                        assert_eq!(*m, MASKED_ID);
                    } else {
                        assert_eq!(m, b);
                    }
                }
            }
        }
        Ok(())
    }

    #[rstest]
    fn test_masking_is_idempotent(examples: Vec<RewardExample>) -> Result<()> {
        let collator = ZeroPadRewardCollator::new(RewardDataCollatorWithPadding::new(3_u32));
        let once = collator.collate(&examples)?;
        let twice = mask_padding_ids(once.clone())?;

        assert_eq!(
            once.input_ids_chosen.to_vec2::<u32>()?,
            twice.input_ids_chosen.to_vec2::<u32>()?
        );
        assert_eq!(
            once.input_ids_rejected.to_vec2::<u32>()?,
            twice.input_ids_rejected.to_vec2::<u32>()?
        );
        Ok(())
    }

    #[rstest]
    fn test_batch_of_one() -> Result<()> {
        let collator = ZeroPadRewardCollator::new(RewardDataCollatorWithPadding::new(3_u32));
        let batch = collator.collate(&[example(&[4, 2], &[8])])?;

        assert_eq!(batch.batch_size(), 1_usize);
        assert_eq!(batch.input_ids_chosen.to_vec2::<u32>()?, &[[4_u32, 2]]);
        assert_eq!(batch.input_ids_rejected.to_vec2::<u32>()?, &[[8_u32]]);
        Ok(())
    }

    #[rstest]
    fn test_empty_batch() -> Result<()> {
        let collator = ZeroPadRewardCollator::new(RewardDataCollatorWithPadding::new(3_u32));
        let batch = collator.collate(&[])?;

        assert_eq!(batch.batch_size(), 0_usize);
        assert_eq!(batch.input_ids_chosen.dims(), &[0_usize, 0]);
        assert_eq!(batch.attention_mask_rejected.dims(), &[0_usize, 0]);
        Ok(())
    }

    #[rstest]
    fn test_misaligned_mask_is_shape_error() {
        let mut bad = example(&[1, 2, 3], &[4]);
        bad.attention_mask_chosen.pop();
        let collator = ZeroPadRewardCollator::new(RewardDataCollatorWithPadding::new(0_u32));

        let err = collator.collate(&[bad]).unwrap_err();
        assert!(
            matches!(err, RewardError::ShapeMismatch { ref field, .. } if field == INPUT_IDS_CHOSEN)
        );
    }

    #[rstest]
    fn test_pad_to_multiple_of(examples: Vec<RewardExample>) -> Result<()> {
        let collator = RewardDataCollatorWithPadding::new(3_u32).pad_to_multiple_of(Some(4));
        let batch = collator.collate(&examples)?;

        assert_eq!(batch.input_ids_chosen.dims(), &[2_usize, 4]);
        assert_eq!(batch.input_ids_rejected.dims(), &[2_usize, 4]);
        Ok(())
    }

    #[rstest]
    fn test_margin_collation() -> Result<()> {
        let collator = RewardDataCollatorWithPadding::new(3_u32);
        let mut a = example(&[1], &[2]);
        let mut b = example(&[1], &[2]);
        a.margin = Some(0.5);
        b.margin = Some(1.5);

        let batch = collator.collate(&[a.clone(), b])?;
        assert_eq!(batch.field("margin")?.to_vec1::<f32>()?, &[0.5_f32, 1.5]);

        let err = collator.collate(&[a, example(&[1], &[2])]).unwrap_err();
        assert!(matches!(err, RewardError::ShapeMismatch { .. }));
        Ok(())
    }

    #[rstest]
    fn test_collate_records() -> Result<()> {
        let collator = ZeroPadRewardCollator::new(RewardDataCollatorWithPadding::new(3_u32));
        let records = vec![
            serde_json::json!({
                "input_ids_chosen": [5, 7],
                "attention_mask_chosen": [1, 1],
                "input_ids_rejected": [1],
                "attention_mask_rejected": [1],
            }),
            serde_json::json!({
                "input_ids_chosen": [5, 7, 9],
                "attention_mask_chosen": [1, 1, 1],
                "input_ids_rejected": [2],
                "attention_mask_rejected": [1],
            }),
        ];

        let batch = collator.collate_records(&records)?;
        assert_eq!(
            batch.input_ids_chosen.to_vec2::<u32>()?,
            &[[5_u32, 7, 0], [5, 7, 9]]
        );

        let mut incomplete = records[0].clone();
        incomplete
            .as_object_mut()
            .unwrap()
            .remove(INPUT_IDS_REJECTED);
        let err = collator.collate_records(&[incomplete]).unwrap_err();
        assert!(matches!(err, RewardError::MissingField(_)));
        Ok(())
    }

    #[rstest]
    fn test_unknown_field() -> Result<()> {
        let batch = RewardDataCollatorWithPadding::new(3_u32).collate(&[example(&[1], &[2])])?;
        assert!(matches!(
            batch.field("labels"),
            Err(RewardError::MissingField(_))
        ));
        assert!(matches!(
            batch.field("margin"),
            Err(RewardError::MissingField(_))
        ));
        Ok(())
    }
}
