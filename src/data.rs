//! Preference datasets and the preprocessing step that tokenizes them

use crate::chat::{ChatMessage, ChatTemplate};
use crate::error::{RewardError, Result};
use crate::tokenizer::TextTokenizer;
use serde::{Deserialize, Serialize};
use std::{
    fs::{create_dir_all, read_to_string, File},
    io::{BufWriter, Write},
    path::Path,
    rc::Rc,
};

pub const DATASETS_SERVER_URL: &str = "https://datasets-server.huggingface.co/rows";
const ROWS_PAGE_SIZE: usize = 100;

pub const INPUT_IDS_CHOSEN: &str = "input_ids_chosen";
pub const ATTENTION_MASK_CHOSEN: &str = "attention_mask_chosen";
pub const INPUT_IDS_REJECTED: &str = "input_ids_rejected";
pub const ATTENTION_MASK_REJECTED: &str = "attention_mask_rejected";
pub const REQUIRED_FIELDS: [&str; 4] = [
    INPUT_IDS_CHOSEN,
    ATTENTION_MASK_CHOSEN,
    INPUT_IDS_REJECTED,
    ATTENTION_MASK_REJECTED,
];

/// A raw "trl-style" preference row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceRow {
    #[serde(default)]
    pub prompt: Option<String>,
    pub chosen: Vec<ChatMessage>,
    pub rejected: Vec<ChatMessage>,
}

/// A tokenized chosen/rejected pair, ready for collation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardExample {
    pub input_ids_chosen: Vec<u32>,
    pub attention_mask_chosen: Vec<u32>,
    pub input_ids_rejected: Vec<u32>,
    pub attention_mask_rejected: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margin: Option<f32>,
}

impl RewardExample {
    /// Builds an example from token ids, with all-ones attention masks.
    pub fn from_ids(chosen: Vec<u32>, rejected: Vec<u32>) -> Self {
        Self {
            attention_mask_chosen: vec![1; chosen.len()],
            attention_mask_rejected: vec![1; rejected.len()],
            input_ids_chosen: chosen,
            input_ids_rejected: rejected,
            margin: None,
        }
    }

    /// Builds an example from a loosely typed record, failing on the first
    /// missing token field.
    pub fn from_record(record: &serde_json::Value) -> Result<Self> {
        for field in REQUIRED_FIELDS {
            if record.get(field).is_none() {
                return Err(RewardError::MissingField(field.to_string()));
            }
        }
        Ok(serde_json::from_value(record.clone())?)
    }

    /// Length of the longer of the two sequences.
    pub fn max_len(&self) -> usize {
        std::cmp::max(self.input_ids_chosen.len(), self.input_ids_rejected.len())
    }
}

/// Renders and tokenizes one preference row
///
/// Both conversations go through the chat template and are trimmed before
/// tokenization. The tokenizer is passed in rather than captured.
pub fn process<T: TextTokenizer + ?Sized>(
    row: &PreferenceRow,
    tokenizer: &T,
    template: &ChatTemplate,
) -> Result<RewardExample> {
    let chosen = template.apply(&row.chosen, tokenizer.eos_token());
    let rejected = template.apply(&row.rejected, tokenizer.eos_token());
    let chosen_ids = tokenizer.encode(chosen.trim())?;
    let rejected_ids = tokenizer.encode(rejected.trim())?;
    Ok(RewardExample::from_ids(chosen_ids, rejected_ids))
}

/// Loads preference rows from a `.jsonl` (one row per line) or `.json` (array) file
pub fn load_preference_rows<P: AsRef<Path>>(path: P) -> Result<Vec<PreferenceRow>> {
    let path = path.as_ref();
    let content = read_to_string(path)?;
    let is_jsonl = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("jsonl"));
    if is_jsonl {
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| Ok(serde_json::from_str::<PreferenceRow>(line)?))
            .collect()
    } else {
        Ok(serde_json::from_str(&content)?)
    }
}

/// Writes rows as JSON lines.
pub fn write_jsonl<T: Serialize, P: AsRef<Path>>(rows: &[T], path: P) -> Result<()> {
    if let Some(parent) = path.as_ref().parent() {
        create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(File::create(path.as_ref())?);
    for row in rows {
        serde_json::to_writer(&mut out, row)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct RowsPage {
    rows: Vec<RowEntry>,
    num_rows_total: usize,
}

#[derive(Debug, Deserialize)]
struct RowEntry {
    row: PreferenceRow,
}

/// Fetches a dataset split through the datasets-server rows API
///
/// The split is cached as JSONL at `cache_path`; an existing cache is loaded
/// instead of downloading again.
pub fn download_preference_rows<P: AsRef<Path>>(
    dataset: &str,
    config: &str,
    split: &str,
    cache_path: P,
) -> Result<Vec<PreferenceRow>> {
    if cache_path.as_ref().exists() {
        tracing::info!(path = %cache_path.as_ref().display(), "using cached dataset split");
        return load_preference_rows(cache_path);
    }

    let client = reqwest::blocking::Client::new();
    let mut rows = vec![];
    let mut offset = 0_usize;
    let length = ROWS_PAGE_SIZE.to_string();
    loop {
        let offset_str = offset.to_string();
        let page: RowsPage = client
            .get(DATASETS_SERVER_URL)
            .query(&[
                ("dataset", dataset),
                ("config", config),
                ("split", split),
                ("offset", offset_str.as_str()),
                ("length", length.as_str()),
            ])
            .send()?
            .error_for_status()?
            .json()?;
        let fetched = page.rows.len();
        rows.extend(page.rows.into_iter().map(|entry| entry.row));
        offset += fetched;
        tracing::debug!(offset, total = page.num_rows_total, "fetched rows page");
        if fetched == 0 || offset >= page.num_rows_total {
            break;
        }
    }
    tracing::info!(dataset, split, rows = rows.len(), "downloaded dataset split");

    write_jsonl(&rows, cache_path)?;
    Ok(rows)
}

/// Splits off the last `eval_samples` rows as an evaluation set.
///
/// Runs on raw rows, before tokenization and length filtering, so set
/// membership does not depend on `max_length`.
pub fn split_eval_rows<T>(rows: &[T], eval_samples: usize) -> Result<(&[T], &[T])> {
    if eval_samples > rows.len() {
        return Err(RewardError::Config(format!(
            "eval_samples ({eval_samples}) exceeds dataset size ({})",
            rows.len()
        )));
    }
    Ok(rows.split_at(rows.len() - eval_samples))
}

pub struct RewardDataset_ {
    examples: Vec<RewardExample>,
}

/// A tokenized preference dataset
///
/// NOTE: This is a Rc-wrapped `RewardDataset_`
#[derive(Clone)]
pub struct RewardDataset(Rc<RewardDataset_>);

impl AsRef<RewardDataset> for RewardDataset {
    fn as_ref(&self) -> &RewardDataset {
        self
    }
}

impl std::ops::Deref for RewardDataset {
    type Target = RewardDataset_;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl RewardDataset {
    /// Runs `process` over every row, dropping pairs longer than `max_length`.
    pub fn new<T: TextTokenizer + ?Sized>(
        rows: &[PreferenceRow],
        tokenizer: &T,
        template: &ChatTemplate,
        max_length: Option<usize>,
    ) -> Result<Self> {
        let mut examples = Vec::with_capacity(rows.len());
        for row in rows {
            let example = process(row, tokenizer, template)?;
            if max_length.is_some_and(|max| example.max_len() > max) {
                continue;
            }
            examples.push(example);
        }
        let dropped = rows.len() - examples.len();
        if dropped > 0 {
            tracing::info!(dropped, ?max_length, "dropped pairs exceeding max length");
        }
        Ok(Self::from_examples(examples))
    }

    pub fn from_examples(examples: Vec<RewardExample>) -> Self {
        Self(Rc::new(RewardDataset_ { examples }))
    }

    /// Gets the number of preference pairs.
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Checks whether the dataset has no preference pairs.
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn get_item_at_index(&self, idx: usize) -> Option<&RewardExample> {
        self.examples.get(idx)
    }

    pub fn examples(&self) -> &[RewardExample] {
        &self.examples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenizerSetup;
    use crate::tokenizer::Gpt2Tokenizer;
    use anyhow::Result;
    use rstest::*;
    use tempfile::tempdir;

    #[fixture]
    fn preference_row() -> PreferenceRow {
        PreferenceRow {
            prompt: Some("Describe the sky.".to_string()),
            chosen: vec![
                ChatMessage::user("Describe the sky."),
                ChatMessage::assistant("A vast azure dome streaked with clouds."),
            ],
            rejected: vec![
                ChatMessage::user("Describe the sky."),
                ChatMessage::assistant("Blue."),
            ],
        }
    }

    #[fixture]
    fn tokenizer() -> Gpt2Tokenizer {
        Gpt2Tokenizer::new(&TokenizerSetup::default()).unwrap()
    }

    #[rstest]
    fn test_process(preference_row: PreferenceRow, tokenizer: Gpt2Tokenizer) -> Result<()> {
        let template = ChatTemplate::Concat;
        let example = process(&preference_row, &tokenizer, &template)?;

        let expected_chosen = tokenizer
            .encode("Describe the sky. A vast azure dome streaked with clouds.<|endoftext|>")?;
        let expected_rejected = tokenizer.encode("Describe the sky. Blue.<|endoftext|>")?;
        assert_eq!(example.input_ids_chosen, expected_chosen);
        assert_eq!(example.input_ids_rejected, expected_rejected);
        assert_eq!(
            example.attention_mask_chosen,
            vec![1_u32; expected_chosen.len()]
        );
        assert_eq!(
            example.attention_mask_rejected,
            vec![1_u32; expected_rejected.len()]
        );
        assert_eq!(*example.input_ids_chosen.last().unwrap(), 50_256_u32);
        Ok(())
    }

    #[rstest]
    fn test_from_record_missing_field() {
        let record = serde_json::json!({
            "input_ids_chosen": [1, 2],
            "attention_mask_chosen": [1, 1],
            "input_ids_rejected": [3],
        });
        let err = RewardExample::from_record(&record).unwrap_err();
        assert!(
            matches!(err, RewardError::MissingField(ref field) if field == ATTENTION_MASK_REJECTED)
        );
    }

    #[rstest]
    fn test_from_record() -> Result<()> {
        let record = serde_json::json!({
            "input_ids_chosen": [1, 2],
            "attention_mask_chosen": [1, 1],
            "input_ids_rejected": [3],
            "attention_mask_rejected": [1],
            "margin": 0.5,
        });
        let example = RewardExample::from_record(&record)?;
        assert_eq!(example.input_ids_chosen, vec![1_u32, 2]);
        assert_eq!(example.margin, Some(0.5_f32));
        Ok(())
    }

    #[rstest]
    fn test_dataset_drops_long_pairs(
        preference_row: PreferenceRow,
        tokenizer: Gpt2Tokenizer,
    ) -> Result<()> {
        let rows = vec![preference_row.clone(), preference_row];
        let template = ChatTemplate::Concat;
        let full = RewardDataset::new(&rows, &tokenizer, &template, None)?;
        assert_eq!(full.len(), 2_usize);

        let max_len = full.get_item_at_index(0).unwrap().max_len();
        let kept = RewardDataset::new(&rows, &tokenizer, &template, Some(max_len))?;
        assert_eq!(kept.len(), 2_usize);
        let dropped = RewardDataset::new(&rows, &tokenizer, &template, Some(max_len - 1))?;
        assert!(dropped.is_empty());
        Ok(())
    }

    #[rstest]
    fn test_split_eval_rows() -> Result<()> {
        let rows = (0..5_u32).collect::<Vec<_>>();

        let (train, eval) = split_eval_rows(&rows, 2)?;

        assert_eq!(train, &[0_u32, 1, 2]);
        assert_eq!(eval, &[3_u32, 4]);
        assert!(split_eval_rows(&rows, 6).is_err());
        let (train, eval) = split_eval_rows(&rows, 0)?;
        assert_eq!((train.len(), eval.len()), (5_usize, 0_usize));
        Ok(())
    }

    #[rstest]
    fn test_split_before_length_filter(
        preference_row: PreferenceRow,
        tokenizer: Gpt2Tokenizer,
    ) -> Result<()> {
        let template = ChatTemplate::Concat;
        let mut long_row = preference_row.clone();
        long_row.chosen[1].content = "very ".repeat(64);
        let rows = vec![
            preference_row.clone(),
            preference_row.clone(),
            preference_row.clone(),
            long_row,
        ];
        let max_length = process(&preference_row, &tokenizer, &template)?.max_len();

        let (train_rows, eval_rows) = split_eval_rows(&rows, 2)?;
        let train = RewardDataset::new(train_rows, &tokenizer, &template, Some(max_length))?;
        let eval = RewardDataset::new(eval_rows, &tokenizer, &template, Some(max_length))?;

        // the long trailing row is dropped from eval, not replaced by a train row
        assert_eq!(train.len(), 2_usize);
        assert_eq!(eval.len(), 1_usize);
        Ok(())
    }

    #[rstest]
    fn test_load_preference_rows_jsonl_and_json(preference_row: PreferenceRow) -> Result<()> {
        let dir = tempdir()?;
        let jsonl_path = dir.path().join("rows.jsonl");
        write_jsonl(&[preference_row.clone(), preference_row.clone()], &jsonl_path)?;
        assert_eq!(load_preference_rows(&jsonl_path)?.len(), 2_usize);

        let json_path = dir.path().join("rows.json");
        std::fs::write(&json_path, serde_json::to_string(&vec![preference_row.clone()])?)?;
        assert_eq!(load_preference_rows(&json_path)?, vec![preference_row]);
        Ok(())
    }

    #[rstest]
    fn test_download_uses_existing_cache(preference_row: PreferenceRow) -> Result<()> {
        let dir = tempdir()?;
        let cache = dir.path().join("cached.jsonl");
        write_jsonl(&[preference_row.clone()], &cache)?;
        let rows = download_preference_rows("unused/dataset", "default", "train", &cache)?;
        assert_eq!(rows, vec![preference_row]);
        Ok(())
    }
}
