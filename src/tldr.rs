//! TL;DR summarization preference data in `prompt, chosen, rejected` form
//!
//! Comparison records pair two summaries of a Reddit post (or a CNN/DM
//! article) with the index of the preferred one. Each record is turned into
//! user/assistant conversations for the chosen and rejected summaries.
//! Supervised records are turned into a single `messages` conversation.

use crate::chat::ChatMessage;
use crate::data::write_jsonl;
use crate::error::{RewardError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const CNNDM_BATCHES: [&str; 3] = ["batch0_cnndm", "cnndm0", "cnndm2"];
pub const DEBUG_ROWS: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub subreddit: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub post: Option<String>,
    #[serde(default)]
    pub article: Option<String>,
    #[serde(default)]
    pub site: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub text: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A raw comparison between two summaries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub info: PostInfo,
    pub summaries: Vec<Summary>,
    pub choice: usize,
    #[serde(default)]
    pub worker: Option<String>,
    pub batch: String,
    #[serde(default)]
    pub split: Option<String>,
    #[serde(default)]
    pub extra: serde_json::Value,
}

impl Comparison {
    pub fn is_cnndm(&self) -> bool {
        CNNDM_BATCHES.contains(&self.batch.as_str())
    }
}

/// A comparison in preference form, keeping the source columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TldrPreferenceRow {
    pub prompt: String,
    pub chosen: Vec<ChatMessage>,
    pub rejected: Vec<ChatMessage>,
    pub info: PostInfo,
    pub summaries: Vec<Summary>,
    pub choice: usize,
    pub worker: Option<String>,
    pub batch: String,
    pub split: Option<String>,
    pub extra: serde_json::Value,
}

/// A supervised summarization record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SftRecord {
    #[serde(default)]
    pub id: Option<String>,
    pub subreddit: String,
    pub title: String,
    pub post: String,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SftRow {
    pub prompt: String,
    pub messages: Vec<ChatMessage>,
    pub id: Option<String>,
    pub subreddit: String,
    pub title: String,
    pub post: String,
    pub summary: String,
}

fn required<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| RewardError::MissingField(format!("info.{field}")))
}

fn tldr_prompt(subreddit: &str, title: &str, post: &str) -> String {
    format!("SUBREDDIT: r/{subreddit}\n\nTITLE: {title}\n\nPOST: {post}\n\nTL;DR:")
}

/// The prompt shown to summarizers for this comparison.
pub fn format_prompt(comparison: &Comparison) -> Result<String> {
    let info = &comparison.info;
    if comparison.is_cnndm() {
        let article = required(&info.article, "article")?;
        Ok(format!("Article:\n{article}\n\nTL;DR:"))
    } else {
        Ok(tldr_prompt(
            required(&info.subreddit, "subreddit")?,
            required(&info.title, "title")?,
            required(&info.post, "post")?,
        ))
    }
}

/// Builds the chosen/rejected conversations; summaries are trimmed.
pub fn to_preference_row(comparison: Comparison) -> Result<TldrPreferenceRow> {
    if comparison.summaries.len() != 2 || comparison.choice > 1 {
        return Err(RewardError::ShapeMismatch {
            field: "summaries".to_string(),
            reason: format!(
                "expected two summaries and choice 0 or 1, got {} summaries and choice {}",
                comparison.summaries.len(),
                comparison.choice
            ),
        });
    }
    let prompt = format_prompt(&comparison)?;
    let chosen = comparison.summaries[comparison.choice].text.trim();
    let rejected = comparison.summaries[1 - comparison.choice].text.trim();
    Ok(TldrPreferenceRow {
        chosen: vec![ChatMessage::user(&prompt), ChatMessage::assistant(chosen)],
        rejected: vec![ChatMessage::user(&prompt), ChatMessage::assistant(rejected)],
        prompt,
        info: comparison.info,
        summaries: comparison.summaries,
        choice: comparison.choice,
        worker: comparison.worker,
        batch: comparison.batch,
        split: comparison.split,
        extra: comparison.extra,
    })
}

pub fn to_sft_row(record: SftRecord) -> SftRow {
    let prompt = tldr_prompt(&record.subreddit, &record.title, &record.post);
    SftRow {
        messages: vec![
            ChatMessage::user(&prompt),
            ChatMessage::assistant(&record.summary),
        ],
        prompt,
        id: record.id,
        subreddit: record.subreddit,
        title: record.title,
        post: record.post,
        summary: record.summary,
    }
}

/// Converts every split of comparisons into preference rows
///
/// The `validation` split is separated by source: CNN/DM comparisons move to
/// `validation_cnndm` (skipped in debug mode) and are removed from
/// `validation`. In debug mode each split keeps its first `DEBUG_ROWS` records.
pub fn prepare_preference_splits(
    mut splits: BTreeMap<String, Vec<Comparison>>,
    debug: bool,
) -> Result<BTreeMap<String, Vec<TldrPreferenceRow>>> {
    if debug {
        for records in splits.values_mut() {
            records.truncate(DEBUG_ROWS);
        }
    }
    if let Some(validation) = splits.remove("validation") {
        let (cnndm, reddit): (Vec<_>, Vec<_>) =
            validation.into_iter().partition(Comparison::is_cnndm);
        if !debug {
            splits.insert("validation_cnndm".to_string(), cnndm);
        }
        splits.insert("validation".to_string(), reddit);
    }

    let mut prepared = BTreeMap::new();
    for (split, records) in splits {
        let rows = records
            .into_iter()
            .map(to_preference_row)
            .collect::<Result<Vec<_>>>()?;
        tracing::info!(split = %split, rows = rows.len(), "prepared preference split");
        prepared.insert(split, rows);
    }
    Ok(prepared)
}

pub fn prepare_sft_splits(
    splits: BTreeMap<String, Vec<SftRecord>>,
    debug: bool,
) -> BTreeMap<String, Vec<SftRow>> {
    splits
        .into_iter()
        .map(|(split, mut records)| {
            if debug {
                records.truncate(DEBUG_ROWS);
            }
            let rows = records.into_iter().map(to_sft_row).collect::<Vec<_>>();
            (split, rows)
        })
        .collect()
}

/// Reads every `<split>.jsonl` file in `dir` as records of type `T`.
pub fn load_splits<T, P>(dir: P) -> Result<BTreeMap<String, Vec<T>>>
where
    T: for<'de> Deserialize<'de>,
    P: AsRef<Path>,
{
    let mut splits = BTreeMap::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let Some(split) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let records = std::fs::read_to_string(&path)?
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| Ok(serde_json::from_str::<T>(line)?))
            .collect::<Result<Vec<_>>>()?;
        splits.insert(split.to_string(), records);
    }
    Ok(splits)
}

/// Writes each split to `<dir>/<split>.jsonl`.
pub fn write_splits<T: Serialize, P: AsRef<Path>>(
    splits: &BTreeMap<String, Vec<T>>,
    dir: P,
) -> Result<()> {
    for (split, rows) in splits {
        write_jsonl(rows, dir.as_ref().join(format!("{split}.jsonl")))?;
    }
    Ok(())
}
