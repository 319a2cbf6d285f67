//! Tokenizers used to encode rendered conversations
//!
//! Both implementations are configured from an explicit [`TokenizerSetup`]:
//! the pad token is registered at construction time and nothing is mutated
//! afterwards.

use crate::config::TokenizerSetup;
use crate::error::{RewardError, Result};
use hf_hub::api::sync::Api;
use serde_json::Value;
use tiktoken_rs::{get_bpe_from_model, CoreBPE};
use tokenizers::{AddedToken, Tokenizer};

/// The capability `process` needs from a tokenizer
pub trait TextTokenizer {
    /// Token ids for `text`, special tokens included.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    fn pad_token_id(&self) -> u32;

    fn eos_token(&self) -> &str;

    /// Vocabulary size including added tokens.
    fn vocab_size(&self) -> usize;
}

/// GPT-2 BPE from `tiktoken-rs`
///
/// A pad token that is already a single GPT-2 token reuses its id. Any other
/// pad token is appended after the base vocab and matched in the input text
/// like a special token.
pub struct Gpt2Tokenizer {
    bpe: CoreBPE,
    eos_token: String,
    pad_token: String,
    pad_token_id: u32,
    added_pad: bool,
}

impl Gpt2Tokenizer {
    const BASE_VOCAB_SIZE: usize = 50_257;

    pub fn new(setup: &TokenizerSetup) -> Result<Self> {
        if setup.pad_token.is_empty() {
            return Err(RewardError::Tokenizer("pad token must not be empty".to_string()));
        }
        let bpe = get_bpe_from_model("gpt2").map_err(|e| RewardError::Tokenizer(e.to_string()))?;
        let (pad_token_id, added_pad) = match bpe.encode_with_special_tokens(&setup.pad_token)[..] {
            [id] => (id, false),
            _ => (Self::BASE_VOCAB_SIZE as u32, true),
        };
        Ok(Self {
            bpe,
            eos_token: setup.eos_token.clone(),
            pad_token: setup.pad_token.clone(),
            pad_token_id,
            added_pad,
        })
    }
}

impl TextTokenizer for Gpt2Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        if !self.added_pad {
            return Ok(self.bpe.encode_with_special_tokens(text));
        }
        let mut ids = vec![];
        for (idx, segment) in text.split(self.pad_token.as_str()).enumerate() {
            if idx > 0 {
                ids.push(self.pad_token_id);
            }
            ids.extend(self.bpe.encode_with_special_tokens(segment));
        }
        Ok(ids)
    }

    fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    fn eos_token(&self) -> &str {
        &self.eos_token
    }

    fn vocab_size(&self) -> usize {
        Self::BASE_VOCAB_SIZE + usize::from(self.added_pad)
    }
}

/// A Hugging Face `tokenizers` tokenizer, e.g. the one shipped with a hub model
pub struct HfTokenizer {
    tokenizer: Tokenizer,
    eos_token: String,
    pad_token_id: u32,
}

impl HfTokenizer {
    /// Registers the pad token (if absent) and checks the eos token exists.
    pub fn new(mut tokenizer: Tokenizer, setup: &TokenizerSetup) -> Result<Self> {
        if tokenizer.token_to_id(&setup.pad_token).is_none() {
            tokenizer.add_special_tokens(&[AddedToken::from(setup.pad_token.clone(), true)]);
        }
        let pad_token_id = tokenizer.token_to_id(&setup.pad_token).ok_or_else(|| {
            RewardError::Tokenizer(format!("unable to register `{}`", setup.pad_token))
        })?;
        if tokenizer.token_to_id(&setup.eos_token).is_none() {
            return Err(RewardError::Tokenizer(format!(
                "eos token `{}` is not in the vocabulary",
                setup.eos_token
            )));
        }
        Ok(Self {
            tokenizer,
            eos_token: setup.eos_token.clone(),
            pad_token_id,
        })
    }

    pub fn from_file<P: AsRef<std::path::Path>>(path: P, setup: &TokenizerSetup) -> Result<Self> {
        let tokenizer =
            Tokenizer::from_file(path).map_err(|e| RewardError::Tokenizer(e.to_string()))?;
        Self::new(tokenizer, setup)
    }

    /// Downloads `tokenizer.json` for `model_id` from the hub (cached by `hf-hub`).
    pub fn from_hub(model_id: &str, setup: &TokenizerSetup) -> Result<Self> {
        let api = Api::new()?;
        let path = api.model(model_id.to_string()).get("tokenizer.json")?;
        tracing::info!(model_id, path = %path.display(), "loaded tokenizer from hub");
        Self::from_file(path, setup)
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| RewardError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    fn eos_token(&self) -> &str {
        &self.eos_token
    }

    fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}

/// The `eos_token` of a hub `tokenizer_config.json`, stored either as a
/// string or as an added-token object with a `content` key.
pub fn eos_token_from_config(config: &Value) -> Option<String> {
    match config.get("eos_token")? {
        Value::String(token) => Some(token.clone()),
        Value::Object(token) => token.get("content")?.as_str().map(str::to_string),
        _ => None,
    }
}

/// Reads the eos token declared by `model_id` on the hub, if any.
pub fn hub_eos_token(model_id: &str) -> Result<Option<String>> {
    let api = Api::new()?;
    let path = match api.model(model_id.to_string()).get("tokenizer_config.json") {
        Ok(path) => path,
        Err(e) => {
            tracing::warn!(model_id, error = %e, "no tokenizer_config.json on the hub");
            return Ok(None);
        }
    };
    let config: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
    Ok(eos_token_from_config(&config))
}
