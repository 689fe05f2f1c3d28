// ============================================================
// Layer 6 — Dictionary
// ============================================================
// Word-level vocabulary shared by training and inference.
//
// The vocabulary is stored as a HuggingFace tokenizer JSON with a
// `WordLevel` model: we count tokens ourselves, write the vocab
// into the JSON and load it back through `tokenizers`, which then
// handles normalisation, pre-tokenisation and id lookup.
//
// Fixed ids for the special tokens:
//   __null__  0   padding
//   __start__ 1   first decoder input
//   __end__   2   end of a reply
//   __unk__   3   anything not in the vocabulary
//
// Regular tokens follow from id 4, most frequent first.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    str::FromStr,
};
use tokenizers::{
    pre_tokenizers::PreTokenizerWrapper, OffsetReferential, OffsetType, PreTokenizedString,
    PreTokenizer, Tokenizer,
};

use crate::domain::options::{DictOptions, DictTokenizer};

pub const NULL_TOKEN: &str = "__null__";
pub const START_TOKEN: &str = "__start__";
pub const END_TOKEN: &str = "__end__";
pub const UNK_TOKEN: &str = "__unk__";

const SPECIAL_TOKENS: [&str; 4] = [NULL_TOKEN, START_TOKEN, END_TOKEN, UNK_TOKEN];

/// Token <-> index mapping.
#[derive(Clone)]
pub struct Dictionary {
    tokenizer: Tokenizer,
    null_idx:  u32,
    start_idx: u32,
    end_idx:   u32,
    unk_idx:   u32,
}

impl std::fmt::Debug for Dictionary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dictionary").field("len", &self.len()).finish()
    }
}

impl Dictionary {
    /// Count tokens over `texts` and build a vocabulary.
    pub fn build<S: AsRef<str>>(texts: &[S], opts: &DictOptions) -> Result<Self> {
        let pre = pre_tokenizer(opts.tokenizer)?;

        let mut freq: HashMap<String, usize> = HashMap::new();
        for text in texts {
            let text = text.as_ref();
            let text = if opts.lower { text.to_lowercase() } else { text.to_string() };
            for tok in split_with(&pre, &text)? {
                *freq.entry(tok).or_insert(0) += 1;
            }
        }

        let mut words: Vec<(String, usize)> = freq
            .into_iter()
            .filter(|(w, c)| *c >= opts.min_freq && !SPECIAL_TOKENS.contains(&w.as_str()))
            .collect();
        // Most frequent first; ties broken alphabetically so builds are reproducible
        words.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        if let Some(max) = opts.max_tokens {
            words.truncate(max);
        }

        let mut vocab = serde_json::Map::new();
        for (i, tok) in SPECIAL_TOKENS.iter().enumerate() {
            vocab.insert(tok.to_string(), serde_json::json!(i));
        }
        for (i, (word, _)) in words.iter().enumerate() {
            vocab.insert(word.clone(), serde_json::json!(SPECIAL_TOKENS.len() + i));
        }

        let added_tokens: Vec<serde_json::Value> = SPECIAL_TOKENS
            .iter()
            .enumerate()
            .map(|(i, tok)| {
                serde_json::json!({
                    "id": i, "content": tok, "single_word": false, "lstrip": false,
                    "rstrip": false, "normalized": false, "special": true
                })
            })
            .collect();

        let normalizer = if opts.lower {
            serde_json::json!({ "type": "Lowercase" })
        } else {
            serde_json::Value::Null
        };

        let tokenizer_json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": added_tokens,
            "normalizer": normalizer,
            "pre_tokenizer": pre_tokenizer_json(opts.tokenizer),
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": vocab,
                "unk_token": UNK_TOKEN
            }
        });

        let tokenizer = Tokenizer::from_str(&tokenizer_json.to_string())
            .map_err(|e| anyhow::anyhow!("Cannot assemble dictionary tokenizer: {e}"))?;

        tracing::info!(
            "Dictionary built: {} tokens ({} special)",
            words.len() + SPECIAL_TOKENS.len(),
            SPECIAL_TOKENS.len()
        );
        Self::from_tokenizer(tokenizer)
    }

    /// Load a dictionary previously written with [`Dictionary::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path).map_err(|e| {
            anyhow::anyhow!("Cannot load dictionary from '{}': {}", path.display(), e)
        })?;
        Self::from_tokenizer(tokenizer)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Cannot create '{}'", parent.display()))?;
            }
        }
        self.tokenizer
            .save(path, true)
            .map_err(|e| anyhow::anyhow!("Cannot write dictionary '{}': {}", path.display(), e))?;
        tracing::debug!("Saved dictionary to '{}'", path.display());
        Ok(())
    }

    fn from_tokenizer(tokenizer: Tokenizer) -> Result<Self> {
        let id = |tok: &str| {
            tokenizer
                .token_to_id(tok)
                .with_context(|| format!("Dictionary is missing special token {tok}"))
        };
        Ok(Self {
            null_idx:  id(NULL_TOKEN)?,
            start_idx: id(START_TOKEN)?,
            end_idx:   id(END_TOKEN)?,
            unk_idx:   id(UNK_TOKEN)?,
            tokenizer,
        })
    }

    /// Text → token ids. Unknown words become `__unk__`.
    pub fn txt2vec(&self, text: &str) -> Result<Vec<u32>> {
        let enc = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenisation error: {e}"))?;
        Ok(enc.get_ids().to_vec())
    }

    /// Text → surface words, without mapping unknown words to `__unk__`.
    pub fn tokenize(&self, text: &str) -> Result<Vec<String>> {
        let enc = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenisation error: {e}"))?;
        // Lowercase is the only normalizer a dictionary ever carries
        let lower = self.tokenizer.get_normalizer().is_some();
        Ok(enc
            .get_offsets()
            .iter()
            .filter_map(|&(start, end)| text.get(start..end))
            .map(|w| if lower { w.to_lowercase() } else { w.to_string() })
            .collect())
    }

    /// Token ids → space-joined text. Ids outside the vocabulary are skipped.
    pub fn vec2txt(&self, ids: &[u32]) -> String {
        ids.iter()
            .filter_map(|&id| self.tokenizer.id_to_token(id))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn tok2ind(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    pub fn ind2tok(&self, id: u32) -> Option<String> {
        self.tokenizer.id_to_token(id)
    }

    pub fn len(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn null_idx(&self) -> u32 { self.null_idx }
    pub fn start_idx(&self) -> u32 { self.start_idx }
    pub fn end_idx(&self) -> u32 { self.end_idx }
    pub fn unk_idx(&self) -> u32 { self.unk_idx }
}

// The pre-tokenizer used for counting is deserialised from the same
// JSON that goes into the saved tokenizer, so both always agree.
fn pre_tokenizer_json(kind: DictTokenizer) -> serde_json::Value {
    match kind {
        DictTokenizer::Split => serde_json::json!({
            "type": "Sequence",
            "pretokenizers": [
                {
                    "type": "Split",
                    "pattern": { "Regex": "[.,;:!?]" },
                    "behavior": "Isolated",
                    "invert": false
                },
                { "type": "WhitespaceSplit" }
            ]
        }),
        DictTokenizer::Re => serde_json::json!({ "type": "Whitespace" }),
    }
}

fn pre_tokenizer(kind: DictTokenizer) -> Result<PreTokenizerWrapper> {
    serde_json::from_value(pre_tokenizer_json(kind))
        .context("Cannot build dictionary pre-tokenizer")
}

fn split_with(pre: &PreTokenizerWrapper, text: &str) -> Result<Vec<String>> {
    let mut pts = PreTokenizedString::from(text);
    pre.pre_tokenize(&mut pts)
        .map_err(|e| anyhow::anyhow!("Pre-tokenisation error: {e}"))?;
    Ok(pts
        .get_splits(OffsetReferential::Original, OffsetType::Byte)
        .into_iter()
        .map(|(s, _, _)| s.to_string())
        .filter(|s| !s.trim().is_empty())
        .collect())
}

// ─── DictionaryStore ──────────────────────────────────────────────────────────
/// Loads the dictionary from disk when it exists, builds and saves it
/// otherwise.
pub struct DictionaryStore {
    path: PathBuf,
}

impl DictionaryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load_or_build<S: AsRef<str>>(&self, texts: &[S], opts: &DictOptions) -> Result<Dictionary> {
        if self.exists() {
            tracing::info!("Loading existing dictionary from '{}'", self.path.display());
            Dictionary::load(&self.path)
        } else {
            tracing::info!("Building new dictionary from {} texts", texts.len());
            let dict = Dictionary::build(texts, opts)?;
            dict.save(&self.path)?;
            Ok(dict)
        }
    }

    pub fn load(&self) -> Result<Dictionary> {
        Dictionary::load(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Vec<String> {
        vec![
            "Hello, how are you?".to_string(),
            "I am fine. How are you?".to_string(),
            "hello again!".to_string(),
        ]
    }

    #[test]
    fn test_special_tokens_have_fixed_ids() {
        let d = Dictionary::build(&corpus(), &DictOptions::default()).unwrap();
        assert_eq!(d.null_idx(), 0);
        assert_eq!(d.start_idx(), 1);
        assert_eq!(d.end_idx(), 2);
        assert_eq!(d.unk_idx(), 3);
    }

    #[test]
    fn test_most_frequent_token_comes_first() {
        let d = Dictionary::build(&corpus(), &DictOptions::default()).unwrap();
        // "are", "how", "hello", "you" and "?" all appear twice; "?" sorts first
        assert_eq!(d.ind2tok(4).as_deref(), Some("?"));
        assert!(d.tok2ind("hello").is_some());
    }

    #[test]
    fn test_split_tokenizer_isolates_punctuation() {
        let d = Dictionary::build(&corpus(), &DictOptions::default()).unwrap();
        let ids = d.txt2vec("hello, how are you?").unwrap();
        assert_eq!(d.vec2txt(&ids), "hello , how are you ?");
    }

    #[test]
    fn test_unknown_maps_to_unk() {
        let d = Dictionary::build(&corpus(), &DictOptions::default()).unwrap();
        let ids = d.txt2vec("zebra").unwrap();
        assert_eq!(ids, vec![d.unk_idx()]);
    }

    #[test]
    fn test_tokenize_keeps_unknown_words() {
        let d = Dictionary::build(&corpus(), &DictOptions::default()).unwrap();
        assert_eq!(d.tokenize("Hello, zebra!").unwrap(), vec!["hello", ",", "zebra", "!"]);
    }

    #[test]
    fn test_lowercasing_applies_on_encode() {
        let d = Dictionary::build(&corpus(), &DictOptions::default()).unwrap();
        assert_eq!(d.txt2vec("HELLO").unwrap(), d.txt2vec("hello").unwrap());
    }

    #[test]
    fn test_min_freq_and_max_tokens() {
        let opts = DictOptions {
            min_freq: 2,
            ..Default::default()
        };
        let d = Dictionary::build(&corpus(), &opts).unwrap();
        assert!(d.tok2ind("fine").is_none());

        let opts = DictOptions {
            max_tokens: Some(2),
            ..Default::default()
        };
        let d = Dictionary::build(&corpus(), &opts).unwrap();
        assert_eq!(d.len(), 6);
    }

    #[test]
    fn test_save_and_load_keep_ids() {
        let dir = std::env::temp_dir().join(format!("convai_dict_{}", std::process::id()));
        let path = dir.join("model.dict");
        let d = Dictionary::build(&corpus(), &DictOptions::default()).unwrap();
        d.save(&path).unwrap();

        let loaded = DictionaryStore::new(&path).load().unwrap();
        assert_eq!(loaded.len(), d.len());
        assert_eq!(loaded.tok2ind("fine"), d.tok2ind("fine"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
