use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tiktoken_rs::{r50k_base, CoreBPE};

pub const END_OF_TEXT_TOKEN: &str = "<|endoftext|>";
pub const SEP_TOKEN: &str = "<|sep|>";
pub const MASK_TOKEN: &str = "<|mask|>";

/// Entries in r50k_base, `<|endoftext|>` included.
const R50K_VOCAB_SIZE: usize = 50_257;
const END_OF_TEXT_ID: u32 = 50_256;

const TOKENIZER_FILE: &str = "tokenizer.json";

/// GPT-2 byte-pair tokenizer with a growable tail of special tokens.
///
/// The base vocabulary is fixed by tiktoken; tokens appended with
/// [`add_special_token`](Self::add_special_token) get ids past it, so the
/// embedding table must be resized to [`vocab_size`](Self::vocab_size) before
/// any of them reach the model.
pub struct GptTokenizer {
    bpe: CoreBPE,
    base_vocab_size: usize,
    added_tokens: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct TokenizerFile {
    base: String,
    added_tokens: Vec<String>,
}

impl GptTokenizer {
    pub fn r50k() -> Result<Self> {
        let bpe = r50k_base().context("cannot build r50k_base tokenizer")?;
        Ok(Self {
            bpe,
            base_vocab_size: R50K_VOCAB_SIZE,
            added_tokens: Vec::new(),
        })
    }

    /// Resolves a tokenizer name the way the model registry resolves models.
    /// `None` falls back to the GPT-2 default.
    pub fn from_name(name: Option<&str>) -> Result<Self> {
        match name {
            None | Some("gpt2") | Some("r50k_base") => Self::r50k(),
            Some(other) => bail!("unknown tokenizer name: {other}"),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.base_vocab_size + self.added_tokens.len()
    }

    pub fn eot_id(&self) -> u32 {
        END_OF_TEXT_ID
    }

    /// Appends one special token and returns its id. Adding a token that is
    /// already registered returns the existing id and leaves the vocabulary
    /// unchanged.
    pub fn add_special_token(&mut self, token: &str) -> u32 {
        if let Some(id) = self.special_id(token) {
            return id;
        }
        self.added_tokens.push(token.to_string());
        (self.base_vocab_size + self.added_tokens.len() - 1) as u32
    }

    pub fn special_id(&self, token: &str) -> Option<u32> {
        self.added_tokens
            .iter()
            .position(|t| t == token)
            .map(|idx| (self.base_vocab_size + idx) as u32)
    }

    /// Encodes text, splicing in ids for any registered special tokens that
    /// occur verbatim in the input.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        if self.added_tokens.is_empty() {
            return self.bpe.encode_ordinary(text);
        }

        let mut ids = Vec::new();
        let mut rest = text;
        while !rest.is_empty() {
            let next = self
                .added_tokens
                .iter()
                .enumerate()
                .filter_map(|(idx, token)| {
                    rest.find(token.as_str()).map(|pos| (pos, token.len(), idx))
                })
                .min();
            match next {
                Some((pos, len, idx)) => {
                    ids.extend(self.bpe.encode_ordinary(&rest[..pos]));
                    ids.push((self.base_vocab_size + idx) as u32);
                    rest = &rest[pos + len..];
                }
                None => {
                    ids.extend(self.bpe.encode_ordinary(rest));
                    break;
                }
            }
        }
        ids
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        let mut text = String::new();
        let mut run: Vec<u32> = Vec::new();
        for &id in ids {
            if (id as usize) < self.base_vocab_size {
                run.push(id);
                continue;
            }
            if !run.is_empty() {
                text.push_str(
                    &self
                        .bpe
                        .decode(std::mem::take(&mut run))
                        .context("cannot decode token run")?,
                );
            }
            let token = self
                .added_tokens
                .get(id as usize - self.base_vocab_size)
                .with_context(|| format!("token id {id} is out of vocabulary"))?;
            text.push_str(token);
        }
        if !run.is_empty() {
            text.push_str(&self.bpe.decode(run).context("cannot decode token run")?);
        }
        Ok(text)
    }

    /// Writes the added-token list next to the model artifacts so a saved run
    /// can be reloaded with the same vocabulary.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let file = TokenizerFile {
            base: "r50k_base".to_string(),
            added_tokens: self.added_tokens.clone(),
        };
        let path = dir.join(TOKENIZER_FILE);
        fs::write(&path, serde_json::to_string_pretty(&file)?)
            .with_context(|| format!("cannot write {}", path.display()))?;
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(TOKENIZER_FILE);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let file: TokenizerFile =
            serde_json::from_str(&raw).with_context(|| format!("malformed {}", path.display()))?;
        let mut tokenizer = Self::from_name(Some(&file.base))?;
        for token in &file.added_tokens {
            tokenizer.add_special_token(token);
        }
        Ok(tokenizer)
    }

    pub fn saved_in(dir: &Path) -> bool {
        dir.join(TOKENIZER_FILE).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adding_a_special_token_grows_the_vocabulary_by_one() {
        let mut tokenizer = GptTokenizer::r50k().unwrap();
        assert_eq!(tokenizer.vocab_size(), R50K_VOCAB_SIZE);

        let id = tokenizer.add_special_token(SEP_TOKEN);
        assert_eq!(id as usize, R50K_VOCAB_SIZE);
        assert_eq!(tokenizer.vocab_size(), R50K_VOCAB_SIZE + 1);

        // re-adding is a no-op
        assert_eq!(tokenizer.add_special_token(SEP_TOKEN), id);
        assert_eq!(tokenizer.vocab_size(), R50K_VOCAB_SIZE + 1);
    }

    #[test]
    fn encode_splices_special_tokens() {
        let mut tokenizer = GptTokenizer::r50k().unwrap();
        let sep = tokenizer.add_special_token(SEP_TOKEN);

        let text = format!("question{SEP_TOKEN}answer");
        let ids = tokenizer.encode(&text);
        assert!(ids.contains(&sep));
        assert_eq!(tokenizer.decode(&ids).unwrap(), text);
    }

    #[test]
    fn plain_text_round_trips() {
        let tokenizer = GptTokenizer::r50k().unwrap();
        let text = "Every effort moves you forward.";
        let ids = tokenizer.encode(text);
        assert_eq!(tokenizer.decode(&ids).unwrap(), text);
    }

    #[test]
    fn save_and_load_preserve_added_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let mut tokenizer = GptTokenizer::r50k().unwrap();
        let sep = tokenizer.add_special_token(SEP_TOKEN);
        tokenizer.save(dir.path()).unwrap();

        assert!(GptTokenizer::saved_in(dir.path()));
        let reloaded = GptTokenizer::load(dir.path()).unwrap();
        assert_eq!(reloaded.vocab_size(), tokenizer.vocab_size());
        assert_eq!(reloaded.special_id(SEP_TOKEN), Some(sep));
    }

    #[test]
    fn unknown_tokenizer_name_is_rejected() {
        assert!(GptTokenizer::from_name(Some("cl100k_base")).is_err());
    }
}
