use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::data::dataset::Dataset;

use crate::config::DataArgs;
use crate::tokenizer::GptTokenizer;

/// One example: a window of token ids and its next-token targets.
#[derive(Clone, Debug)]
pub struct LmExample {
    pub input_ids: Vec<u32>,
    pub target_ids: Vec<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Split {
    Train,
    Eval,
}

/// In-memory language-modeling dataset with two construction strategies:
/// contiguous token windows over the whole corpus, or one example per
/// non-empty line.
#[derive(Clone, Debug, Default)]
pub struct TextDataset {
    items: Vec<LmExample>,
}

impl TextDataset {
    /// Windows of `block_size` tokens, targets shifted by one. With
    /// `stride == block_size` the windows tile the corpus. A corpus shorter
    /// than one block yields an empty dataset.
    pub fn chunked(token_ids: &[u32], block_size: usize, stride: usize) -> Self {
        let mut items = Vec::new();
        let last_start = token_ids.len().saturating_sub(block_size);
        for i in (0..last_start).step_by(stride.max(1)) {
            items.push(LmExample {
                input_ids: token_ids[i..i + block_size].to_vec(),
                target_ids: token_ids[i + 1..i + 1 + block_size].to_vec(),
            });
        }
        Self { items }
    }

    /// One example per non-empty line, truncated to the block size.
    pub fn line_by_line(text: &str, tokenizer: &GptTokenizer, block_size: usize) -> Self {
        let mut items = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut input_ids = tokenizer.encode(line);
            input_ids.truncate(block_size + 1);
            let target_ids = input_ids[1..].to_vec();
            if input_ids.len() > 1 {
                input_ids.pop();
            }
            items.push(LmExample {
                input_ids,
                target_ids,
            });
        }
        Self { items }
    }

    /// Reads the file for `split` and dispatches on the configured strategy.
    /// The chunked path caches the tokenized id stream next to the input file.
    pub fn from_config(
        args: &DataArgs,
        tokenizer: &GptTokenizer,
        split: Split,
    ) -> Result<Self> {
        let file_path = match split {
            Split::Train => &args.train_data_file,
            Split::Eval => &args.eval_data_file,
        };
        if args.line_by_line {
            let text = fs::read_to_string(file_path)
                .with_context(|| format!("cannot read {}", file_path.display()))?;
            Ok(Self::line_by_line(&text, tokenizer, args.block_size))
        } else {
            let token_ids = cached_token_ids(file_path, args, tokenizer)?;
            Ok(Self::chunked(&token_ids, args.block_size, args.block_size))
        }
    }
}

impl Dataset<LmExample> for TextDataset {
    fn get(&self, index: usize) -> Option<LmExample> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

fn cache_path_for(file_path: &Path, block_size: usize) -> PathBuf {
    let file_name = file_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    file_path.with_file_name(format!("cached_lm_{block_size}_{file_name}.json"))
}

fn cached_token_ids(
    file_path: &Path,
    args: &DataArgs,
    tokenizer: &GptTokenizer,
) -> Result<Vec<u32>> {
    let cache_path = cache_path_for(file_path, args.block_size);
    if cache_path.is_file() && !args.overwrite_cache {
        tracing::info!("loading features from cached file {}", cache_path.display());
        let raw = fs::read_to_string(&cache_path)
            .with_context(|| format!("cannot read {}", cache_path.display()))?;
        return serde_json::from_str(&raw)
            .with_context(|| format!("malformed cache file {}", cache_path.display()));
    }

    tracing::info!("creating features from dataset file {}", file_path.display());
    let text = fs::read_to_string(file_path)
        .with_context(|| format!("cannot read {}", file_path.display()))?;
    let token_ids = tokenizer.encode(&text);
    fs::write(&cache_path, serde_json::to_string(&token_ids)?)
        .with_context(|| format!("cannot write {}", cache_path.display()))?;
    Ok(token_ids)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn chunked_yields_fixed_size_windows_with_shifted_targets() {
        let ids: Vec<u32> = (0..10).collect();
        let dataset = TextDataset::chunked(&ids, 4, 4);

        assert_eq!(dataset.len(), 2);
        let first = dataset.get(0).unwrap();
        assert_eq!(first.input_ids, vec![0, 1, 2, 3]);
        assert_eq!(first.target_ids, vec![1, 2, 3, 4]);
        let second = dataset.get(1).unwrap();
        assert_eq!(second.input_ids, vec![4, 5, 6, 7]);
        assert_eq!(second.target_ids, vec![5, 6, 7, 8]);
    }

    #[test]
    fn chunked_is_empty_when_corpus_is_shorter_than_a_block() {
        let ids: Vec<u32> = (0..3).collect();
        assert_eq!(TextDataset::chunked(&ids, 4, 4).len(), 0);
    }

    #[test]
    fn line_by_line_yields_one_example_per_non_empty_line() {
        let tokenizer = GptTokenizer::r50k().unwrap();
        let text = "the first line\n\n   \nthe second line goes on\nthird\n";
        let dataset = TextDataset::line_by_line(text, &tokenizer, 16);
        assert_eq!(dataset.len(), 3);

        let first = dataset.get(0).unwrap();
        assert_eq!(first.input_ids.len(), first.target_ids.len());
        // next-token shift within the line
        let full = tokenizer.encode("the first line");
        assert_eq!(first.input_ids, full[..full.len() - 1].to_vec());
        assert_eq!(first.target_ids, full[1..].to_vec());
    }

    #[test]
    fn line_by_line_truncates_to_the_block_size() {
        let tokenizer = GptTokenizer::r50k().unwrap();
        let text = "one two three four five six seven eight nine ten\n";
        let dataset = TextDataset::line_by_line(text, &tokenizer, 4);
        assert_eq!(dataset.get(0).unwrap().input_ids.len(), 4);
    }

    #[test]
    fn from_config_caches_the_token_stream() {
        let dir = tempfile::tempdir().unwrap();
        let data_file = dir.path().join("train.txt");
        fs::write(&data_file, "a small corpus for the cache test, repeated a few times over")
            .unwrap();

        let tokenizer = GptTokenizer::r50k().unwrap();
        let args = DataArgs {
            train_data_file: data_file.clone(),
            block_size: 4,
            ..DataArgs::default()
        };

        let first = TextDataset::from_config(&args, &tokenizer, Split::Train).unwrap();
        let cache = cache_path_for(&data_file, args.block_size);
        assert!(cache.is_file());

        // second pass reads the cache and sees the same examples
        let second = TextDataset::from_config(&args, &tokenizer, Split::Train).unwrap();
        assert_eq!(first.len(), second.len());

        // overwrite_cache regenerates the file
        let args = DataArgs {
            overwrite_cache: true,
            ..args
        };
        let third = TextDataset::from_config(&args, &tokenizer, Split::Train).unwrap();
        assert_eq!(first.len(), third.len());
    }

    #[test]
    fn from_config_dispatches_on_the_line_by_line_flag() {
        let dir = tempfile::tempdir().unwrap();
        let data_file = dir.path().join("eval.txt");
        fs::write(&data_file, "first line of text\nsecond line of text\n\nlast one\n").unwrap();

        let tokenizer = GptTokenizer::r50k().unwrap();
        let args = DataArgs {
            eval_data_file: data_file,
            line_by_line: true,
            block_size: 8,
            ..DataArgs::default()
        };

        let dataset = TextDataset::from_config(&args, &tokenizer, Split::Eval).unwrap();
        assert_eq!(dataset.len(), 3);

        let args = DataArgs {
            line_by_line: false,
            ..args
        };
        let dataset = TextDataset::from_config(&args, &tokenizer, Split::Eval).unwrap();
        for index in 0..dataset.len() {
            assert_eq!(dataset.get(index).unwrap().input_ids.len(), args.block_size);
        }
    }

    #[test]
    fn missing_file_is_an_error() {
        let tokenizer = GptTokenizer::r50k().unwrap();
        let args = DataArgs {
            train_data_file: PathBuf::from("/nonexistent/train.txt"),
            ..DataArgs::default()
        };
        assert!(TextDataset::from_config(&args, &tokenizer, Split::Train).is_err());
    }
}
