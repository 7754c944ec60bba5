use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use burn::prelude::*;
use burn::record::{CompactRecorder, FullPrecisionSettings, Recorder};
use burn_import::safetensors::{LoadArgs, SafetensorsFileRecorder};

use crate::config::ModelArgs;
use crate::model::gpt2::{Gpt2, Gpt2Config, Gpt2Record};
use crate::tokenizer::GptTokenizer;

const DEFAULT_CACHE_DIR: &str = ".cache/gpt2-finetune";

/// Maps a registry name to its architecture.
pub fn resolve(name: &str) -> Result<Gpt2Config> {
    let config = match name {
        "gpt2" => Gpt2Config::new(),
        "gpt2-medium" => Gpt2Config::new()
            .with_embedding_dim(1024)
            .with_n_heads(16)
            .with_n_layers(24),
        "gpt2-large" => Gpt2Config::new()
            .with_embedding_dim(1280)
            .with_n_heads(20)
            .with_n_layers(36),
        "gpt2-xl" => Gpt2Config::new()
            .with_embedding_dim(1600)
            .with_n_heads(25)
            .with_n_layers(48),
        _ => bail!("unknown model name: {name}"),
    };
    Ok(config)
}

/// Resolves `model_name_or_path` to a (config, tokenizer, model) triple.
///
/// A directory path reloads artifacts this crate saved earlier (config.json,
/// CompactRecorder weights, tokenizer.json). A registry name initializes the
/// architecture and imports weights from `{cache_dir}/{name}.safetensors`,
/// expecting a checkpoint converted to this crate's module layout; top-level
/// tensors may keep their upstream names, which are remapped here. Missing or
/// malformed checkpoints are hard errors, never retried.
pub fn load<B: Backend>(
    args: &ModelArgs,
    device: &B::Device,
) -> Result<(Gpt2Config, GptTokenizer, Gpt2<B>)> {
    let path = Path::new(&args.model_name_or_path);
    if path.is_dir() {
        return load_from_dir(args, path, device);
    }

    let config = resolve(&args.model_name_or_path)?;
    let tokenizer = GptTokenizer::from_name(args.tokenizer_name.as_deref())?;

    let weights = weights_path(args);
    if !weights.is_file() {
        bail!(
            "no cached weights for '{}' at {}; place the converted checkpoint there first",
            args.model_name_or_path,
            weights.display()
        );
    }

    let load_args = LoadArgs::new(weights.clone())
        .with_key_remap(r"^wte\.(.+)$", "token_embedding.$1")
        .with_key_remap(r"^wpe\.(.+)$", "positional_embedding.$1")
        .with_key_remap(r"^h\.([0-9]+)\.(.+)$", "transformer_blocks.$1.$2")
        .with_key_remap(r"^ln_f\.(.+)$", "norm.$1")
        .with_key_remap(r"^lm_head\.(.+)$", "linear_out.$1");
    let record: Gpt2Record<B> = SafetensorsFileRecorder::<FullPrecisionSettings>::default()
        .load(load_args, device)
        .with_context(|| format!("cannot import weights from {}", weights.display()))?;
    let model = config.init(device).load_record(record);

    tracing::info!(
        "loaded pretrained {} from {}",
        args.model_name_or_path,
        weights.display()
    );
    Ok((config, tokenizer, model))
}

fn load_from_dir<B: Backend>(
    args: &ModelArgs,
    dir: &Path,
    device: &B::Device,
) -> Result<(Gpt2Config, GptTokenizer, Gpt2<B>)> {
    let config_path = dir.join("config.json");
    let config = Gpt2Config::load(&config_path)
        .map_err(|err| anyhow!("cannot load model config from {}: {err}", config_path.display()))?;

    let tokenizer = if GptTokenizer::saved_in(dir) {
        GptTokenizer::load(dir)?
    } else {
        GptTokenizer::from_name(args.tokenizer_name.as_deref())?
    };

    let record = CompactRecorder::new()
        .load(dir.join("model"), device)
        .with_context(|| format!("cannot load model weights from {}", dir.display()))?;
    let model = config.init(device).load_record(record);

    tracing::info!("loaded model artifacts from {}", dir.display());
    Ok((config, tokenizer, model))
}

fn weights_path(args: &ModelArgs) -> PathBuf {
    args.cache_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR))
        .join(format!("{}.safetensors", args.model_name_or_path))
}
