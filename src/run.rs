use std::collections::BTreeMap;
use std::fs;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::config::{DataArgs, ModelArgs, TrainingArgs};
use crate::data::batcher::LmCollator;
use crate::data::dataset::{Split, TextDataset};
use crate::metrics::MetricsSink;
use crate::pretrained;
use crate::tokenizer::SEP_TOKEN;
use crate::train::{LearnerTrainer, LmTrainer};

pub const EVAL_RESULTS_FILE: &str = "eval_results_lm.txt";

/// Process-level settings, fixed explicitly at startup instead of living in
/// mutated globals.
#[derive(Clone, Copy, Debug)]
pub struct RunEnvironment {
    pub seed: u64,
    pub local_rank: i32,
    pub fp16: bool,
}

impl RunEnvironment {
    pub fn from_args(args: &TrainingArgs) -> Self {
        Self {
            seed: args.seed,
            local_rank: args.local_rank,
            fp16: args.fp16,
        }
    }

    /// Rank 0 (or a non-distributed run) owns shared artifacts like the
    /// tokenizer files.
    pub fn is_main_process(&self) -> bool {
        self.local_rank <= 0
    }

    pub fn is_distributed(&self) -> bool {
        self.local_rank != -1
    }

    /// Default `tracing` directive: chatty on the main process, quiet on the
    /// others.
    pub fn log_directive(&self) -> String {
        let level = if self.is_main_process() { "info" } else { "warn" };
        format!("gpt2_finetune={level}")
    }
}

/// Wires the whole pipeline (seed, pretrained triple, separator token and
/// embedding resize, datasets, collator, trainer) and defers to [`execute`].
/// Any failure aborts the run; nothing is retried.
pub fn run<B: AutodiffBackend>(
    env: &RunEnvironment,
    model_args: &ModelArgs,
    data_args: &DataArgs,
    training_args: &TrainingArgs,
    device: &B::Device,
    sink: &mut dyn MetricsSink,
) -> Result<BTreeMap<String, f64>> {
    model_args.validate()?;
    data_args.validate()?;
    training_args.validate()?;

    tracing::warn!(
        "process rank: {}, device: {:?}, distributed training: {}, 16-bit training: {}",
        env.local_rank,
        device,
        env.is_distributed(),
        env.fp16,
    );
    tracing::info!("training/evaluation parameters: {training_args:?}");

    B::seed(env.seed);

    let output_dir = &training_args.output_dir;
    if output_dir.is_dir()
        && fs::read_dir(output_dir)?.next().is_some()
        && !training_args.overwrite_output_dir
    {
        bail!(
            "output directory {} exists and is not empty; set overwrite_output_dir to reuse it",
            output_dir.display()
        );
    }
    fs::create_dir_all(output_dir)
        .with_context(|| format!("cannot create {}", output_dir.display()))?;

    let (model_config, mut tokenizer, model) = pretrained::load::<B>(model_args, device)?;

    // the separator must be in place before any tokenization or training,
    // since both depend on the final vocabulary size
    let sep_id = tokenizer.add_special_token(SEP_TOKEN);
    let model = model.resize_token_embeddings(tokenizer.vocab_size(), device);
    let model_config = model_config.with_vocab_size(tokenizer.vocab_size());
    tracing::info!(
        "separator token {SEP_TOKEN} has id {sep_id}; vocabulary size is now {}",
        tokenizer.vocab_size()
    );

    let data_args = data_args.clone().cap_block_size(model_config.context_length);

    let train_dataset = if training_args.do_train {
        Some(TextDataset::from_config(&data_args, &tokenizer, Split::Train)?)
    } else {
        None
    };
    let eval_dataset = if training_args.do_eval {
        Some(TextDataset::from_config(&data_args, &tokenizer, Split::Eval)?)
    } else {
        None
    };

    let collator = LmCollator::from_config(&data_args, &tokenizer)?;

    let mut trainer = LearnerTrainer::<B>::new(
        model,
        model_config,
        tokenizer,
        training_args.clone(),
        collator,
        train_dataset,
        eval_dataset,
        device.clone(),
    );

    execute(&mut trainer, training_args, sink)
}

/// Drives a configured trainer through the `do_train`/`do_eval` sequence and
/// reports the results. Wall-clock time is measured strictly around the
/// training call; saving and evaluation are excluded.
pub fn execute(
    trainer: &mut dyn LmTrainer,
    args: &TrainingArgs,
    sink: &mut dyn MetricsSink,
) -> Result<BTreeMap<String, f64>> {
    let mut training_loss = None;
    let mut train_hours = None;

    if args.do_train {
        let start = Instant::now();
        let report = trainer.train()?;
        let elapsed = start.elapsed();

        trainer.save()?;

        let hours = elapsed.as_secs_f64() / 3600.0;
        tracing::info!("training took {hours} hours");
        training_loss = Some(report.training_loss);
        train_hours = Some(hours);
    }

    let mut eval_results = BTreeMap::new();
    if args.do_eval {
        tracing::info!("*** evaluate ***");
        let report = trainer.evaluate()?;
        let perplexity = report.eval_loss.exp();
        if !perplexity.is_finite() {
            tracing::warn!(
                "perplexity is not finite (eval loss {}); reporting it unchanged",
                report.eval_loss
            );
        }
        eval_results.insert("eval_loss".to_string(), report.eval_loss);
        eval_results.insert("perplexity".to_string(), perplexity);
        write_eval_results(&args.output_dir.join(EVAL_RESULTS_FILE), &eval_results)?;
    }

    // one report per call, in the order the metrics were produced
    if let Some(loss) = training_loss {
        sink.log_scalar("train_loss", loss)?;
    }
    if let Some(loss) = eval_results.get("eval_loss").copied() {
        sink.log_scalar("eval_loss", loss)?;
    }
    if !eval_results.is_empty() {
        sink.log_metrics(&eval_results)?;
    }
    if let Some(hours) = train_hours {
        sink.log_scalar("train_time", hours)?;
    }

    let mut results = eval_results;
    if let Some(loss) = training_loss {
        results.insert("train_loss".to_string(), loss);
    }
    if let Some(hours) = train_hours {
        results.insert("train_time".to_string(), hours);
    }
    Ok(results)
}

/// Writes `key = value` lines, keys ascending, replacing any previous file.
pub fn write_eval_results(path: &Path, results: &BTreeMap<String, f64>) -> Result<()> {
    let mut writer =
        File::create(path).with_context(|| format!("cannot write {}", path.display()))?;
    tracing::info!("***** eval results *****");
    for (key, value) in results {
        tracing::info!("  {key} = {value}");
        writeln!(writer, "{key} = {value}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainingArgs;

    #[test]
    fn main_process_detection_follows_local_rank() {
        let mut args = TrainingArgs::default();
        let env = RunEnvironment::from_args(&args);
        assert!(env.is_main_process());
        assert!(!env.is_distributed());

        args.local_rank = 0;
        let env = RunEnvironment::from_args(&args);
        assert!(env.is_main_process());
        assert!(env.is_distributed());

        args.local_rank = 3;
        let env = RunEnvironment::from_args(&args);
        assert!(!env.is_main_process());
        assert_eq!(env.log_directive(), "gpt2_finetune=warn");
    }

    #[test]
    fn eval_results_are_written_sorted_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(EVAL_RESULTS_FILE);

        // insertion order deliberately reversed
        let mut results = BTreeMap::new();
        results.insert("perplexity".to_string(), 12.5);
        results.insert("eval_loss".to_string(), 2.52);
        write_eval_results(&path, &results).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines[0], "eval_loss = 2.52");
        assert_eq!(lines[1], "perplexity = 12.5");
    }

    #[test]
    fn rewriting_replaces_the_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(EVAL_RESULTS_FILE);

        let mut results = BTreeMap::new();
        results.insert("perplexity".to_string(), 100.0);
        results.insert("stale_key".to_string(), 1.0);
        write_eval_results(&path, &results).unwrap();

        let mut results = BTreeMap::new();
        results.insert("perplexity".to_string(), 10.0);
        write_eval_results(&path, &results).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw, "perplexity = 10\n");
    }
}
