use std::fs;

use anyhow::{Context, Result};
use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::optim::AdamWConfig;
use burn::prelude::*;
use burn::record::CompactRecorder;
use burn::tensor::backend::AutodiffBackend;
use burn::train::metric::{AccuracyMetric, LossMetric};
use burn::train::{ClassificationOutput, LearnerBuilder, TrainOutput, TrainStep, ValidStep};

use crate::config::TrainingArgs;
use crate::data::batcher::{LmBatch, LmCollator};
use crate::data::dataset::TextDataset;
use crate::model::gpt2::{Gpt2, Gpt2Config};
use crate::tokenizer::GptTokenizer;

#[derive(Clone, Copy, Debug)]
pub struct TrainReport {
    pub training_loss: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct EvalReport {
    pub eval_loss: f64,
}

/// Capability seam over the external training framework. The orchestration
/// driver only ever talks to this, so it can run against a stub.
pub trait LmTrainer {
    fn train(&mut self) -> Result<TrainReport>;
    fn evaluate(&mut self) -> Result<EvalReport>;
    /// Persists model artifacts (and the tokenizer on the primary process).
    fn save(&self) -> Result<()>;
}

impl<B: Backend> Gpt2<B> {
    pub fn forward_classification(
        &self,
        inputs: Tensor<B, 2, Int>,
        targets: Tensor<B, 2, Int>,
        pad_id: u32,
    ) -> ClassificationOutput<B> {
        let logits: Tensor<B, 3> = self.forward(inputs);
        let logits_flat: Tensor<B, 2> = logits.flatten(0, 1);
        let targets_flat: Tensor<B, 1, Int> = targets.flatten(0, 1);

        let loss = CrossEntropyLossConfig::new()
            .with_pad_tokens(Some(vec![pad_id as usize]))
            .init(&targets_flat.device())
            .forward(logits_flat.clone(), targets_flat.clone());

        ClassificationOutput::new(loss, logits_flat, targets_flat)
    }
}

impl<B: AutodiffBackend> TrainStep<LmBatch<B>, ClassificationOutput<B>> for Gpt2<B> {
    fn step(&self, batch: LmBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification(batch.inputs, batch.targets, batch.pad_id);
        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<LmBatch<B>, ClassificationOutput<B>> for Gpt2<B> {
    fn step(&self, batch: LmBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch.inputs, batch.targets, batch.pad_id)
    }
}

/// Production [`LmTrainer`]: hands model, datasets, and collator to burn's
/// `Learner`, which owns batching, gradient accumulation, optimizer steps,
/// per-epoch validation, and file checkpointing.
pub struct LearnerTrainer<B: AutodiffBackend> {
    model: Option<Gpt2<B>>,
    model_config: Gpt2Config,
    tokenizer: GptTokenizer,
    args: TrainingArgs,
    collator: LmCollator,
    train_dataset: Option<TextDataset>,
    eval_dataset: Option<TextDataset>,
    device: B::Device,
}

impl<B: AutodiffBackend> LearnerTrainer<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: Gpt2<B>,
        model_config: Gpt2Config,
        tokenizer: GptTokenizer,
        args: TrainingArgs,
        collator: LmCollator,
        train_dataset: Option<TextDataset>,
        eval_dataset: Option<TextDataset>,
        device: B::Device,
    ) -> Self {
        Self {
            model: Some(model),
            model_config,
            tokenizer,
            args,
            collator,
            train_dataset,
            eval_dataset,
            device,
        }
    }
}

impl<B: AutodiffBackend> LmTrainer for LearnerTrainer<B> {
    fn train(&mut self) -> Result<TrainReport> {
        let train_dataset = self
            .train_dataset
            .clone()
            .context("training requires a train dataset")?;
        let valid_dataset = self.eval_dataset.clone().unwrap_or_default();
        let model = self.model.take().context("trainer holds no model")?;

        let optimizer = AdamWConfig::new()
            .with_epsilon(self.args.adam_epsilon)
            .with_weight_decay(self.args.weight_decay)
            .with_grad_clipping(Some(GradientClippingConfig::Norm(self.args.max_grad_norm)));

        let train_loader = DataLoaderBuilder::new(self.collator.clone())
            .batch_size(self.args.per_device_train_batch_size)
            .shuffle(self.args.seed)
            .num_workers(self.args.num_workers)
            .build(train_dataset.clone());
        let valid_loader = DataLoaderBuilder::new(self.collator.clone())
            .batch_size(self.args.per_device_eval_batch_size)
            .num_workers(self.args.num_workers)
            .build(valid_dataset);

        let artifact_dir = self.args.output_dir.join("trainer");
        let mut builder = LearnerBuilder::new(&*artifact_dir.to_string_lossy())
            .metric_train_numeric(LossMetric::new())
            .metric_valid_numeric(LossMetric::new())
            .metric_train_numeric(AccuracyMetric::new())
            .metric_valid_numeric(AccuracyMetric::new())
            .with_file_checkpointer(CompactRecorder::new())
            .devices(vec![self.device.clone()])
            .num_epochs(self.args.num_train_epochs)
            .summary();
        if self.args.gradient_accumulation_steps > 1 {
            builder = builder.grads_accumulation(self.args.gradient_accumulation_steps);
        }
        let learner = builder.build(model, optimizer.init(), self.args.learning_rate);

        let trained = learner.fit(train_loader, valid_loader);

        // burn's fit returns only the tuned model; report its loss over the
        // train split as the run's training loss
        let report_loader = DataLoaderBuilder::new(self.collator.clone())
            .batch_size(self.args.per_device_eval_batch_size)
            .num_workers(self.args.num_workers)
            .build(train_dataset);
        let training_loss = mean_loss(&trained.valid(), report_loader.as_ref());

        self.model = Some(trained);
        Ok(TrainReport { training_loss })
    }

    fn evaluate(&mut self) -> Result<EvalReport> {
        let model = self.model.as_ref().context("trainer holds no model")?;
        let eval_dataset = self
            .eval_dataset
            .clone()
            .context("evaluation requires an eval dataset")?;

        let loader = DataLoaderBuilder::new(self.collator.clone())
            .batch_size(self.args.per_device_eval_batch_size)
            .num_workers(self.args.num_workers)
            .build(eval_dataset);
        let eval_loss = mean_loss(&model.valid(), loader.as_ref());
        Ok(EvalReport { eval_loss })
    }

    fn save(&self) -> Result<()> {
        let model = self.model.as_ref().context("trainer holds no model to save")?;
        let output_dir = &self.args.output_dir;
        fs::create_dir_all(output_dir)
            .with_context(|| format!("cannot create {}", output_dir.display()))?;

        model
            .clone()
            .save_file(output_dir.join("model"), &CompactRecorder::new())
            .with_context(|| format!("cannot save model weights to {}", output_dir.display()))?;
        self.model_config
            .save(output_dir.join("config.json"))
            .context("cannot save model config")?;

        if self.args.local_rank <= 0 {
            self.tokenizer.save(output_dir)?;
        }

        tracing::info!("saved model artifacts to {}", output_dir.display());
        Ok(())
    }
}

/// Mean cross-entropy loss of `model` over every batch in `loader`.
fn mean_loss<B: Backend>(model: &Gpt2<B>, loader: &dyn DataLoader<B, LmBatch<B>>) -> f64 {
    let mut loss_sum = 0.0;
    let mut batches = 0usize;
    for batch in loader.iter() {
        let output = model.forward_classification(batch.inputs, batch.targets, batch.pad_id);
        loss_sum += output.loss.into_scalar().elem::<f64>();
        batches += 1;
    }
    if batches > 0 {
        loss_sum / batches as f64
    } else {
        f64::NAN
    }
}
