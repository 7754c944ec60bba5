use std::path::PathBuf;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

/// Which pretrained checkpoint to start from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelArgs {
    /// Registry name (`gpt2`, `gpt2-medium`, ...) or a directory holding
    /// previously saved artifacts.
    pub model_name_or_path: String,
    pub model_type: String,
    /// Overrides the tokenizer implied by the model name.
    pub tokenizer_name: Option<String>,
    /// Where imported checkpoints live. `None` uses the crate default.
    pub cache_dir: Option<PathBuf>,
}

impl Default for ModelArgs {
    fn default() -> Self {
        Self {
            model_name_or_path: "gpt2".to_string(),
            model_type: "gpt2".to_string(),
            tokenizer_name: None,
            cache_dir: None,
        }
    }
}

impl ModelArgs {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.model_type == "gpt2",
            "unsupported model type '{}': only the gpt2 family is registered",
            self.model_type
        );
        ensure!(
            !self.model_name_or_path.is_empty(),
            "model_name_or_path must not be empty"
        );
        Ok(())
    }
}

/// Corpus locations and how they are turned into examples.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataArgs {
    pub train_data_file: PathBuf,
    pub eval_data_file: PathBuf,
    /// One example per non-empty line instead of contiguous token windows.
    pub line_by_line: bool,
    /// Masked-LM collation. Requires a tokenizer with a mask token.
    pub mlm: bool,
    pub mlm_probability: f64,
    /// Tokens per example window.
    pub block_size: usize,
    pub overwrite_cache: bool,
}

impl Default for DataArgs {
    fn default() -> Self {
        Self {
            train_data_file: PathBuf::from("/data/train.txt"),
            eval_data_file: PathBuf::from("/data/eval.txt"),
            line_by_line: false,
            mlm: false,
            mlm_probability: 0.15,
            block_size: 512,
            overwrite_cache: false,
        }
    }
}

impl DataArgs {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.block_size > 0, "block_size must be positive");
        ensure!(
            (0.0..=1.0).contains(&self.mlm_probability),
            "mlm_probability must lie in [0, 1], got {}",
            self.mlm_probability
        );
        Ok(())
    }

    /// The block size can never exceed what the model's positional table covers.
    pub fn cap_block_size(mut self, context_length: usize) -> Self {
        self.block_size = self.block_size.min(context_length);
        self
    }
}

/// Hyperparameters owned by the trainer for the whole run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainingArgs {
    pub output_dir: PathBuf,
    pub overwrite_output_dir: bool,
    pub do_train: bool,
    pub do_eval: bool,
    pub per_device_train_batch_size: usize,
    pub per_device_eval_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub learning_rate: f64,
    pub weight_decay: f32,
    pub adam_epsilon: f32,
    pub max_grad_norm: f32,
    pub num_train_epochs: usize,
    pub num_workers: usize,
    pub seed: u64,
    /// Logged at startup; precision is a compile-time backend choice.
    pub fp16: bool,
    /// `-1` outside distributed runs; rank 0 is the primary process.
    pub local_rank: i32,
}

impl Default for TrainingArgs {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("/gpt2"),
            overwrite_output_dir: true,
            do_train: true,
            do_eval: true,
            per_device_train_batch_size: 1,
            per_device_eval_batch_size: 1,
            gradient_accumulation_steps: 1,
            learning_rate: 5.0e-5,
            weight_decay: 0.0,
            adam_epsilon: 1.0e-8,
            max_grad_norm: 1.0,
            num_train_epochs: 5,
            num_workers: 1,
            seed: 42,
            fp16: false,
            local_rank: -1,
        }
    }
}

impl TrainingArgs {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.per_device_train_batch_size > 0 && self.per_device_eval_batch_size > 0,
            "batch sizes must be positive"
        );
        ensure!(
            self.gradient_accumulation_steps > 0,
            "gradient_accumulation_steps must be positive"
        );
        ensure!(self.num_train_epochs > 0, "num_train_epochs must be positive");
        ensure!(
            self.learning_rate.is_finite() && self.learning_rate > 0.0,
            "learning_rate must be a positive finite number"
        );
        ensure!(self.max_grad_norm >= 0.0, "max_grad_norm must not be negative");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ModelArgs::default().validate().unwrap();
        DataArgs::default().validate().unwrap();
        TrainingArgs::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_block_size() {
        let args = DataArgs {
            block_size: 0,
            ..DataArgs::default()
        };
        assert!(args.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_mask_probability() {
        let args = DataArgs {
            mlm_probability: 1.5,
            ..DataArgs::default()
        };
        assert!(args.validate().is_err());
    }

    #[test]
    fn rejects_zero_batch_size() {
        let args = TrainingArgs {
            per_device_train_batch_size: 0,
            ..TrainingArgs::default()
        };
        assert!(args.validate().is_err());
    }

    #[test]
    fn rejects_unknown_model_type() {
        let args = ModelArgs {
            model_type: "bert".to_string(),
            ..ModelArgs::default()
        };
        assert!(args.validate().is_err());
    }

    #[test]
    fn caps_block_size_to_context() {
        let args = DataArgs::default().cap_block_size(256);
        assert_eq!(args.block_size, 256);
        let args = DataArgs::default().cap_block_size(2048);
        assert_eq!(args.block_size, 512);
    }
}
