use anyhow::{bail, Result};
use burn::data::dataloader::batcher::Batcher;
use burn::prelude::{Backend, Int};
use burn::tensor::{Tensor, TensorData};
use rand::Rng;

use super::dataset::LmExample;
use crate::config::DataArgs;
use crate::tokenizer::{GptTokenizer, MASK_TOKEN};

#[derive(Clone, Debug)]
pub struct LmBatch<B: Backend> {
    pub inputs: Tensor<B, 2, Int>,  // [batch_size, seq_len]
    pub targets: Tensor<B, 2, Int>, // [batch_size, seq_len]
    /// Targets holding this id are excluded from the loss.
    pub pad_id: u32,
}

#[derive(Clone, Copy, Debug)]
struct Masking {
    mask_id: u32,
    probability: f64,
}

/// Pads examples to the batch maximum and stacks them into int tensors.
/// In masked-LM mode, selected input positions are replaced by the mask
/// token and every unselected target is ignored.
#[derive(Clone, Debug)]
pub struct LmCollator {
    pad_id: u32,
    masking: Option<Masking>,
}

impl LmCollator {
    pub fn causal(pad_id: u32) -> Self {
        Self {
            pad_id,
            masking: None,
        }
    }

    pub fn masked(pad_id: u32, mask_id: u32, probability: f64) -> Self {
        Self {
            pad_id,
            masking: Some(Masking {
                mask_id,
                probability,
            }),
        }
    }

    /// Builds the collator the data configuration asks for. Masked-LM
    /// collation needs a mask token, which the GPT-2 vocabulary does not
    /// carry unless one was added.
    pub fn from_config(args: &DataArgs, tokenizer: &GptTokenizer) -> Result<Self> {
        if !args.mlm {
            return Ok(Self::causal(tokenizer.eot_id()));
        }
        match tokenizer.special_id(MASK_TOKEN) {
            Some(mask_id) => Ok(Self::masked(
                tokenizer.eot_id(),
                mask_id,
                args.mlm_probability,
            )),
            None => bail!(
                "masked-LM collation requires a {MASK_TOKEN} token in the tokenizer vocabulary"
            ),
        }
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    fn corrupt(&self, masking: Masking, input_ids: &mut [u32], target_ids: &mut Vec<u32>) {
        let mut rng = rand::rng();
        *target_ids = vec![self.pad_id; input_ids.len()];
        for (input, target) in input_ids.iter_mut().zip(target_ids.iter_mut()) {
            if rng.random::<f64>() < masking.probability {
                *target = *input;
                *input = masking.mask_id;
            }
        }
    }
}

impl<B: Backend> Batcher<B, LmExample, LmBatch<B>> for LmCollator {
    fn batch(&self, items: Vec<LmExample>, device: &B::Device) -> LmBatch<B> {
        let max_len = items
            .iter()
            .map(|item| item.input_ids.len())
            .max()
            .unwrap_or(0)
            .max(1);

        let mut inputs = Vec::with_capacity(items.len());
        let mut targets = Vec::with_capacity(items.len());
        for item in items {
            let mut input_ids = item.input_ids;
            let mut target_ids = item.target_ids;
            if let Some(masking) = self.masking {
                self.corrupt(masking, &mut input_ids, &mut target_ids);
            }
            input_ids.resize(max_len, self.pad_id);
            target_ids.resize(max_len, self.pad_id);

            inputs.push(Tensor::<B, 1, Int>::from_data(
                TensorData::new(input_ids, vec![max_len]),
                device,
            ));
            targets.push(Tensor::<B, 1, Int>::from_data(
                TensorData::new(target_ids, vec![max_len]),
                device,
            ));
        }

        LmBatch {
            inputs: Tensor::stack::<2>(inputs, 0),
            targets: Tensor::stack::<2>(targets, 0),
            pad_id: self.pad_id,
        }
    }
}
