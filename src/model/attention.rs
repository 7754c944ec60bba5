use burn::module::Module;
use burn::nn::attention::{
    generate_autoregressive_mask, MhaInput, MultiHeadAttention, MultiHeadAttentionConfig,
};
use burn::prelude::*;

/// Multi-head self-attention restricted to past positions.
#[derive(Module, Debug)]
pub struct CausalSelfAttention<B: Backend> {
    mha: MultiHeadAttention<B>,
}

impl<B: Backend> CausalSelfAttention<B> {
    pub fn new(embedding_dim: usize, n_heads: usize, drop_rate: f64, device: &B::Device) -> Self {
        let mha = MultiHeadAttentionConfig::new(embedding_dim, n_heads)
            .with_dropout(drop_rate)
            .init(device);
        Self { mha }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch_size, seq_len, _] = x.dims();
        let mask = generate_autoregressive_mask::<B>(batch_size, seq_len, &x.device());
        self.mha
            .forward(MhaInput::self_attn(x).mask_attn(mask))
            .context
    }
}
