use burn::config::Config;
use burn::module::{Module, Param};
use burn::nn;
use burn::prelude::*;
use burn::tensor::Distribution;

use super::attention::CausalSelfAttention;

#[derive(Config)]
pub struct Gpt2Config {
    #[config(default = 50257)]
    pub vocab_size: usize,
    #[config(default = 1024)]
    pub context_length: usize,
    #[config(default = 768)]
    pub embedding_dim: usize,
    #[config(default = 12)]
    pub n_heads: usize,
    #[config(default = 12)]
    pub n_layers: usize,
    #[config(default = 0.1)]
    pub embedding_drop_rate: f64,
    #[config(default = 0.1)]
    pub attention_drop_rate: f64,
    #[config(default = 0.1)]
    pub shortcut_drop_rate: f64,
}

impl Gpt2Config {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Gpt2<B> {
        let token_embedding =
            nn::EmbeddingConfig::new(self.vocab_size, self.embedding_dim).init(device);
        let positional_embedding =
            nn::EmbeddingConfig::new(self.context_length, self.embedding_dim).init(device);
        let dropout_embedding = nn::DropoutConfig::new(self.embedding_drop_rate).init();

        let transformer_blocks = (0..self.n_layers)
            .map(|_| {
                TransformerBlock::new(
                    self.embedding_dim,
                    self.n_heads,
                    self.attention_drop_rate,
                    self.shortcut_drop_rate,
                    device,
                )
            })
            .collect();

        let norm = nn::LayerNormConfig::new(self.embedding_dim).init(device);
        let linear_out = nn::LinearConfig::new(self.embedding_dim, self.vocab_size)
            .with_bias(false)
            .init(device);

        Gpt2 {
            token_embedding,
            positional_embedding,
            dropout_embedding,
            transformer_blocks,
            norm,
            linear_out,
        }
    }
}

#[derive(Module, Debug)]
pub struct Gpt2<B: Backend> {
    token_embedding: nn::Embedding<B>,
    positional_embedding: nn::Embedding<B>,
    dropout_embedding: nn::Dropout,
    transformer_blocks: Vec<TransformerBlock<B>>,
    norm: nn::LayerNorm<B>,
    linear_out: nn::Linear<B>,
}

impl<B: Backend> Gpt2<B> {
    /// in_idx is a tensor of shape [BatchSize, SeqLen]
    pub fn forward(&self, in_idx: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let [batch_size, seq_len] = in_idx.dims();
        let device = &in_idx.device();

        let token_embeddings = self.token_embedding.forward(in_idx);
        let positions = Tensor::arange(0..seq_len as i64, device)
            .unsqueeze::<2>()
            .expand([batch_size, seq_len]);
        let positional_embeddings = self.positional_embedding.forward(positions);

        let mut x = self.dropout_embedding.forward(token_embeddings + positional_embeddings);
        for block in &self.transformer_blocks {
            x = block.forward(x);
        }

        self.linear_out.forward(self.norm.forward(x))
    }

    /// Rows the token embedding table currently holds.
    pub fn vocab_size(&self) -> usize {
        self.token_embedding.weight.val().dims()[0]
    }

    /// Grows (or shrinks) the token embedding table and the output
    /// projection to `new_vocab_size`, keeping every pretrained row and
    /// random-initializing the remainder. Must run before ids past the old
    /// vocabulary reach `forward`.
    pub fn resize_token_embeddings(mut self, new_vocab_size: usize, device: &B::Device) -> Self {
        let old_weight = self.token_embedding.weight.val();
        let [old_vocab, dim] = old_weight.dims();
        if new_vocab_size == old_vocab {
            return self;
        }
        let kept = old_vocab.min(new_vocab_size);

        let weight = Tensor::random(
            [new_vocab_size, dim],
            Distribution::Normal(0.0, 0.02),
            device,
        )
        .slice_assign([0..kept, 0..dim], old_weight.slice([0..kept, 0..dim]));
        self.token_embedding.weight = Param::from_tensor(weight);

        let old_out = self.linear_out.weight.val();
        let [d_in, _] = old_out.dims();
        let out = Tensor::random(
            [d_in, new_vocab_size],
            Distribution::Normal(0.0, 0.02),
            device,
        )
        .slice_assign([0..d_in, 0..kept], old_out.slice([0..d_in, 0..kept]));
        self.linear_out.weight = Param::from_tensor(out);

        self
    }
}

#[derive(Module, Debug)]
struct TransformerBlock<B: Backend> {
    norm1: nn::LayerNorm<B>,
    attn: CausalSelfAttention<B>,
    norm2: nn::LayerNorm<B>,
    ff: FeedForward<B>,
    dropout: nn::Dropout,
}

impl<B: Backend> TransformerBlock<B> {
    fn new(
        embedding_dim: usize,
        n_heads: usize,
        attention_drop_rate: f64,
        shortcut_drop_rate: f64,
        device: &B::Device,
    ) -> Self {
        Self {
            norm1: nn::LayerNormConfig::new(embedding_dim).init(device),
            attn: CausalSelfAttention::new(embedding_dim, n_heads, attention_drop_rate, device),
            norm2: nn::LayerNormConfig::new(embedding_dim).init(device),
            ff: FeedForward::new(embedding_dim, device),
            dropout: nn::DropoutConfig::new(shortcut_drop_rate).init(),
        }
    }

    fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let shortcut = x.clone();
        let x = self.norm1.forward(x);
        let x = self.attn.forward(x);
        let x = self.dropout.forward(x) + shortcut;

        let shortcut = x.clone();
        let out = self.ff.forward(self.norm2.forward(x));
        self.dropout.forward(out) + shortcut
    }
}

#[derive(Module, Debug)]
struct FeedForward<B: Backend> {
    pre: nn::Linear<B>,
    post: nn::Linear<B>,
}

impl<B: Backend> FeedForward<B> {
    fn new(embedding_dim: usize, device: &B::Device) -> Self {
        Self {
            pre: nn::LinearConfig::new(embedding_dim, 4 * embedding_dim).init(device),
            post: nn::LinearConfig::new(4 * embedding_dim, embedding_dim).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.post
            .forward(burn::tensor::activation::gelu(self.pre.forward(x)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = burn::backend::Candle;

    fn tiny_config() -> Gpt2Config {
        Gpt2Config::new()
            .with_vocab_size(64)
            .with_context_length(16)
            .with_embedding_dim(8)
            .with_n_heads(2)
            .with_n_layers(1)
    }

    #[test]
    fn forward_produces_per_token_logits() {
        let device = Default::default();
        let model: Gpt2<TestBackend> = tiny_config().init(&device);
        let input = Tensor::<TestBackend, 2, Int>::from_data([[1, 2, 3, 4]], &device);
        assert_eq!(model.forward(input).dims(), [1, 4, 64]);
    }

    #[test]
    fn resize_grows_embeddings_and_output_projection() {
        let device = Default::default();
        let model: Gpt2<TestBackend> = tiny_config().init(&device);
        assert_eq!(model.vocab_size(), 64);

        let model = model.resize_token_embeddings(65, &device);
        assert_eq!(model.vocab_size(), 65);

        // the freshly added id is usable and scores over the new vocabulary
        let input = Tensor::<TestBackend, 2, Int>::from_data([[64, 1, 2]], &device);
        assert_eq!(model.forward(input).dims(), [1, 3, 65]);
    }

    #[test]
    fn resize_preserves_existing_rows() {
        let device = Default::default();
        let model: Gpt2<TestBackend> = tiny_config().init(&device);
        let before: Vec<f32> = model
            .token_embedding
            .weight
            .val()
            .slice([0..4, 0..8])
            .into_data()
            .to_vec()
            .unwrap();

        let model = model.resize_token_embeddings(70, &device);
        let after: Vec<f32> = model
            .token_embedding
            .weight
            .val()
            .slice([0..4, 0..8])
            .into_data()
            .to_vec()
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn resize_to_same_size_is_a_no_op() {
        let device = Default::default();
        let model: Gpt2<TestBackend> = tiny_config().init(&device);
        let model = model.resize_token_embeddings(64, &device);
        assert_eq!(model.vocab_size(), 64);
    }
}
