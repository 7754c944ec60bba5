//! Fine-tunes a pretrained GPT-2 on a plain-text corpus, delegating the
//! optimization loop, checkpointing, and validation to burn's `Learner`.

pub mod config;
pub mod data;
pub mod metrics;
pub mod model;
pub mod pretrained;
pub mod run;
pub mod tokenizer;
pub mod train;
