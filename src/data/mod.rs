pub mod batcher;
pub mod dataset;
