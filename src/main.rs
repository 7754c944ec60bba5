use anyhow::Result;
use burn::backend::candle::CandleDevice;
use burn::backend::{Autodiff, Candle};
use tracing_subscriber::EnvFilter;

use gpt2_finetune::config::{DataArgs, ModelArgs, TrainingArgs};
use gpt2_finetune::metrics::JsonlMetricsSink;
use gpt2_finetune::run::{run, RunEnvironment};

#[cfg(feature = "f16")]
type Elem = burn::tensor::f16;
#[cfg(not(feature = "f16"))]
type Elem = f32;

type Backend = Autodiff<Candle<Elem>>;

fn main() -> Result<()> {
    let model_args = ModelArgs::default();
    let data_args = DataArgs::default();
    let training_args = TrainingArgs::default();

    let env = RunEnvironment::from_args(&training_args);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(env.log_directive().parse()?))
        .init();

    let device = CandleDevice::Cpu;
    let mut sink = JsonlMetricsSink::create(training_args.output_dir.join("metrics.jsonl"))?;

    let results = run::<Backend>(
        &env,
        &model_args,
        &data_args,
        &training_args,
        &device,
        &mut sink,
    )?;

    for (key, value) in &results {
        println!("{key} = {value}");
    }
    Ok(())
}
