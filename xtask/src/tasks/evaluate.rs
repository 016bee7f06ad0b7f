use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::{
    backend::{NdArray, Wgpu, wgpu::WgpuDevice},
    prelude::*,
};
use clap::Args;
use nuclei_unet::{
    DataConfig, NucleiDataset, TrainingConfig, UNet, evaluate, show_predictions,
    dataset::{test_loader, train_test_split},
    training::CONFIG_FILE,
};

use crate::Accelerator;

#[derive(Args)]
pub struct EvaluateArgs {
    /// Directory holding `model.mpk` and `model.json`.
    #[arg(short, long, default_value = "artifacts")]
    pub model_dir: PathBuf,

    /// Dataset root with `inputs/` and `masks/`.
    #[arg(short, long)]
    pub data_dir: PathBuf,

    /// Only score the test split recorded in the model directory's `config.json`.
    #[arg(long)]
    pub held_out: bool,

    #[arg(short, long, default_value_t = 16)]
    pub batch_size: usize,

    /// Batches whose first sample is rendered.
    #[arg(short, long, default_value_t = 3)]
    pub num_predictions: usize,

    /// Where rendered predictions go (defaults to `<model_dir>/evaluation`).
    #[arg(short, long)]
    pub out_dir: Option<PathBuf>,
}

pub fn run(args: &EvaluateArgs, accelerator: Accelerator) -> Result<()> {
    match accelerator {
        Accelerator::Wgpu => evaluate_model::<Wgpu<f32, i32>>(args, WgpuDevice::default()),
        Accelerator::Cpu => evaluate_model::<NdArray>(args, Default::default()),
    }
}

fn evaluate_model<B: Backend>(args: &EvaluateArgs, device: B::Device) -> Result<()> {
    let (model_config, model) = UNet::<B>::load(&args.model_dir, &device)
        .with_context(|| format!("Unable to load model from {}", args.model_dir.display()))?;

    let items = NucleiDataset::from_folder(&args.data_dir, model_config.input_size)
        .with_context(|| format!("Unable to load {}", args.data_dir.display()))?
        .into_items();

    let data = DataConfig::new()
        .with_image_size(model_config.input_size)
        .with_batch_size(args.batch_size);
    let items = if args.held_out {
        let path = args.model_dir.join(CONFIG_FILE);
        let training = TrainingConfig::load(&path)
            .with_context(|| format!("Unable to read {}", path.display()))?;

        train_test_split(items, training.data.test_fraction, training.data.seed)?.test
    } else {
        items
    };
    tracing::info!("Evaluating on {} samples", items.len());

    let loader = test_loader::<B>(items, &data, device);
    let report = evaluate(&model, loader.as_ref())?;
    tracing::info!("\n{report}");

    let out_dir = args
        .out_dir
        .clone()
        .unwrap_or_else(|| args.model_dir.join("evaluation"));
    let written = show_predictions(&model, loader.as_ref(), args.num_predictions, &out_dir)?;
    tracing::info!("Rendered {} predictions into {}", written.len(), out_dir.display());

    Ok(())
}
