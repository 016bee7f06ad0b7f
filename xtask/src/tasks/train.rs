use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::{
    backend::{Autodiff, NdArray, Wgpu, wgpu::WgpuDevice},
    tensor::backend::AutodiffBackend,
};
use clap::Args;
use nuclei_unet::{
    DataConfig, EarlyStoppingConfig, TrainingConfig, UNetConfig, training::StopReason,
};

use crate::Accelerator;

#[derive(Args)]
pub struct TrainArgs {
    /// Dataset root with `inputs/` and `masks/`.
    #[arg(short, long)]
    pub data_dir: PathBuf,

    #[arg(short, long, default_value_t = 10)]
    pub epochs: usize,

    #[arg(short, long, default_value_t = 16)]
    pub batch_size: usize,

    #[arg(short, long, default_value_t = 1e-3)]
    pub lr: f64,

    #[arg(long, default_value_t = 4)]
    pub num_workers: usize,

    #[arg(short, long, default_value = "artifacts")]
    pub artifact_dir: PathBuf,

    /// Root of the timestamped summary directories.
    #[arg(long, default_value = "logs/fit")]
    pub log_dir: PathBuf,

    /// Pretrained MobileNetV2 record for the frozen encoder.
    #[arg(long)]
    pub encoder_weights: Option<PathBuf>,

    #[arg(long, default_value_t = 128)]
    pub image_size: usize,

    #[arg(long, default_value_t = 3)]
    pub num_classes: usize,

    #[arg(long, default_value_t = 0.2)]
    pub test_fraction: f64,

    #[arg(long, default_value_t = 10)]
    pub val_subsplits: usize,

    #[arg(long, default_value_t = 5)]
    pub patience: usize,

    #[arg(long)]
    pub no_early_stopping: bool,

    #[arg(long)]
    pub no_augment: bool,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

impl TrainArgs {
    fn config(&self) -> TrainingConfig {
        let size = [self.image_size, self.image_size];
        let model = UNetConfig::new()
            .with_input_size(size)
            .with_num_classes(self.num_classes);
        let data = DataConfig::new()
            .with_image_size(size)
            .with_test_fraction(self.test_fraction)
            .with_batch_size(self.batch_size)
            .with_num_workers(self.num_workers)
            .with_augment(!self.no_augment)
            .with_seed(self.seed);
        let early_stopping = (!self.no_early_stopping)
            .then(|| EarlyStoppingConfig::new().with_patience(self.patience));

        TrainingConfig::new(model, data)
            .with_num_epochs(self.epochs)
            .with_learning_rate(self.lr)
            .with_val_subsplits(self.val_subsplits)
            .with_early_stopping(early_stopping)
            .with_seed(self.seed)
    }
}

pub fn run(args: &TrainArgs, accelerator: Accelerator) -> Result<()> {
    match accelerator {
        Accelerator::Wgpu => train::<Autodiff<Wgpu<f32, i32>>>(args, WgpuDevice::default()),
        Accelerator::Cpu => train::<Autodiff<NdArray>>(args, Default::default()),
    }
}

fn train<B: AutodiffBackend>(args: &TrainArgs, device: B::Device) -> Result<()> {
    let config = args.config();
    config
        .validate()
        .context("Invalid training configuration")?;

    tracing::info!("Training on {}", args.data_dir.display());
    let result = nuclei_unet::training::train::<B>(
        &args.data_dir,
        &args.artifact_dir,
        &args.log_dir,
        args.encoder_weights.as_deref(),
        config,
        device,
    )
    .with_context(|| format!("Training on {} failed", args.data_dir.display()))?;

    match result.history.stop_reason {
        StopReason::EarlyStopped { epoch } => tracing::info!("Stopped early at epoch {epoch}"),
        StopReason::MaxEpochs => tracing::info!("Completed {} epochs", args.epochs),
    }
    tracing::info!(
        "Model saved in {} (weights of epoch {})",
        args.artifact_dir.display(),
        result.history.best_epoch.unwrap_or(0)
    );

    Ok(())
}
