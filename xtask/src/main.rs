use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod tasks;

#[derive(Parser)]
#[command(
    name = "nuclei-unet",
    about = "Nuclei segmentation with a MobileNetV2 U-Net",
    author,
    version
)]
struct Cli {
    /// Compute backend.
    #[arg(long, value_enum, global = true, default_value_t = Accelerator::Wgpu)]
    accelerator: Accelerator,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Accelerator {
    Wgpu,
    Cpu,
}

#[derive(Subcommand)]
enum Commands {
    /// Train on one dataset root containing `inputs/` and `masks/`.
    Train(tasks::train::TrainArgs),
    /// Score a saved model and render sample predictions.
    Evaluate(tasks::evaluate::EvaluateArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Train(args) => tasks::train::run(args, cli.accelerator),
        Commands::Evaluate(args) => tasks::evaluate::run(args, cli.accelerator),
    }
}
