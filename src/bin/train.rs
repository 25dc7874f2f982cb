use std::path::PathBuf;

use anyhow::Context;
use burn::backend::{Autodiff, NdArray};
use clap::Parser;

use stack_pcb_reid::training::{self, TrainingConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Train StackPCBv2 for person re-identification", long_about = None)]
struct Args {
    /// Training config; a default one is written here when missing
    #[arg(short, long, default_value = "configs/train_config.yaml")]
    config: PathBuf,

    /// Override the number of epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Override the checkpoint directory
    #[arg(long)]
    save_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    type MyBackend = NdArray;
    type MyAutodiffBackend = Autodiff<MyBackend>;
    let device = Default::default();

    let mut config = if args.config.exists() {
        log::info!("Loading config from {}", args.config.display());
        TrainingConfig::from_yaml(&args.config)?
    } else {
        let config = TrainingConfig::default();
        if let Some(parent) = args.config.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        config.save(&args.config)?;
        log::info!("Created default config at {}", args.config.display());
        config
    };

    if let Some(epochs) = args.epochs {
        config.max_epoch = epochs;
    }
    if let Some(save_dir) = args.save_dir {
        config.save_dir = save_dir;
    }

    println!("=========user config==========");
    println!("{}", serde_yaml::to_string(&config)?);
    println!("============end===============");

    let summary = training::run::<MyAutodiffBackend>(config, device).context("training failed")?;
    println!(
        "Best rank-1 {:.1}%, achieved at epoch {}",
        summary.best_rank1 * 100.0,
        summary.best_epoch
    );
    Ok(())
}
