use std::path::PathBuf;

use anyhow::Context;
use burn::backend::NdArray;
use burn::prelude::*;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use clap::Parser;

use stack_pcb_reid::data::TestView;
use stack_pcb_reid::evaluation::{EvalSettings, Evaluator};
use stack_pcb_reid::model::{PretrainChoice, StackPcbConfig};
use stack_pcb_reid::training::TrainingConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Report rank-1 and mAP of a StackPCBv2 checkpoint", long_about = None)]
struct Args {
    /// Checkpoint directory holding model.bin and config.json
    #[arg(short, long, default_value = "runs/stack_pcb/best")]
    weights: PathBuf,

    /// Training config providing the dataset and evaluation settings
    #[arg(short, long, default_value = "configs/train_config.yaml")]
    config: PathBuf,

    /// Test views to sum, overriding the config (e.g. plain,flip,center)
    #[arg(long, value_delimiter = ',')]
    views: Option<Vec<TestView>>,

    /// Also report k-reciprocal re-ranked metrics
    #[arg(long)]
    re_ranking: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    type MyBackend = NdArray;
    let device = Default::default();

    let config = TrainingConfig::from_yaml(&args.config)?;

    let meta_path = args.weights.join("config.json");
    let meta: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(&meta_path)
            .with_context(|| format!("reading {}", meta_path.display()))?,
    )?;
    let mut model_config: StackPcbConfig = serde_json::from_value(meta["model"].clone())
        .with_context(|| format!("no model config in {}", meta_path.display()))?;
    // weights come from the checkpoint itself
    model_config.pretrain_choice = PretrainChoice::None;

    let record = BinFileRecorder::<FullPrecisionSettings>::new()
        .load(args.weights.join("model"), &device)
        .map_err(|e| anyhow::anyhow!("failed to load weights: {:?}", e))?;
    let model = model_config.init::<MyBackend>(&device)?.load_record(record);
    log::info!("Loaded checkpoint {}", args.weights.display());

    let query = config.dataset.query()?;
    let gallery = config.dataset.gallery()?;

    let evaluator = Evaluator::<MyBackend>::new(
        EvalSettings {
            views: args.views.unwrap_or(config.test_views),
            norm: config.norm,
            batch_size: config.test_batch,
            size: model_config.input_size(),
            re_ranking: (args.re_ranking || config.re_ranking).then_some(config.re_ranking_params),
        },
        device,
    );
    let report = evaluator.evaluate(&model, &query, &gallery)?;

    println!("{}", report.metrics);
    if let Some(re_ranked) = report.re_ranked {
        println!("Re-ranked: {re_ranked}");
    }
    Ok(())
}
