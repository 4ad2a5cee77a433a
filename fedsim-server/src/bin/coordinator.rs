use std::{path::PathBuf, process, sync::Arc};

use anyhow::Context;
use chrono::Local;
use structopt::StructOpt;
use tokio::signal;
use tracing_subscriber::*;

use fedsim_core::{
    dataset::{Partition, SyntheticDataset},
    PartitionedDataset,
};
use fedsim_server::{
    metrics::{JsonLinesWriter, SummaryWriter, TracingWriter},
    pipeline::Pipeline,
    server::{HandlerSettings, ServerHandler},
    settings::Settings,
    storage::RunDirs,
    trainer::{ExecutionMode, ParallelClientTrainer, TrainerSettings},
};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "Coordinator")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(settings.log.filter.to_string())
        .with_ansi(true)
        .init();

    let mut pipeline = match init(&settings) {
        Ok(pipeline) => pipeline,
        Err(err) => {
            error!("failed to initialize the run: {:#}", err);
            process::exit(1);
        }
    };

    tokio::select! {
        result = pipeline.main() => {
            if let Err(err) = result {
                error!("shutting down: {}", err);
                process::exit(1);
            }
        }
        _ = signal::ctrl_c() => {
            warn!("shutting down: interrupted");
        }
    }
}

/// Prepares the directories and the dataset of a new run and assembles its pipeline.
fn init(settings: &Settings) -> anyhow::Result<Pipeline<Vec<Box<dyn SummaryWriter>>>> {
    let dirs = RunDirs::timestamped(&settings.storage.root_dir, Local::now());
    dirs.create()?;
    info!("run directory: {}", dirs.run.display());

    let synthetic = SyntheticDataset::generate(&settings.synthetic_config())?;
    let partition = Partition::new(
        settings.dataset.partition,
        &synthetic.train_y,
        settings.simulation.num_clients,
        settings.simulation.seed,
    )?;
    let dataset = Arc::new(PartitionedDataset::new(synthetic, partition));
    dataset
        .save(&dirs.dataset)
        .context("failed to store the dataset")?;

    let mut writers: Vec<Box<dyn SummaryWriter>> = vec![Box::new(TracingWriter)];
    if settings.metrics.jsonl {
        writers.push(Box::new(JsonLinesWriter::new(dirs.summary_path())?));
    }

    let handler = ServerHandler::new(HandlerSettings::from(settings), Arc::clone(&dataset))?;
    let mode = ExecutionMode::from_settings(settings)?;
    debug!("execution mode: {:?}", mode);
    let trainer = ParallelClientTrainer::new(mode, TrainerSettings::from(settings), dataset, dirs);
    Ok(Pipeline::new(handler, trainer, writers))
}
