use std::{path::PathBuf, process};

use structopt::StructOpt;
use tracing_subscriber::*;

use fedsim_core::PartitionedDataset;
use fedsim_server::{client::ClientWorker, storage::PackageStore};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "Worker")]
struct Opt {
    /// Path of the task file
    #[structopt(long, parse(from_os_str))]
    task: PathBuf,
}

fn main() {
    let opt = Opt::from_args();

    let task = PackageStore::read_task(&opt.task).unwrap_or_else(|err| {
        eprintln!("{:#}", err);
        process::exit(1);
    });

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(task.log_filter.as_deref().unwrap_or("warn"))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let result = PartitionedDataset::load(&task.dataset_dir)
        .map_err(anyhow::Error::from)
        .and_then(|dataset| Ok(ClientWorker::new(&task, &dataset).run()?));
    match result {
        Ok(uplink) => debug!(
            "client {} finished round {}: loss {:.4}",
            uplink.client, uplink.round, uplink.train_loss
        ),
        Err(err) => {
            error!("client {} failed in round {}: {:#}", task.client, task.round, err);
            process::exit(1);
        }
    }
}
