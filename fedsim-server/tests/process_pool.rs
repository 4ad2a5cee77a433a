use std::{path::PathBuf, sync::Arc};

use fedsim_core::{
    dataset::{Partition, PartitionKind, SyntheticConfig, SyntheticDataset},
    ClientId,
    DownlinkPackage,
    PartitionedDataset,
};
use fedsim_server::{
    metrics::SummaryWriter,
    pipeline::Pipeline,
    server::{HandlerSettings, ServerHandler, Summary},
    settings::{ClientSettings, DistillationSettings, ModelSettings, TrainingSettings},
    storage::{FileStateStore, RunDirs, StateStore},
    trainer::{ExecutionMode, ParallelClientTrainer, TrainerSettings},
};

const NUM_CLIENTS: usize = 4;
const SEED: u64 = 2021;

#[derive(Default)]
struct Recorder(Vec<(u32, Summary)>);

impl SummaryWriter for Recorder {
    fn add_summary(&mut self, round: u32, summary: &Summary) -> anyhow::Result<()> {
        self.0.push((round, summary.clone()));
        Ok(())
    }
}

fn training() -> TrainingSettings {
    TrainingSettings {
        model: ModelSettings {
            name: "mlp".into(),
            hidden: 16,
        },
        client: ClientSettings {
            epochs: 2,
            batch_size: 16,
            lr: 0.1,
        },
        distillation: DistillationSettings {
            kd_epochs: 2,
            kd_batch_size: 16,
            kd_lr: 0.1,
            era_temperature: 0.1,
            open_size_per_round: 32,
        },
    }
}

fn dataset() -> PartitionedDataset {
    let config = SyntheticConfig {
        num_train: 400,
        num_test: 100,
        open_size: 100,
        num_features: 6,
        num_classes: 4,
        noise: 1.,
        seed: SEED,
    };
    let dataset = SyntheticDataset::generate(&config).unwrap();
    let partition = Partition::new(
        PartitionKind::Shards { num_shards: 8 },
        &dataset.train_y,
        NUM_CLIENTS,
        SEED,
    )
    .unwrap();
    PartitionedDataset::new(dataset, partition)
}

fn pipeline(dirs: RunDirs, mode: ExecutionMode) -> Pipeline<Recorder> {
    let dataset = Arc::new(dataset());
    dirs.create().unwrap();
    dataset.save(&dirs.dataset).unwrap();

    let handler = ServerHandler::new(
        HandlerSettings {
            num_clients: NUM_CLIENTS,
            global_round: 2,
            sample_ratio: 0.5,
            seed: SEED,
            model: training().model,
            distillation: training().distillation,
        },
        Arc::clone(&dataset),
    )
    .unwrap();
    let trainer = ParallelClientTrainer::new(
        mode,
        TrainerSettings {
            num_parallels: 2,
            seed: SEED,
            training: training(),
            log_filter: Some("warn".into()),
        },
        dataset,
        dirs,
    );
    Pipeline::new(handler, trainer, Recorder::default())
}

fn worker() -> ExecutionMode {
    ExecutionMode::Process {
        program: PathBuf::from(env!("CARGO_BIN_EXE_worker")),
    }
}

#[tokio::test]
async fn test_process_pool_runs_two_rounds() {
    let dir = tempfile::tempdir().unwrap();
    let dirs = RunDirs::new(dir.path());
    let mut pipeline = pipeline(dirs.clone(), worker());
    pipeline.main().await.unwrap();

    assert!(pipeline.handler().if_stop());
    assert_eq!(pipeline.handler().round(), 2);
    let consensus = pipeline.handler().consensus().unwrap();
    assert_eq!(consensus.soft_labels.dim(), (32, 4));

    let states = FileStateStore::new(&dirs.state);
    let rounds: Vec<_> = ClientId::all(NUM_CLIENTS)
        .filter_map(|client| states.latest_round(client).unwrap())
        .collect();
    assert!(rounds.len() >= 2);
    assert!(rounds.iter().all(|&round| round < 2));

    // each round left its downlink and one uplink per sampled client behind
    for round in 0..2 {
        let round_dir = dirs.share.join(format!("round_{}", round));
        assert!(round_dir.join("downlink.bin").exists());
        let uplinks = std::fs::read_dir(&round_dir)
            .unwrap()
            .filter(|entry| {
                let name = entry.as_ref().unwrap().file_name();
                name.to_string_lossy().starts_with("uplink_")
            })
            .count();
        assert_eq!(uplinks, 2);
    }
}

#[tokio::test]
async fn test_process_and_serial_modes_agree() {
    let process_dir = tempfile::tempdir().unwrap();
    let serial_dir = tempfile::tempdir().unwrap();

    let mut process = pipeline(RunDirs::new(process_dir.path()), worker());
    let mut serial = pipeline(RunDirs::new(serial_dir.path()), ExecutionMode::Serial);
    process.main().await.unwrap();
    serial.main().await.unwrap();

    assert_eq!(process.handler().consensus(), serial.handler().consensus());
}

#[tokio::test]
async fn test_uplinks_follow_selection_not_completion_order() {
    let dir = tempfile::tempdir().unwrap();
    let dirs = RunDirs::new(dir.path());
    dirs.create().unwrap();

    // shards of very different sizes, so the tasks finish in different orders
    let synthetic = SyntheticDataset::generate(&SyntheticConfig {
        num_train: 400,
        num_test: 20,
        open_size: 50,
        num_features: 6,
        num_classes: 4,
        noise: 1.,
        seed: SEED,
    })
    .unwrap();
    let sizes = [100, 10, 40, 250];
    let mut start = 0;
    let clients = sizes
        .iter()
        .map(|size| {
            let indices = (start..start + size).collect();
            start += size;
            indices
        })
        .collect();
    let partition = Partition::from_indices(clients, synthetic.train_y.len()).unwrap();
    let dataset = Arc::new(PartitionedDataset::new(synthetic, partition));
    dataset.save(&dirs.dataset).unwrap();

    let mut training = training();
    training.client.epochs = 20;
    let mut trainer = ParallelClientTrainer::new(
        worker(),
        TrainerSettings {
            num_parallels: 4,
            seed: SEED,
            training,
            log_filter: Some("warn".into()),
        },
        dataset,
        dirs,
    );

    let selected = [
        ClientId::new(3),
        ClientId::new(0),
        ClientId::new(2),
        ClientId::new(1),
    ];
    let downlink = DownlinkPackage {
        round: 0,
        soft_labels: None,
        indices: None,
        next_indices: vec![1, 7, 9],
    };
    trainer.local_process(&downlink, &selected).await.unwrap();

    let uplinks = trainer.uplink_package();
    let clients: Vec<_> = uplinks.iter().map(|uplink| uplink.client).collect();
    assert_eq!(clients, selected);
    let num_samples: Vec<_> = uplinks.iter().map(|uplink| uplink.num_samples).collect();
    assert_eq!(num_samples, vec![250, 100, 40, 10]);
}
