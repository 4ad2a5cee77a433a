use std::{
    fs,
    process::{Command, Stdio},
};

const CONFIG: &str = r#"
[simulation]
num_clients = 4
global_round = 2
sample_ratio = 0.5
seed = 7
num_parallels = 2
execution = "process"

[model]
name = "linear"
hidden = 8

[client]
epochs = 1
batch_size = 16
lr = 0.1

[distillation]
kd_epochs = 1
kd_batch_size = 16
kd_lr = 0.1
era_temperature = 0.1
open_size_per_round = 16

[dataset]
num_train = 200
num_test = 50
open_size = 50
num_features = 4
num_classes = 3
noise = 1.0

[dataset.partition]
kind = "iid"

[log]
filter = "warn"
"#;

#[test]
fn cli_smoke_test() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("runs");
    let config = dir.path().join("config.toml");
    fs::write(
        &config,
        format!("{}\n[storage]\nroot_dir = {:?}\n", CONFIG, root.display().to_string()),
    )
    .unwrap();

    let status = Command::new(env!("CARGO_BIN_EXE_coordinator"))
        .arg("-c")
        .arg(&config)
        .stdout(Stdio::null())
        .status()
        .unwrap();
    assert!(status.success());

    let runs: Vec<_> = fs::read_dir(&root).unwrap().collect();
    assert_eq!(runs.len(), 1);
    let run = runs[0].as_ref().unwrap().path();
    let summary = fs::read_to_string(run.join("summary.jsonl")).unwrap();
    assert_eq!(summary.lines().count(), 2);
    assert!(run.join("dataset").join("dataset.bin").exists());
}

#[test]
fn cli_rejects_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.toml");
    fs::write(&config, CONFIG.replace("sample_ratio = 0.5", "sample_ratio = 1.5")).unwrap();

    let status = Command::new(env!("CARGO_BIN_EXE_coordinator"))
        .arg("-c")
        .arg(&config)
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert!(!status.success());
}
