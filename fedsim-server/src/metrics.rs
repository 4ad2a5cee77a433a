//! Sinks for the round summaries.

use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde_json::{json, Value};

use crate::server::Summary;
use fedsim_core::RoundId;

/// A sink for the summary of every round.
pub trait SummaryWriter {
    fn add_summary(&mut self, round: RoundId, summary: &Summary) -> anyhow::Result<()>;
}

impl<W: SummaryWriter + ?Sized> SummaryWriter for Box<W> {
    fn add_summary(&mut self, round: RoundId, summary: &Summary) -> anyhow::Result<()> {
        (**self).add_summary(round, summary)
    }
}

impl<W: SummaryWriter> SummaryWriter for Vec<W> {
    fn add_summary(&mut self, round: RoundId, summary: &Summary) -> anyhow::Result<()> {
        self.iter_mut()
            .try_for_each(|writer| writer.add_summary(round, summary))
    }
}

/// Appends one JSON object per round to a file:
///
/// ```text
/// {"round":0,"server_acc":0.41,...}
/// ```
pub struct JsonLinesWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonLinesWriter {
    pub fn new(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SummaryWriter for JsonLinesWriter {
    fn add_summary(&mut self, round: RoundId, summary: &Summary) -> anyhow::Result<()> {
        let mut line = json!({ "round": round });
        if let Value::Object(map) = &mut line {
            for (key, value) in summary {
                map.insert(key.clone(), json!(value));
            }
        }
        serde_json::to_writer(&mut self.writer, &line)?;
        self.writer.write_all(b"\n")?;
        self.writer
            .flush()
            .with_context(|| format!("failed to write to {}", self.path.display()))
    }
}

/// Logs the summaries.
#[derive(Debug, Default)]
pub struct TracingWriter;

impl SummaryWriter for TracingWriter {
    fn add_summary(&mut self, round: RoundId, summary: &Summary) -> anyhow::Result<()> {
        let metrics = summary
            .iter()
            .map(|(key, value)| format!("{}={:.4}", key, value))
            .collect::<Vec<_>>()
            .join(" ");
        info!("round {}: {}", round, metrics);
        Ok(())
    }
}
