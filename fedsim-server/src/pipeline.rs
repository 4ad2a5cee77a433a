//! The round orchestrator.

use thiserror::Error;
use tracing_futures::Instrument;

use crate::{
    metrics::SummaryWriter,
    server::{HandlerError, ServerHandler},
    trainer::{ParallelClientTrainer, TrainerError},
};
use fedsim_core::RoundId;

/// An error which aborts a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("local training failed: {0}")]
    Trainer(#[from] TrainerError),
    #[error("aggregation failed: {0}")]
    Handler(#[from] HandlerError),
    #[error("failed to record the summary: {0:#}")]
    Summary(anyhow::Error),
    #[error("round {0} ended without aggregation")]
    Incomplete(RoundId),
}

/// Drives the rounds of a run until the handler stops.
pub struct Pipeline<W> {
    handler: ServerHandler,
    trainer: ParallelClientTrainer,
    writer: W,
}

impl<W> Pipeline<W>
where
    W: SummaryWriter,
{
    pub fn new(handler: ServerHandler, trainer: ParallelClientTrainer, writer: W) -> Self {
        Self {
            handler,
            trainer,
            writer,
        }
    }

    pub fn handler(&self) -> &ServerHandler {
        &self.handler
    }

    /// Runs all remaining rounds.
    pub async fn main(&mut self) -> Result<(), PipelineError> {
        while !self.handler.if_stop() {
            let round = self.handler.round();
            self.round()
                .instrument(error_span!("round", round))
                .await?;
        }
        info!("done");
        Ok(())
    }

    async fn round(&mut self) -> Result<(), PipelineError> {
        let round = self.handler.round();
        let sampled = self.handler.sample_clients();
        let downlink = self.handler.downlink_package();
        info!("sampled {} clients", sampled.len());

        self.trainer.local_process(&downlink, &sampled).await?;

        let mut aggregated = false;
        for uplink in self.trainer.uplink_package() {
            aggregated = self.handler.load(uplink)?;
        }
        if !aggregated {
            return Err(PipelineError::Incomplete(round));
        }

        let summary = self.handler.get_summary();
        self.writer
            .add_summary(round, &summary)
            .map_err(PipelineError::Summary)
    }
}
