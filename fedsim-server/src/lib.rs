#![cfg_attr(docsrs, feature(doc_cfg))]
//! # fedsim-server: round orchestration for distillation-based federated learning
//!
//! ###### tags: Federated Learning, Knowledge Distillation, Simulation
//!
//! The coordinator of a simulated run repeatedly
//!
//! 1. samples a subset of the clients and a subset of the public probe dataset
//!    ([`ServerHandler::sample_clients`]);
//! 2. broadcasts the consensus of the previous round ([`ServerHandler::downlink_package`]);
//! 3. lets every sampled client distill on the consensus, train on its private shard and predict
//!    on the probe subset ([`ParallelClientTrainer::local_process`]);
//! 4. aggregates the predictions into entropy reduced soft labels and distills its own model on
//!    them ([`ServerHandler::load`]).
//!
//! Local training runs in separate `worker` processes, with a bounded number of them in flight.
//! Tasks, uplinks and the local states of the clients are handed over through the disk, written
//! atomically so that an interrupted run never leaves a half-written file behind.
//!
//! [`ServerHandler::sample_clients`]: crate::server::ServerHandler::sample_clients
//! [`ServerHandler::downlink_package`]: crate::server::ServerHandler::downlink_package
//! [`ServerHandler::load`]: crate::server::ServerHandler::load
//! [`ParallelClientTrainer::local_process`]: crate::trainer::ParallelClientTrainer::local_process

#[macro_use]
extern crate serde;

#[macro_use]
extern crate tracing;

pub mod client;
pub mod metrics;
pub mod pipeline;
pub mod server;
pub mod settings;
pub mod storage;
pub mod trainer;
pub mod utils;
