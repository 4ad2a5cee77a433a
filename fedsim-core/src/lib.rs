#![cfg_attr(docsrs, feature(doc_cfg))]
//! # fedsim: simulating distillation-based federated learning
//!
//! ###### tags: Federated Learning, Knowledge Distillation, Simulation
//!
//! This crate holds the building blocks shared by the coordinator and by the
//! worker processes of a simulated federated learning run:
//!
//! - [`ClientId`] and the seeding helpers in [`common`], which make every
//!   random choice of a run reproducible from a single base seed;
//! - [`FilteredView`], a read-only view over a base dataset that carves out
//!   the private shard of one client;
//! - the dataset collaborator in [`dataset`]: a seeded synthetic
//!   classification dataset, its partitioning across clients, the public
//!   probe pool and the on-disk store the workers read from;
//! - the [`model`] capability: a [`Model`] trait, the [`ModelSelector`]
//!   which turns a model name into a fresh instance and two small models;
//! - the [`DownlinkPackage`] and [`UplinkPackage`] exchanged in every round.
//!
//! ## Distillation instead of parameter exchange
//!
//! Clients never upload their parameters. Every round the server picks a
//! subset of a shared, unlabeled probe dataset and each sampled client
//! reports its predicted class distribution for exactly these probe samples.
//! The server combines the predictions into consensus soft labels and sends
//! them back with the next round's downlink, where clients (and the server's
//! own model) are distilled on them.

#[macro_use]
extern crate serde;

pub mod common;
pub mod dataset;
pub mod io;
pub mod model;
pub mod ops;
pub mod package;
pub mod train;
pub mod view;

pub use self::{
    common::{ClientId, RoundId},
    dataset::{Features, Label, PartitionedDataset, Shard},
    model::{Model, ModelError, ModelSelector, ModelState, ZooSelector},
    package::{DownlinkPackage, UplinkPackage},
    view::{FilteredView, ViewError},
};
