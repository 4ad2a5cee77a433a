//! Utilities.

pub mod concurrent_futures;
