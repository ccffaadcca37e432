//! Publish/subscribe broadcast for SCORCH
//!
//! This crate provides the event bus and event types used to push pipeline
//! mutations, run lifecycle and terminal lifecycle to connected viewers.

mod bus;
mod types;

pub use bus::{EventBus, ExperimentEvents};
pub use types::*;
