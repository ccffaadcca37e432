//! Domain types shared by the SCORCH engine, its collaborators and the HTTP layer.

pub mod domain;
pub mod error;

pub use domain::experiment::{Experiment, ExperimentStatus, RunProgress};
pub use domain::metadata::{ComponentSpec, Loop, Metadata, ScorchMetadata};
pub use domain::stage::{ComponentStatus, Stage};
pub use domain::update::{ComponentKey, ComponentUpdate};
pub use error::{CoreError, Result};
