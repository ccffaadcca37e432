//! SCORCH: runs component pipelines against a live experiment.
//!
//! A run walks an experiment's loop tree stage by stage, invoking pluggable
//! components. Status flows through the component actor into a per-loop
//! pipeline graph that is rebroadcast on every change, and breakpoints hand
//! control to humans through shared pseudo-terminals.

pub mod actor;
pub mod component;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod service;
pub mod store;
pub mod terminal;

pub use actor::pipeline::{Scope, Slot};
pub use actor::{CallError, ComponentOutput, OutputFrame, OutputSubscription};
pub use component::{Component, ComponentRegistry};
pub use config::ScorchConfig;
pub use context::{Environment, ExecutionContext, Reporter, TerminalMode};
pub use engine::{BackgroundHandle, BackgroundKey, BackgroundRegistry, RunExecutor};
pub use error::{MultiError, Result, ScorchError};
pub use pipeline::{NodeStatus, Pipeline};
pub use service::{Scorch, ScorchBuilder};
pub use store::{ExperimentStore, FileExperimentStore, MemoryExperimentStore};
pub use terminal::{Access, TerminalAttachment, TerminalFrame, TerminalInfo, TerminalRegistry};
