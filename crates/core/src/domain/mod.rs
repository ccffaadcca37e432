pub mod experiment;
pub mod metadata;
pub mod stage;
pub mod update;
