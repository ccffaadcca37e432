use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

use crate::error::CoreError;

/// Lifecycle phase applied to the components of a loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, ToSchema)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Configure,
    Start,
    Stop,
    Cleanup,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Configure, Stage::Start, Stage::Stop, Stage::Cleanup];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configure => "configure",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Cleanup => "cleanup",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "configure" => Some(Self::Configure),
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "cleanup" => Some(Self::Cleanup),
            _ => None,
        }
    }

    /// Stop and cleanup attempt every component and never short-circuit.
    pub fn is_teardown(&self) -> bool {
        matches!(self, Self::Stop | Self::Cleanup)
    }

    /// The acquisition stage a teardown stage reconciles background work against.
    pub fn counterpart(&self) -> Option<Stage> {
        match self {
            Self::Stop => Some(Self::Start),
            Self::Cleanup => Some(Self::Configure),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| CoreError::InvalidStage(s.to_string()))
    }
}

/// Status carried by a component update.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Start,
    Running,
    Background,
    Success,
    Failure,
}

impl ComponentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Running => "running",
            Self::Background => "background",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
