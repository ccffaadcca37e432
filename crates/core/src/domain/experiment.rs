use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

use crate::domain::metadata::ScorchMetadata;
use crate::domain::stage::Stage;

/// The live "currently executing" marker of an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct RunProgress {
    pub run: usize,
    #[serde(rename = "loop")]
    pub loop_index: usize,
    pub count: usize,
    pub stage: Option<Stage>,
    pub started_at: DateTime<Utc>,
}

impl RunProgress {
    pub fn new(run: usize) -> Self {
        Self {
            run,
            loop_index: 0,
            count: 1,
            stage: None,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentStatus {
    /// Whether the experiment's VMs are deployed.
    #[serde(default)]
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scorch_run: Option<RunProgress>,
    /// Opaque values persisted by components, e.g. tap identities.
    #[serde(default)]
    pub values: serde_json::Map<String, serde_json::Value>,
}

/// The slice of an experiment the engine needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub name: String,
    /// VLAN alias to VLAN ID.
    #[serde(default)]
    pub vlans: BTreeMap<String, u16>,
    #[serde(default)]
    pub scorch: ScorchMetadata,
    #[serde(default)]
    pub status: ExperimentStatus,
}

impl Experiment {
    pub fn new(name: impl Into<String>, scorch: ScorchMetadata) -> Self {
        Self {
            name: name.into(),
            scorch,
            ..Default::default()
        }
    }

    /// Resolve a VLAN given either an alias or a numeric ID.
    pub fn vlan_id(&self, vlan: &str) -> Option<u16> {
        self.vlans
            .get(vlan)
            .copied()
            .or_else(|| vlan.parse().ok())
    }

    pub fn status_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.status.values.get(key)
    }
}
