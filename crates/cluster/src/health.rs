use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

use crate::error::{ClusterError, Result};

/// Outcome of a single health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Results keyed by check name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HealthReport {
    pub results: BTreeMap<String, CheckResult>,
}

impl HealthReport {
    /// Names of the checks that did not pass.
    pub fn failures(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, r)| !r.passed)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn passed(&self) -> bool {
        self.results.values().all(|r| r.passed)
    }
}

/// The experiment state-of-health subsystem.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Run `checks` against an experiment. An empty slice means all checks.
    async fn check(&self, experiment: &str, checks: &[String]) -> Result<HealthReport>;
}

/// Runs an external program `<program> <experiment> [check...]` that prints a
/// JSON object of check results on stdout.
pub struct CommandHealthChecker {
    program: PathBuf,
}

impl CommandHealthChecker {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl HealthChecker for CommandHealthChecker {
    async fn check(&self, experiment: &str, checks: &[String]) -> Result<HealthReport> {
        debug!(experiment, ?checks, "Running health checks");

        let output = Command::new(&self.program)
            .arg(experiment)
            .args(checks)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    ClusterError::CommandNotFound(self.program.display().to_string())
                }
                _ => ClusterError::Io(e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ClusterError::HealthCheck(stderr.trim().to_string()));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| ClusterError::Parse(format!("health report: {}", e)))
    }
}
