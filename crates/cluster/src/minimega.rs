use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{ClusterError, Result};
use crate::subnet::Ipv4Subnet;
use crate::traits::{ClusterControl, TapSpec};

/// Cluster control backed by the `minimega` command line and host tools.
pub struct MinimegaCluster {
    binary: PathBuf,
    namespace: Option<String>,
}

impl MinimegaCluster {
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            namespace: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    async fn run(&self, program: &std::path::Path, args: &[&str]) -> Result<String> {
        debug!("Running {:?} {:?}", program, args);

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    ClusterError::CommandNotFound(program.display().to_string())
                }
                _ => ClusterError::Io(e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ClusterError::CommandFailed(format!(
                "{} {} failed: {}",
                program.display(),
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn scoped(&self, command: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("namespace {} {}", ns, command),
            None => command.to_string(),
        }
    }

    fn create_tap_command(tap: &TapSpec) -> String {
        match &tap.ip {
            Some(ip) => format!(
                "tap create {} bridge {} ip {} {}",
                tap.vlan, tap.bridge, ip, tap.name
            ),
            None => format!("tap create {} bridge {} {}", tap.vlan, tap.bridge, tap.name),
        }
    }

    async fn iptables_nat(&self, action: &str, subnet: &Ipv4Subnet) -> Result<()> {
        let subnet = subnet.to_string();
        self.run(
            std::path::Path::new("iptables"),
            &[
                "-t",
                "nat",
                action,
                "POSTROUTING",
                "-s",
                &subnet,
                "-j",
                "MASQUERADE",
            ],
        )
        .await
        .map(|_| ())
    }
}

/// Parse the output of `ip -o -4 addr show`.
pub(crate) fn parse_host_networks(output: &str) -> Vec<Ipv4Subnet> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            fields.find(|f| *f == "inet")?;
            fields.next()?.parse().ok()
        })
        .collect()
}

#[async_trait]
impl ClusterControl for MinimegaCluster {
    fn name(&self) -> &'static str {
        "minimega"
    }

    async fn exec(&self, command: &str) -> Result<String> {
        let command = self.scoped(command);
        self.run(&self.binary, &["-e", &command]).await
    }

    async fn create_tap(&self, tap: &TapSpec) -> Result<()> {
        self.exec(&Self::create_tap_command(tap)).await?;
        Ok(())
    }

    async fn delete_tap(&self, name: &str) -> Result<()> {
        match self.exec(&format!("tap delete {}", name)).await {
            Ok(_) => Ok(()),
            Err(ClusterError::CommandFailed(msg)) if msg.contains("not found") => {
                Err(ClusterError::TapNotFound(name.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn enable_external_access(&self, tap: &TapSpec) -> Result<()> {
        let Some(subnet) = tap.external else {
            return Ok(());
        };
        self.iptables_nat("-A", &subnet).await
    }

    async fn disable_external_access(&self, tap: &TapSpec) -> Result<()> {
        let Some(subnet) = tap.external else {
            return Ok(());
        };
        if let Err(e) = self.iptables_nat("-D", &subnet).await {
            warn!(tap = %tap.name, error = %e, "Failed to remove NAT rule");
            return Err(e);
        }
        Ok(())
    }

    async fn host_networks(&self) -> Result<Vec<Ipv4Subnet>> {
        let output = self
            .run(std::path::Path::new("ip"), &["-o", "-4", "addr", "show"])
            .await?;
        Ok(parse_host_networks(&output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tap_command() {
        let tap = TapSpec::new("scorch0", "phenix", 101);
        assert_eq!(
            MinimegaCluster::create_tap_command(&tap),
            "tap create 101 bridge phenix scorch0"
        );

        let tap = tap.with_ip("172.30.0.1/30");
        assert_eq!(
            MinimegaCluster::create_tap_command(&tap),
            "tap create 101 bridge phenix ip 172.30.0.1/30 scorch0"
        );
    }

    #[test]
    fn test_namespace_scoping() {
        let cluster = MinimegaCluster::new(PathBuf::from("minimega")).with_namespace("exp");
        assert_eq!(cluster.scoped("tap delete t0"), "namespace exp tap delete t0");
    }

    #[test]
    fn test_parse_host_networks() {
        let output = "\
1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever
2: eth0    inet 10.0.2.15/24 brd 10.0.2.255 scope global dynamic eth0
5: scorch0    inet 172.30.0.1/30 scope global scorch0
";
        let networks = parse_host_networks(output);
        assert_eq!(networks.len(), 3);
        assert_eq!(networks[1].to_string(), "10.0.2.0/24");
        assert_eq!(networks[2].to_string(), "172.30.0.0/30");
    }

    #[tokio::test]
    async fn test_missing_binary_reports_not_found() {
        let cluster = MinimegaCluster::new(PathBuf::from("/nonexistent/minimega"));
        let result = cluster.exec("version").await;
        assert!(matches!(result, Err(ClusterError::CommandNotFound(_))));
    }
}
