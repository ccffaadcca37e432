use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::subnet::Ipv4Subnet;

/// A host tap interface bound to an experiment VLAN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapSpec {
    /// Interface name on the host
    pub name: String,
    /// Bridge the tap is attached to
    pub bridge: String,
    /// Experiment VLAN ID
    pub vlan: u16,
    /// Host address in CIDR form, e.g. `172.30.0.1/30`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Subnet NATed to the outside world, if external access is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<Ipv4Subnet>,
}

impl TapSpec {
    pub fn new(name: impl Into<String>, bridge: impl Into<String>, vlan: u16) -> Self {
        Self {
            name: name.into(),
            bridge: bridge.into(),
            vlan,
            ip: None,
            external: None,
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_external(mut self, subnet: Ipv4Subnet) -> Self {
        self.external = Some(subnet);
        self
    }
}

/// Command-execution facade over the cluster hypervisor.
#[async_trait]
pub trait ClusterControl: Send + Sync {
    /// Get the name of the backend
    fn name(&self) -> &'static str;

    /// Run a raw cluster command and return its output
    async fn exec(&self, command: &str) -> Result<String>;

    /// Create a tap on the host, assigning its address if one is given
    async fn create_tap(&self, tap: &TapSpec) -> Result<()>;

    /// Remove a tap previously created with `create_tap`
    async fn delete_tap(&self, name: &str) -> Result<()>;

    /// NAT a tap's subnet out of the host's default route
    async fn enable_external_access(&self, tap: &TapSpec) -> Result<()>;

    /// Undo `enable_external_access`
    async fn disable_external_access(&self, tap: &TapSpec) -> Result<()>;

    /// Every IPv4 network currently configured on the host
    async fn host_networks(&self) -> Result<Vec<Ipv4Subnet>>;
}
