pub mod error;
pub mod health;
pub mod minimega;
pub mod subnet;
pub mod traits;

pub use error::{ClusterError, Result};
pub use health::{CheckResult, CommandHealthChecker, HealthChecker, HealthReport};
pub use minimega::MinimegaCluster;
pub use subnet::Ipv4Subnet;
pub use traits::{ClusterControl, TapSpec};
