use async_trait::async_trait;
use cluster::{Ipv4Subnet, TapSpec};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Component;
use crate::context::{Environment, ExecutionContext};
use crate::error::{MultiError, Result, ScorchError};

/// Experiment status key prefix under which created taps are recorded.
pub const TAP_STATUS_PREFIX: &str = "scorch.taps.";

const EXTERNAL_PREFIX: u8 = 30;
const DEFAULT_BRIDGE: &str = "phenix";

/// Host tap settings, shared by `tap` components and breakpoints.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapOptions {
    /// Interface name; derived from the experiment and component when unset
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_bridge")]
    pub bridge: String,
    /// VLAN alias or numeric ID
    pub vlan: String,
    /// Host address in CIDR form; ignored when external access picks one
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub external_access: bool,
}

fn default_bridge() -> String {
    DEFAULT_BRIDGE.to_string()
}

fn status_key(component: &str) -> String {
    format!("{}{}", TAP_STATUS_PREFIX, component)
}

/// Linux caps interface names at 15 bytes, so derive a short stable one.
fn tap_name(experiment: &str, component: &str) -> String {
    // FNV-1a
    let mut hash: u32 = 0x811c_9dc5;
    for byte in experiment.bytes().chain([b'/']).chain(component.bytes()) {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    format!("stap{:08x}", hash)
}

/// Create a tap for `ctx`'s component and record it in experiment status.
pub(crate) async fn create_tap(
    env: &Environment,
    ctx: &ExecutionContext,
    options: &TapOptions,
) -> Result<TapSpec> {
    let vlan = ctx.experiment.vlan_id(&options.vlan).ok_or_else(|| {
        ScorchError::invalid_metadata(ctx.name.clone(), format!("unknown VLAN {}", options.vlan))
    })?;

    let name = options
        .name
        .clone()
        .unwrap_or_else(|| tap_name(&ctx.experiment.name, &ctx.name));
    let mut tap = TapSpec::new(name, options.bridge.clone(), vlan);

    if options.external_access {
        let subnet = free_subnet(env, &ctx.experiment.name).await?;
        let host = subnet.host(1).ok_or_else(|| {
            ScorchError::Config(format!("{} has no usable host address", subnet))
        })?;
        tap = tap
            .with_ip(format!("{}/{}", host, subnet.prefix()))
            .with_external(subnet);
    } else if let Some(ip) = &options.ip {
        tap = tap.with_ip(ip.clone());
    }

    env.cluster.create_tap(&tap).await?;
    if tap.external.is_some() {
        if let Err(e) = env.cluster.enable_external_access(&tap).await {
            if let Err(cleanup) = env.cluster.delete_tap(&tap.name).await {
                warn!(tap = %tap.name, error = %cleanup, "Failed to remove tap after NAT failure");
            }
            return Err(e.into());
        }
    }

    env.store
        .set_status_value(
            &ctx.experiment.name,
            &status_key(&ctx.name),
            serde_json::to_value(&tap)?,
        )
        .await?;

    info!(
        experiment = %ctx.experiment.name,
        component = %ctx.name,
        tap = %tap.name,
        vlan = tap.vlan,
        "Tap created"
    );
    Ok(tap)
}

/// A /30 from the configured pool that collides with nothing on the host and
/// no tap this experiment already holds.
async fn free_subnet(env: &Environment, experiment: &str) -> Result<Ipv4Subnet> {
    let mut used = env.cluster.host_networks().await?;
    let current = env.store.get(experiment).await?;
    for (key, value) in &current.status.values {
        if !key.starts_with(TAP_STATUS_PREFIX) {
            continue;
        }
        if let Ok(TapSpec {
            external: Some(subnet),
            ..
        }) = serde_json::from_value::<TapSpec>(value.clone())
        {
            used.push(subnet);
        }
    }
    Ok(env.config.tap_subnet_pool.first_free(EXTERNAL_PREFIX, &used)?)
}

/// Remove the tap recorded for `component`. Returns false when none was
/// recorded, which makes repeated teardown harmless.
pub(crate) async fn remove_tap(env: &Environment, experiment: &str, component: &str) -> Result<bool> {
    let key = status_key(component);
    let current = env.store.get(experiment).await?;
    let Some(value) = current.status_value(&key) else {
        return Ok(false);
    };
    let tap: TapSpec = serde_json::from_value(value.clone())?;

    let mut errors = MultiError::new();
    if tap.external.is_some() {
        errors.record(
            env.cluster
                .disable_external_access(&tap)
                .await
                .map_err(ScorchError::from),
        );
    }
    errors.record(env.cluster.delete_tap(&tap.name).await.map_err(ScorchError::from));
    env.store.remove_status_value(experiment, &key).await?;

    info!(experiment, component, tap = %tap.name, "Tap removed");
    errors.into_result()?;
    Ok(true)
}

/// Creates a host tap on `start` and removes it on `stop` or `cleanup`.
pub struct Tap {
    env: Environment,
    ctx: Option<ExecutionContext>,
    options: Option<TapOptions>,
}

impl Tap {
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            ctx: None,
            options: None,
        }
    }

    fn bound(&self) -> Result<(&ExecutionContext, &TapOptions)> {
        match (&self.ctx, &self.options) {
            (Some(ctx), Some(options)) => Ok((ctx, options)),
            _ => Err(ScorchError::invalid_metadata("tap", "component used before init")),
        }
    }

    async fn teardown(&self) -> Result<()> {
        let (ctx, _) = self.bound()?;
        remove_tap(&self.env, &ctx.experiment.name, &ctx.name)
            .await
            .map_err(|e| ctx.failed(e))?;
        Ok(())
    }
}

#[async_trait]
impl Component for Tap {
    async fn init(&mut self, ctx: ExecutionContext) -> Result<()> {
        self.options = Some(ctx.options()?);
        self.ctx = Some(ctx);
        Ok(())
    }

    fn component_type(&self) -> &str {
        "tap"
    }

    async fn configure(&self, _token: CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn start(&self, _token: CancellationToken) -> Result<()> {
        let (ctx, options) = self.bound()?;
        let tap = create_tap(&self.env, ctx, options)
            .await
            .map_err(|e| ctx.failed(e))?;
        ctx.reporter
            .output(format!(
                "tap {} on VLAN {} ({})\n",
                tap.name,
                tap.vlan,
                tap.ip.as_deref().unwrap_or("no address")
            ))
            .await
    }

    async fn stop(&self, _token: CancellationToken) -> Result<()> {
        self.teardown().await
    }

    async fn cleanup(&self, _token: CancellationToken) -> Result<()> {
        self.teardown().await
    }
}
