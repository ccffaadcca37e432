//! Pluggable units of work driven through the lifecycle stages.

mod breakpoint;
mod pause;
mod soh;
mod tap;
mod user;

use async_trait::async_trait;
use scorch_core::Stage;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::context::{Environment, ExecutionContext};
use crate::error::Result;

pub use breakpoint::Breakpoint;
pub use pause::{parse_duration, Pause};
pub use soh::StateOfHealth;
pub use tap::{Tap, TapOptions, TAP_STATUS_PREFIX};
pub use user::UserComponent;

/// The stage-method capability set every variant implements. A stage that
/// means nothing to a variant returns `Ok(())`.
#[async_trait]
pub trait Component: Send + Sync {
    /// Bind the invocation context before any stage method runs.
    async fn init(&mut self, ctx: ExecutionContext) -> Result<()>;

    fn component_type(&self) -> &str;

    async fn configure(&self, token: CancellationToken) -> Result<()>;

    async fn start(&self, token: CancellationToken) -> Result<()>;

    async fn stop(&self, token: CancellationToken) -> Result<()>;

    async fn cleanup(&self, token: CancellationToken) -> Result<()>;
}

/// Dispatch to the stage method for `stage`.
pub async fn invoke(component: &dyn Component, stage: Stage, token: CancellationToken) -> Result<()> {
    match stage {
        Stage::Configure => component.configure(token).await,
        Stage::Start => component.start(token).await,
        Stage::Stop => component.stop(token).await,
        Stage::Cleanup => component.cleanup(token).await,
    }
}

pub type ComponentFactory = Arc<dyn Fn(&Environment) -> Box<dyn Component> + Send + Sync>;

/// Type name to variant lookup. Unregistered types resolve to
/// [`UserComponent`], which runs an external program named after the type.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    factories: HashMap<String, ComponentFactory>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `break`, `pause`, `tap` and `soh`.
    pub fn with_builtins() -> Self {
        Self::new()
            .with("break", |env| Box::new(Breakpoint::new(env.clone())))
            .with("pause", |env| Box::new(Pause::new(env.clone())))
            .with("tap", |env| Box::new(Tap::new(env.clone())))
            .with("soh", |env| Box::new(StateOfHealth::new(env.clone())))
    }

    pub fn register<F>(&mut self, component_type: impl Into<String>, factory: F)
    where
        F: Fn(&Environment) -> Box<dyn Component> + Send + Sync + 'static,
    {
        self.factories
            .insert(component_type.into(), Arc::new(factory));
    }

    pub fn with<F>(mut self, component_type: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Environment) -> Box<dyn Component> + Send + Sync + 'static,
    {
        self.register(component_type, factory);
        self
    }

    pub fn is_registered(&self, component_type: &str) -> bool {
        self.factories.contains_key(component_type)
    }

    /// A fresh, uninitialised instance for `component_type`.
    pub fn resolve(&self, component_type: &str, env: &Environment) -> Box<dyn Component> {
        match self.factories.get(component_type) {
            Some(factory) => factory(env),
            None => {
                debug!(component_type, "No built-in component, using external program");
                Box::new(UserComponent::new(env.clone()))
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::config::ScorchConfig;

    #[tokio::test]
    async fn test_unknown_type_falls_back_to_user_component() {
        let harness = Harness::new(ScorchConfig::default(), Arc::new(FakeCluster::default())).await;
        let registry = ComponentRegistry::with_builtins();

        assert!(registry.is_registered("pause"));
        assert!(!registry.is_registered("ansible"));
        assert_eq!(registry.resolve("pause", &harness.env).component_type(), "pause");
        assert_eq!(registry.resolve("ansible", &harness.env).component_type(), "user");
    }

    #[tokio::test]
    async fn test_registered_factory_overrides_builtin() {
        let harness = Harness::new(ScorchConfig::default(), Arc::new(FakeCluster::default())).await;
        let registry = ComponentRegistry::with_builtins()
            .with("pause", |env| Box::new(UserComponent::new(env.clone())));
        assert_eq!(registry.resolve("pause", &harness.env).component_type(), "user");
    }
}
