//! Plugin contract. Plugins contribute providers to the shared registry.

use crate::config::Config;
use crate::provider::Provider;
use crate::resolver::ProviderRegistry;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin '{plugin}' failed to enable: {reason}")]
    Enable { plugin: String, reason: String },
}

/// What a plugin may touch while it is enabled.
#[derive(Debug, Clone)]
pub struct PluginContext {
    registry: Arc<ProviderRegistry>,
    config: Arc<Config>,
}

impl PluginContext {
    pub fn new(registry: Arc<ProviderRegistry>, config: Arc<Config>) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn register_provider(&self, provider: Arc<dyn Provider>) {
        let id = provider.id().to_string();
        if self.registry.register(provider).is_some() {
            tracing::warn!(provider = %id, "provider replaced by a later plugin");
        }
    }

    pub fn unregister_provider(&self, id: &str) -> bool {
        self.registry.unregister(id).is_some()
    }
}

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn enable(&self, ctx: &PluginContext) -> Result<(), PluginError>;

    fn disable(&self, _ctx: &PluginContext) {}
}
