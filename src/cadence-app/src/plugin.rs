use cadence_core::{Plugin, PluginContext};
use std::sync::{Mutex, PoisonError};

/// Owns the plugins handed to the app and tracks which ones are enabled.
pub struct PluginManager {
    plugins: Vec<Box<dyn Plugin>>,
    enabled: Mutex<Vec<usize>>,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins", &self.names())
            .field("enabled", &self.enabled())
            .finish()
    }
}

impl PluginManager {
    pub fn new(plugins: Vec<Box<dyn Plugin>>) -> Self {
        Self {
            plugins,
            enabled: Mutex::new(Vec::new()),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn enabled(&self) -> Vec<String> {
        let enabled = self.enabled.lock().unwrap_or_else(PoisonError::into_inner);
        enabled
            .iter()
            .filter_map(|idx| self.plugins.get(*idx))
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Enable every plugin that is not enabled yet. Failing plugins are
    /// logged and skipped. Returns how many plugins are enabled afterwards.
    pub fn scan(&self, ctx: &PluginContext) -> usize {
        let mut enabled = self.enabled.lock().unwrap_or_else(PoisonError::into_inner);
        for (idx, plugin) in self.plugins.iter().enumerate() {
            if enabled.contains(&idx) {
                continue;
            }
            match plugin.enable(ctx) {
                Ok(()) => {
                    tracing::info!(plugin = plugin.name(), "plugin enabled");
                    enabled.push(idx);
                }
                Err(err) => {
                    tracing::error!(plugin = plugin.name(), error = %err, "plugin failed to enable; skipping");
                }
            }
        }
        enabled.len()
    }

    /// Disable enabled plugins in reverse order.
    pub fn shutdown(&self, ctx: &PluginContext) {
        let enabled: Vec<usize> = std::mem::take(
            &mut *self.enabled.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for idx in enabled.into_iter().rev() {
            if let Some(plugin) = self.plugins.get(idx) {
                plugin.disable(ctx);
                tracing::debug!(plugin = plugin.name(), "plugin disabled");
            }
        }
    }
}
