use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "ferry_runtime::gate" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit one JSON object per line instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

/// Keeps the live filter reachable so levels can change at runtime.
pub struct TelemetryGuard {
    base_level: Level,
    level_filter: Arc<RwLock<Vec<(String, Level)>>>,
    reload: Option<reload::Handle<EnvFilter, Registry>>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) {
        let directives = {
            let mut levels = self.level_filter.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
            filter_directives(self.base_level, &levels)
        };

        if let Some(handle) = &self.reload {
            if let Err(e) = handle.reload(EnvFilter::new(&directives)) {
                tracing::warn!(error = %e, "failed to reload log filter");
            }
        }
    }

    /// Get current per-module log level overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.level_filter.read().clone()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
///
/// A second call leaves the first subscriber in place; the returned guard
/// still tracks levels but cannot reload the filter.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let level_filter = Arc::new(RwLock::new(config.module_levels.clone()));

    let directives = filter_directives(config.log_level, &config.module_levels);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));
    let (filter_layer, handle) = reload::Layer::new(env_filter);

    let (json_layer, text_layer) = if config.json {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true);
        (Some(layer), None)
    } else {
        let layer = tracing_subscriber::fmt::layer().with_target(true);
        (None, Some(layer))
    };

    let installed = tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer)
        .with(text_layer)
        .try_init();

    let reload = match installed {
        Ok(()) => Some(handle),
        Err(e) => {
            eprintln!("ferry-telemetry: subscriber already installed: {e}");
            None
        }
    };

    TelemetryGuard {
        base_level: config.log_level,
        level_filter,
        reload,
    }
}

/// Build an `EnvFilter` directive string from a base level and overrides.
fn filter_directives(base: Level, module_levels: &[(String, Level)]) -> String {
    let mut filter_str = base.to_string().to_lowercase();
    for (module, level) in module_levels {
        filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter_str
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_overrides() {
        let levels = vec![
            ("ferry_runtime::gate".to_string(), Level::DEBUG),
            ("ferry_runtime::bridge".to_string(), Level::TRACE),
        ];
        assert_eq!(
            filter_directives(Level::INFO, &levels),
            "info,ferry_runtime::gate=debug,ferry_runtime::bridge=trace"
        );
        assert_eq!(filter_directives(Level::WARN, &[]), "warn");
    }

    #[test]
    fn guard_tracks_module_levels() {
        let guard = TelemetryGuard {
            base_level: Level::INFO,
            level_filter: Arc::new(RwLock::new(Vec::new())),
            reload: None,
        };
        guard.set_module_level("ferry_runtime", Level::DEBUG);
        guard.set_module_level("ferry_runtime", Level::TRACE);
        guard.set_module_level("ferry_core", Level::WARN);

        let levels = guard.module_levels();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0], ("ferry_runtime".to_string(), Level::TRACE));
        assert_eq!(levels[1], ("ferry_core".to_string(), Level::WARN));
    }

    #[test]
    fn default_config_is_text_at_info() {
        let config = TelemetryConfig::default();
        assert_eq!(config.log_level, Level::INFO);
        assert!(!config.json);
        assert!(config.module_levels.is_empty());
    }
}
