// src/config.rs
//! Scheduler configuration.
//!
//! Loaded from JSON (every field optional, missing fields take their defaults),
//! then optionally overridden from the environment:
//!
//! - `ASYNC_TRACE_RUN_ON_WORKERS` = `true|false|1|0`
//! - `ASYNC_TRACE_WORKER_THREADS` = thread count, `0` for one per core

use crate::collision::DEFAULT_SHAPE_EPSILON;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const ENV_RUN_ON_WORKERS: &str = "ASYNC_TRACE_RUN_ON_WORKERS";
pub const ENV_WORKER_THREADS: &str = "ASYNC_TRACE_WORKER_THREADS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsyncTraceConfig {
    /// Execute chunks on the worker pool. When false, each chunk runs inline
    /// on the submitting thread at the point it would have been dispatched.
    pub run_on_worker_threads: bool,
    /// Worker pool size. 0 lets rayon pick (one per logical core).
    pub worker_threads: usize,
    /// Worker threads are named `{prefix}-{n}`.
    pub thread_name_prefix: String,
    /// Shapes with every dimension at or below this are traced as rays.
    pub degenerate_shape_epsilon: f32,
}

impl Default for AsyncTraceConfig {
    fn default() -> Self {
        Self {
            run_on_worker_threads: true,
            worker_threads: 0,
            thread_name_prefix: "async-trace".to_string(),
            degenerate_shape_epsilon: DEFAULT_SHAPE_EPSILON,
        }
    }
}

impl AsyncTraceConfig {
    /// Inline execution, handy for deterministic tests and tools.
    pub fn synchronous() -> Self {
        Self {
            run_on_worker_threads: false,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::from(e).context(format!("reading {}", path.display())))?;
        Self::from_json_str(&json).map_err(|e| e.context(format!("loading {}", path.display())))
    }

    /// Applies `ASYNC_TRACE_*` environment variables on top of `self`.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(value) = lookup(ENV_RUN_ON_WORKERS) {
            self.run_on_worker_threads = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(Error::InvalidConfig {
                        key: ENV_RUN_ON_WORKERS,
                        value,
                    })
                }
            };
        }
        if let Some(value) = lookup(ENV_WORKER_THREADS) {
            self.worker_threads = value.trim().parse().map_err(|_| Error::InvalidConfig {
                key: ENV_WORKER_THREADS,
                value,
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.degenerate_shape_epsilon.is_finite() || self.degenerate_shape_epsilon < 0.0 {
            return Err(Error::InvalidConfig {
                key: "degenerate_shape_epsilon",
                value: self.degenerate_shape_epsilon.to_string(),
            });
        }
        if self.thread_name_prefix.is_empty() {
            return Err(Error::InvalidConfig {
                key: "thread_name_prefix",
                value: String::new(),
            });
        }
        Ok(())
    }
}

/// Settings for the bundled rapier scene backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RapierSceneConfig {
    /// Upper bound on shape casts per multi sweep.
    pub max_sweep_hits: usize,
}

impl Default for RapierSceneConfig {
    fn default() -> Self {
        Self { max_sweep_hits: 64 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = AsyncTraceConfig::from_json_str(r#"{ "worker_threads": 3 }"#).unwrap();
        assert_eq!(config.worker_threads, 3);
        assert!(config.run_on_worker_threads);
        assert_eq!(config.thread_name_prefix, "async-trace");
        assert_eq!(config.degenerate_shape_epsilon, DEFAULT_SHAPE_EPSILON);
    }

    #[test]
    fn test_invalid_json_and_values() {
        assert!(matches!(
            AsyncTraceConfig::from_json_str("{ not json"),
            Err(Error::Json(_))
        ));
        let err = AsyncTraceConfig::from_json_str(r#"{ "degenerate_shape_epsilon": -1.0 }"#).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidConfig {
                key: "degenerate_shape_epsilon",
                ..
            }
        ));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> =
            [(ENV_RUN_ON_WORKERS, "off"), (ENV_WORKER_THREADS, " 6 ")].into_iter().collect();
        let config = AsyncTraceConfig::default()
            .with_overrides_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert!(!config.run_on_worker_threads);
        assert_eq!(config.worker_threads, 6);

        let err = AsyncTraceConfig::default()
            .with_overrides_from(|k| (k == ENV_WORKER_THREADS).then(|| "many".to_string()))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid config value for `ASYNC_TRACE_WORKER_THREADS`: many"
        );
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = AsyncTraceConfig::from_json_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err.root(), Error::Io(_)));
        assert!(err.to_string().starts_with("reading /definitely/not/here.json"));
    }
}
