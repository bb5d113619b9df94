//! Runtime configuration.
//!
//! Settings are per thread, matching the thread-local allocator and
//! generator. Call [`init`] on each thread that should use them.

use crate::device;
use crate::error::TensorError;
use crate::random;
use std::str::FromStr;

pub const ENV_SEED: &str = "NDGRAD_SEED";
pub const ENV_CPU_MEMORY_LIMIT: &str = "NDGRAD_CPU_MEMORY_LIMIT";
pub const ENV_ACCELERATOR_MEMORY_LIMIT: &str = "NDGRAD_ACCELERATOR_MEMORY_LIMIT";
pub const ENV_ACCELERATORS: &str = "NDGRAD_ACCELERATORS";

/// Per-thread runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Generator seed; `None` keeps the entropy-seeded generator.
    pub seed: Option<u64>,
    /// CPU byte budget; `None` for unlimited.
    pub cpu_memory_limit: Option<usize>,
    /// Byte budget of each accelerator; `None` for unlimited.
    pub accelerator_memory_limit: Option<usize>,
    /// Number of accelerator ordinals that accept allocations.
    pub accelerator_count: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: None,
            cpu_memory_limit: None,
            accelerator_memory_limit: None,
            accelerator_count: 1,
        }
    }
}

impl RuntimeConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_cpu_memory_limit(mut self, bytes: usize) -> Self {
        self.cpu_memory_limit = Some(bytes);
        self
    }

    pub fn with_accelerator_memory_limit(mut self, bytes: usize) -> Self {
        self.accelerator_memory_limit = Some(bytes);
        self
    }

    pub fn with_accelerator_count(mut self, count: usize) -> Self {
        self.accelerator_count = count;
        self
    }

    /// Read settings from `NDGRAD_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    /// `InvalidConfig` if a variable is set but does not parse.
    pub fn from_env() -> Result<Self, TensorError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`RuntimeConfig::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, TensorError> {
        let mut config = Self::default();
        if let Some(seed) = parse_var(&lookup, ENV_SEED)? {
            config.seed = Some(seed);
        }
        if let Some(limit) = parse_var(&lookup, ENV_CPU_MEMORY_LIMIT)? {
            config.cpu_memory_limit = Some(limit);
        }
        if let Some(limit) = parse_var(&lookup, ENV_ACCELERATOR_MEMORY_LIMIT)? {
            config.accelerator_memory_limit = Some(limit);
        }
        if let Some(count) = parse_var(&lookup, ENV_ACCELERATORS)? {
            config.accelerator_count = count;
        }
        Ok(config)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, TensorError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| TensorError::InvalidConfig {
                key: key.to_string(),
                value: raw,
            }),
    }
}

/// Apply `config` to the current thread.
pub fn init(config: &RuntimeConfig) {
    log::debug!("applying runtime config {config:?}");
    device::configure(
        config.cpu_memory_limit,
        config.accelerator_memory_limit,
        config.accelerator_count,
    );
    if let Some(seed) = config.seed {
        random::manual_seed(seed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, memory_stats};
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.accelerator_count, 1);
    }

    #[test]
    fn test_parse_vars() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (ENV_SEED, "42"),
            (ENV_CPU_MEMORY_LIMIT, "1024"),
            (ENV_ACCELERATORS, " 2 "),
        ]))
        .unwrap();
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.cpu_memory_limit, Some(1024));
        assert_eq!(config.accelerator_memory_limit, None);
        assert_eq!(config.accelerator_count, 2);
    }

    #[test]
    fn test_invalid_value() {
        let err = RuntimeConfig::from_lookup(lookup(&[(ENV_SEED, "abc")])).unwrap_err();
        assert!(matches!(err, TensorError::InvalidConfig { ref key, .. } if key == ENV_SEED));
    }

    #[test]
    fn test_init_applies_limits() {
        init(&RuntimeConfig::default().with_accelerator_memory_limit(256));
        assert_eq!(memory_stats(Device::Accelerator(0)).limit, Some(256));
        init(&RuntimeConfig::default());
        assert_eq!(memory_stats(Device::Accelerator(0)).limit, None);
    }
}
