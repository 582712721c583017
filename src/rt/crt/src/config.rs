//! Runtime configuration.
//!
//! Configuration can be set programmatically or loaded from environment variables. All variables
//! use the `CRT_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `CRT_POOL_CAPACITY` | Slots in the runtime's fixed-block arena | 4096 |
//! | `CRT_INTERRUPT_HOOK` | Hook the OS interrupt ("true"/"false") | true |
//! | `CRT_LOG` | Log filter handed to the subscriber | info |

use std::env;

use tracing::warn;

pub const DEFAULT_POOL_CAPACITY: u32 = 4096;
pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Number of slots in the arena backing the runtime's fixed-block pool.
    pub pool_capacity: u32,
    /// Whether installing the interrupt router also hooks the OS-level interrupt. When false the
    /// router only receives interrupts delivered to it directly.
    pub hook_os_interrupts: bool,
    pub log_filter: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool_capacity: DEFAULT_POOL_CAPACITY,
            hook_os_interrupts: true,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl RuntimeConfig {
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// Load configuration from `CRT_*` environment variables, falling back to defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = lookup("CRT_POOL_CAPACITY") {
            match val.trim().parse::<u32>() {
                Ok(cap) if cap > 0 => config.pool_capacity = cap,
                _ => warn!("ignoring invalid CRT_POOL_CAPACITY: {:?}", val),
            }
        }

        if let Some(val) = lookup("CRT_INTERRUPT_HOOK") {
            match parse_bool(val.trim()) {
                Some(b) => config.hook_os_interrupts = b,
                None => warn!("ignoring invalid CRT_INTERRUPT_HOOK: {:?}", val),
            }
        }

        if let Some(val) = lookup("CRT_LOG") {
            if !val.trim().is_empty() {
                config.log_filter = val.trim().to_string();
            }
        }

        config
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    pub fn pool_capacity(mut self, capacity: u32) -> Self {
        self.config.pool_capacity = capacity;
        self
    }

    pub fn hook_os_interrupts(mut self, hook: bool) -> Self {
        self.config.hook_os_interrupts = hook;
        self
    }

    pub fn log_filter(mut self, filter: impl ToString) -> Self {
        self.config.log_filter = filter.to_string();
        self
    }

    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[]));
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.pool_capacity, DEFAULT_POOL_CAPACITY);
        assert!(config.hook_os_interrupts);
    }

    #[test]
    fn reads_variables() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[
            ("CRT_POOL_CAPACITY", "128"),
            ("CRT_INTERRUPT_HOOK", "off"),
            ("CRT_LOG", "crt_rt=trace"),
        ]));
        assert_eq!(config.pool_capacity, 128);
        assert!(!config.hook_os_interrupts);
        assert_eq!(config.log_filter, "crt_rt=trace");
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = RuntimeConfig::from_lookup(lookup_from(&[
            ("CRT_POOL_CAPACITY", "0"),
            ("CRT_INTERRUPT_HOOK", "maybe"),
        ]));
        assert_eq!(config.pool_capacity, DEFAULT_POOL_CAPACITY);
        assert!(config.hook_os_interrupts);
    }

    #[test]
    fn builder() {
        let config = RuntimeConfig::builder()
            .pool_capacity(8)
            .hook_os_interrupts(false)
            .log_filter("debug")
            .build();
        assert_eq!(config.pool_capacity, 8);
        assert!(!config.hook_os_interrupts);
        assert_eq!(config.log_filter, "debug");
    }
}
