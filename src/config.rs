//! Buffer manager configuration
//!
//! `ZeroCopyConfig` is a plain struct with sensible defaults. Callers either
//! build it with the `with_*` methods or overlay environment variables with
//! [`ZeroCopyConfig::from_env`]:
//!
//! - `HOSTFORGE_STRATEGY`: `copy` | `alloc-host` | `use-host`
//! - `HOSTFORGE_WAIT_TIMEOUT_MS`: wait bound in milliseconds, `0` waits forever
//! - `HOSTFORGE_FALLBACK`: fall back to copy-based buffers (`true`/`false`)
//! - `HOSTFORGE_VERIFY_MAP`: compare mapped pointers with the region base

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ForgeError, ForgeResult};
use crate::zerocopy::BufferStrategy;

const STRATEGY_ENV: &str = "HOSTFORGE_STRATEGY";
const WAIT_TIMEOUT_ENV: &str = "HOSTFORGE_WAIT_TIMEOUT_MS";
const FALLBACK_ENV: &str = "HOSTFORGE_FALLBACK";
const VERIFY_MAP_ENV: &str = "HOSTFORGE_VERIFY_MAP";

/// Default bound for every blocking device wait
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZeroCopyConfig {
    /// Strategy used by `ZeroCopyContext::create_configured_buffer`
    pub strategy: BufferStrategy,
    /// Bound for waits, maps and transfers; `None` blocks until completion
    pub wait_timeout: Option<Duration>,
    /// Retry a failed zero-copy import as a copy-based buffer
    pub fallback_to_copy: bool,
    /// Check that maps of zero-copy bindings return the region base
    pub verify_mapped_pointer: bool,
}

impl Default for ZeroCopyConfig {
    fn default() -> Self {
        Self {
            strategy: BufferStrategy::HostAllocatedZeroCopy,
            wait_timeout: Some(DEFAULT_WAIT_TIMEOUT),
            fallback_to_copy: true,
            verify_mapped_pointer: true,
        }
    }
}

impl ZeroCopyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: BufferStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_fallback_to_copy(mut self, fallback: bool) -> Self {
        self.fallback_to_copy = fallback;
        self
    }

    pub fn with_verify_mapped_pointer(mut self, verify: bool) -> Self {
        self.verify_mapped_pointer = verify;
        self
    }

    /// Reject settings that would make waits meaningless
    pub fn validate(&self) -> ForgeResult<()> {
        if self.wait_timeout == Some(Duration::ZERO) {
            return Err(ForgeError::InvalidConfiguration(
                "wait_timeout of zero would fail every wait; use None to wait forever".to_string(),
            ));
        }
        Ok(())
    }

    /// Defaults overlaid with `HOSTFORGE_*` variables
    pub fn from_env() -> ForgeResult<Self> {
        Self::default().overlay_env()
    }

    /// Overlay `HOSTFORGE_*` variables onto this config
    pub fn overlay_env(mut self) -> ForgeResult<Self> {
        if let Some(value) = env_var(STRATEGY_ENV) {
            self.strategy = BufferStrategy::from_str(&value).ok_or_else(|| {
                ForgeError::InvalidConfiguration(format!(
                    "{}={} (expected copy, alloc-host or use-host)",
                    STRATEGY_ENV, value
                ))
            })?;
        }
        if let Some(value) = env_var(WAIT_TIMEOUT_ENV) {
            let millis: u64 = value.parse().map_err(|_| {
                ForgeError::InvalidConfiguration(format!("{}={} is not a number", WAIT_TIMEOUT_ENV, value))
            })?;
            self.wait_timeout = (millis > 0).then(|| Duration::from_millis(millis));
        }
        if let Some(value) = env_var(FALLBACK_ENV) {
            self.fallback_to_copy = parse_bool(FALLBACK_ENV, &value)?;
        }
        if let Some(value) = env_var(VERIFY_MAP_ENV) {
            self.verify_mapped_pointer = parse_bool(VERIFY_MAP_ENV, &value)?;
        }
        self.validate()?;
        Ok(self)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(name: &str, value: &str) -> ForgeResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ForgeError::InvalidConfiguration(format!(
            "{}={} is not a boolean",
            name, value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for name in [STRATEGY_ENV, WAIT_TIMEOUT_ENV, FALLBACK_ENV, VERIFY_MAP_ENV] {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn test_defaults() {
        let config = ZeroCopyConfig::default();
        assert_eq!(config.strategy, BufferStrategy::HostAllocatedZeroCopy);
        assert_eq!(config.wait_timeout, Some(Duration::from_secs(30)));
        assert!(config.fallback_to_copy);
        assert!(config.verify_mapped_pointer);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = ZeroCopyConfig::new().with_wait_timeout(Some(Duration::ZERO));
        assert!(matches!(
            config.validate(),
            Err(ForgeError::InvalidConfiguration(_))
        ));
    }

    #[test]
    #[serial]
    fn test_env_overlay() {
        clear_env();
        std::env::set_var(STRATEGY_ENV, "copy");
        std::env::set_var(WAIT_TIMEOUT_ENV, "0");
        std::env::set_var(FALLBACK_ENV, "off");
        let config = ZeroCopyConfig::from_env();
        clear_env();

        let config = config.unwrap();
        assert_eq!(config.strategy, BufferStrategy::CopyBased);
        assert_eq!(config.wait_timeout, None);
        assert!(!config.fallback_to_copy);
        assert!(config.verify_mapped_pointer);
    }

    #[test]
    #[serial]
    fn test_env_overlay_rejects_garbage() {
        clear_env();
        std::env::set_var(WAIT_TIMEOUT_ENV, "soon");
        let result = ZeroCopyConfig::from_env();
        clear_env();
        assert!(result.is_err());

        std::env::set_var(STRATEGY_ENV, "mmap");
        let result = ZeroCopyConfig::from_env();
        clear_env();
        assert!(result.is_err());
    }

    #[test]
    fn test_serde_defaults_fill_missing_fields() {
        let config: ZeroCopyConfig =
            serde_json::from_str(r#"{"strategy":"copy-based","fallback_to_copy":false}"#).unwrap();
        assert_eq!(config.strategy, BufferStrategy::CopyBased);
        assert!(!config.fallback_to_copy);
        assert_eq!(config.wait_timeout, Some(DEFAULT_WAIT_TIMEOUT));
    }
}
