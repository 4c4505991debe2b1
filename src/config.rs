//=====================================================
// File: config.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Engine configuration
// Objective: Load pool sizing, execution limits, privileged callers and the
//            whitelist from TOML, with defaults for everything
//=====================================================

//! Configuration handling for the script engine including loading and defaults.

use crate::scheduler::{DEFAULT_THREAD_PREFIX, PoolConfig};
use crate::whitelist::{Cap, ConfigurationError, InvocationPolicy, WhitelistEntry, WhitelistPolicy};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Worker pool section (`[pool]`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolSettings {
    pub core_workers: usize,
    pub max_workers: usize,
    pub keep_alive_secs: u64,
    /// Worker stack size; deep script recursion needs room here.
    pub stack_size_bytes: usize,
    pub thread_prefix: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            core_workers: 3,
            max_workers: 64,
            keep_alive_secs: 60,
            stack_size_bytes: 16 * 1024 * 1024,
            thread_prefix: DEFAULT_THREAD_PREFIX.to_string(),
        }
    }
}

/// Execution limits section (`[limits]`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitSettings {
    /// Deadline of sandboxed batches.
    pub timeout_ms: u64,
    pub max_total_operations: u64,
    pub max_loop_iterations: u64,
    pub max_call_depth: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_total_operations: 10_000,
            max_loop_iterations: 100_000,
            max_call_depth: 256,
        }
    }
}

/// Privileged caller section (`[security]`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SecuritySettings {
    /// Identities allowed to run privileged batches.
    pub admins: Vec<String>,
}

/// Configuration model for the engine loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolSettings,
    pub limits: LimitSettings,
    pub security: SecuritySettings,
    pub whitelist: Vec<WhitelistEntry>,
}

impl EngineConfig {
    /// Load configuration from `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading configuration from {}", path.display()))?;
        Self::from_toml_str(&data)
            .with_context(|| format!("parsing configuration {}", path.display()))
    }

    pub fn from_toml_str(data: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Persist the configuration back to disk.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let serialized = toml::to_string_pretty(self)?;
        fs::write(path, serialized)
            .with_context(|| format!("writing configuration to {}", path.display()))?;
        Ok(())
    }

    /// Reject settings the engine cannot run with. Whitelist entries are
    /// checked separately against the type catalog.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |name: &'static str, message: &str| {
            Err(ConfigurationError::InvalidSetting {
                name,
                message: message.to_string(),
            })
        };

        if self.pool.max_workers == 0 {
            return invalid("pool.max_workers", "must be at least 1");
        }
        if self.pool.core_workers > self.pool.max_workers {
            return invalid("pool.core_workers", "must not exceed pool.max_workers");
        }
        if self.pool.stack_size_bytes < 64 * 1024 {
            return invalid("pool.stack_size_bytes", "must be at least 65536");
        }
        if self.limits.timeout_ms == 0 {
            return invalid("limits.timeout_ms", "must be positive");
        }
        if self.limits.max_call_depth == 0 {
            return invalid("limits.max_call_depth", "must be positive");
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            core_workers: self.pool.core_workers,
            max_workers: self.pool.max_workers,
            keep_alive: Duration::from_secs(self.pool.keep_alive_secs),
            stack_size: self.pool.stack_size_bytes,
            thread_prefix: self.pool.thread_prefix.clone(),
        }
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.limits.timeout_ms)
    }

    pub fn sandboxed_policy(
        &self,
        whitelist: &WhitelistPolicy,
    ) -> Result<InvocationPolicy, ConfigurationError> {
        InvocationPolicy::sandboxed(
            whitelist,
            Cap::Limited(self.limits.max_total_operations),
            Cap::Limited(self.limits.max_loop_iterations),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::whitelist::MemberKind;

    #[test]
    fn empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").expect("defaults");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.default_deadline(), Duration::from_secs(5));
        assert_eq!(config.pool_config().thread_prefix, "script-execution-pool");
    }

    #[test]
    fn parses_sections_and_entries() {
        let config = EngineConfig::from_toml_str(
            r#"
            [pool]
            max_workers = 8

            [limits]
            timeout_ms = 250

            [security]
            admins = ["root"]

            [[whitelist]]
            type = "Array"
            member = "length"
            kind = "property"

            [[whitelist]]
            type = "String"
            member = "upper"
            cap = 10
            "#,
        )
        .expect("config");

        assert_eq!(config.pool.max_workers, 8);
        assert_eq!(config.pool.core_workers, 3);
        assert_eq!(config.limits.timeout_ms, 250);
        assert_eq!(config.security.admins, vec!["root".to_string()]);
        assert_eq!(config.whitelist[0].kind, MemberKind::Property);
        assert_eq!(config.whitelist[1].cap, Some(10));
    }

    #[test]
    fn rejects_impossible_pool_sizes() {
        let err = EngineConfig::from_toml_str("[pool]\ncore_workers = 9\nmax_workers = 2\n")
            .expect_err("invalid");
        assert!(err.to_string().contains("pool.core_workers"));
    }

    #[test]
    fn zero_operation_budget_is_a_configuration_error() {
        let config = EngineConfig::from_toml_str("[limits]\nmax_total_operations = 0\n")
            .expect("parses");
        let whitelist = WhitelistPolicy::default();
        assert!(matches!(
            config.sandboxed_policy(&whitelist),
            Err(ConfigurationError::UnboundedGlobalCap { .. })
        ));
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.toml");
        let mut config = EngineConfig::default();
        config.whitelist.push(WhitelistEntry::method("String", "trim").with_cap(2));
        config.save(&path).expect("save");

        assert_eq!(EngineConfig::load(&path).expect("load"), config);
        assert!(EngineConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}

//=====================================================
// End of file
//=====================================================
