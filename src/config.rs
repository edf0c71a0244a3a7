// =============================================================================
// Risk Configuration — rule set, dry-run flag, atomic save
// =============================================================================
//
// The config document lives at `config/risk_manager_config.json`. Every field
// carries a serde default so older files keep loading as fields are added.
// A risk daemon must not refuse to start over a bad config: a missing file is
// replaced with the safe default document, and an unreadable one falls back
// to the same default in memory (the caller logs and audits the warning).
//
// Persistence uses the tmp + rename pattern to prevent corruption on crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_CONFIG_PATH: &str = "config/risk_manager_config.json";

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_symbols() -> Vec<String> {
    vec!["MNQ".to_string()]
}

fn default_severity() -> Severity {
    Severity::Medium
}

// ---------------------------------------------------------------------------
// Rule descriptors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// One entry under `rules` in the config document. `parameters` is a
/// free-form map interpreted by the rule module itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
}

impl RuleConfig {
    pub fn param_f64(&self, key: &str, fallback: f64) -> f64 {
        self.parameters.get(key).and_then(Value::as_f64).unwrap_or(fallback)
    }

    pub fn param_i64(&self, key: &str, fallback: i64) -> i64 {
        self.parameters.get(key).and_then(Value::as_i64).unwrap_or(fallback)
    }
}

// ---------------------------------------------------------------------------
// RiskConfig
// ---------------------------------------------------------------------------

/// Top-level configuration for the risk daemon.
///
/// Rules are kept in declaration order: the dispatcher evaluates them in the
/// order they appear in the file and the first breach wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// When true, rules evaluate and audit but enforcement is suppressed.
    #[serde(default = "default_true")]
    pub dry_run: bool,

    /// Default technical-log level when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Symbols the account is expected to trade.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Risk rules keyed by module name.
    #[serde(default)]
    pub rules: IndexMap<String, RuleConfig>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        let mut parameters = serde_json::Map::new();
        parameters.insert("max_contracts".to_string(), Value::from(4));
        parameters.insert("enforcement".to_string(), Value::from("flatten"));

        let mut rules = IndexMap::new();
        rules.insert(
            "max_contracts".to_string(),
            RuleConfig {
                enabled: true,
                severity: Severity::High,
                description: "Restricts maximum contracts per position".to_string(),
                parameters,
            },
        );

        Self {
            dry_run: true,
            log_level: default_log_level(),
            symbols: default_symbols(),
            rules,
        }
    }
}

impl RiskConfig {
    /// Load the config from `path`. If the file does not exist, the default
    /// document is written there first and returned. Read or parse failures
    /// are errors so the caller can fall back to defaults with a warning.
    pub fn load_or_init(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            let config = Self::default();
            config
                .save(path)
                .with_context(|| format!("failed to write default config to {}", path.display()))?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        Ok(config)
    }

    /// Persist the configuration to `path` atomically (write to `.tmp`, then
    /// rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config dir {}", parent.display()))?;
        }

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        Ok(())
    }

    /// Enabled rules in declaration order.
    pub fn enabled_rules(&self) -> impl Iterator<Item = (&String, &RuleConfig)> {
        self.rules.iter().filter(|(_, cfg)| cfg.enabled)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RiskConfig::default();
        assert!(cfg.dry_run);
        assert_eq!(cfg.log_level, "INFO");
        assert_eq!(cfg.symbols, vec!["MNQ"]);
        assert_eq!(cfg.rules.len(), 1);
        let rule = &cfg.rules["max_contracts"];
        assert!(rule.enabled);
        assert_eq!(rule.severity, Severity::High);
        assert_eq!(rule.param_i64("max_contracts", 0), 4);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RiskConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.dry_run);
        assert_eq!(cfg.symbols, vec!["MNQ"]);
        assert!(cfg.rules.is_empty());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "dry_run": false, "symbols": ["MNQ", "MES"] }"#;
        let cfg: RiskConfig = serde_json::from_str(json).unwrap();
        assert!(!cfg.dry_run);
        assert_eq!(cfg.symbols, vec!["MNQ", "MES"]);
        assert_eq!(cfg.log_level, "INFO");
    }

    #[test]
    fn rules_preserve_declaration_order() {
        let json = r#"{
            "rules": {
                "daily_loss": { "enabled": true, "severity": "high", "parameters": { "max_usd": 200 } },
                "max_contracts": { "enabled": true, "severity": "high", "parameters": { "max_contracts": 4 } }
            }
        }"#;
        let cfg: RiskConfig = serde_json::from_str(json).unwrap();
        let names: Vec<&str> = cfg.enabled_rules().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["daily_loss", "max_contracts"]);
    }

    #[test]
    fn enabled_rules_skips_disabled() {
        let json = r#"{
            "rules": {
                "max_contracts": { "enabled": false },
                "daily_loss": { "enabled": true, "parameters": { "max_usd": 150 } }
            }
        }"#;
        let cfg: RiskConfig = serde_json::from_str(json).unwrap();
        let names: Vec<&str> = cfg.enabled_rules().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["daily_loss"]);
    }

    #[test]
    fn missing_file_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config/risk_manager_config.json");
        let cfg = RiskConfig::load_or_init(&path).unwrap();
        assert!(cfg.dry_run);
        assert!(path.exists());

        // Second load reads the file that was just written.
        let reloaded = RiskConfig::load_or_init(&path).unwrap();
        assert_eq!(reloaded.symbols, cfg.symbols);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("risk_manager_config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(RiskConfig::load_or_init(&path).is_err());
    }

    #[test]
    fn save_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("risk_manager_config.json");
        let cfg = RiskConfig::default();
        cfg.save(&path).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RiskConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RiskConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.dry_run, cfg2.dry_run);
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(
            cfg.rules["max_contracts"].param_i64("max_contracts", 0),
            cfg2.rules["max_contracts"].param_i64("max_contracts", 0)
        );
    }

    #[test]
    fn rule_parameter_fallbacks() {
        let rule: RuleConfig = serde_json::from_str(r#"{ "enabled": true }"#).unwrap();
        assert_eq!(rule.param_f64("max_usd", 200.0), 200.0);
        assert_eq!(rule.param_i64("max_contracts", 4), 4);
        assert_eq!(rule.severity, Severity::Medium);
    }
}
