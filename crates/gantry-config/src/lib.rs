//! Configuration loading, validation, and merging for the gantry runtime.
//!
//! This crate provides [`GantryConfig`] — the top-level runtime settings —
//! together with helpers for loading from TOML files, applying environment
//! overrides, merging overlays, and producing advisory [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

impl ConfigError {
    /// Bridge to the unified wire error taxonomy.
    #[must_use]
    pub fn code(&self) -> gantry_error::ErrorCode {
        gantry_error::ErrorCode::ConfigError
    }
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The pepper was sourced from an empty/default environment rather than
    /// an explicit 32-byte secret — fine for local development, not for prod.
    WeakPepper,
    /// `artifact_mode = "filesystem"` but no `artifact_dir` was configured;
    /// the default `./gantry-artifacts` is being used.
    MissingArtifactDir,
    /// A session TTL longer than 24 hours was configured.
    LongSessionTtl {
        /// The configured TTL, in milliseconds.
        ttl_ms: u64,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::WeakPepper => {
                write!(f, "GANTRY_PEPPER not set — using an insecure development default")
            }
            ConfigWarning::MissingArtifactDir => {
                write!(f, "artifact_mode is 'filesystem' but artifact_dir was not set")
            }
            ConfigWarning::LongSessionTtl { ttl_ms } => {
                write!(f, "session_ttl_ms is unusually large ({ttl_ms}ms)")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Where captured artifacts are stored.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactMode {
    /// Kept entirely in process memory (default, used in tests).
    Memory,
    /// Large payloads spill to files under `artifact_dir`.
    Filesystem,
    /// Delegated to a caller-supplied external sink.
    External,
}

/// A named regular expression applied to text artifact content before capture.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct RedactionRule {
    /// Human-readable rule name, e.g. `"api_key"`.
    pub name: String,
    /// The regular expression pattern.
    pub pattern: String,
}

/// Top-level runtime configuration for the gantry execution core.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct GantryConfig {
    /// Name of the environment variable holding the base64-encoded 32-byte pepper.
    #[serde(default = "default_pepper_env_var")]
    pub pepper_env_var: String,

    /// Artifact storage mode.
    #[serde(default)]
    pub artifact_mode: ArtifactMode,

    /// Whether `debug`-level logs are also written as artifacts.
    #[serde(default)]
    pub artifact_verbose: bool,

    /// Filesystem root for `artifact_mode = "filesystem"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_dir: Option<String>,

    /// Maximum size, in bytes, for an artifact to be stored inline.
    #[serde(default = "default_max_inline_bytes")]
    pub max_inline_bytes: u64,

    /// Default vault session TTL, in milliseconds.
    #[serde(default = "default_session_ttl_ms")]
    pub session_ttl_ms: u64,

    /// Log level passed to the `tracing-subscriber` `EnvFilter`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Configurable redaction-rule set applied to captured artifacts.
    #[serde(default = "default_redaction_rules")]
    pub redaction_rules: Vec<RedactionRule>,
}

impl Default for ArtifactMode {
    fn default() -> Self {
        Self::Memory
    }
}

fn default_pepper_env_var() -> String {
    "GANTRY_PEPPER".to_string()
}

fn default_max_inline_bytes() -> u64 {
    64 * 1024
}

fn default_session_ttl_ms() -> u64 {
    60 * 60 * 1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_redaction_rules() -> Vec<RedactionRule> {
    vec![
        RedactionRule {
            name: "api_key".into(),
            pattern: r"(?i)(api[_-]?key|secret)[\s:=]+[A-Za-z0-9_\-]{16,}".into(),
        },
        RedactionRule {
            name: "email".into(),
            pattern: r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}".into(),
        },
        RedactionRule {
            name: "phone".into(),
            pattern: r"\+?\d{1,2}[\s.-]?\(?\d{3}\)?[\s.-]?\d{3}[\s.-]?\d{4}".into(),
        },
        RedactionRule {
            name: "ssn".into(),
            pattern: r"\d{3}-\d{2}-\d{4}".into(),
        },
        RedactionRule {
            name: "credit_card".into(),
            pattern: r"\d{4}[\s-]?\d{4}[\s-]?\d{4}[\s-]?\d{4}".into(),
        },
    ]
}

impl Default for GantryConfig {
    fn default() -> Self {
        Self {
            pepper_env_var: default_pepper_env_var(),
            artifact_mode: ArtifactMode::default(),
            artifact_verbose: false,
            artifact_dir: None,
            max_inline_bytes: default_max_inline_bytes(),
            session_ttl_ms: default_session_ttl_ms(),
            log_level: default_log_level(),
            redaction_rules: default_redaction_rules(),
        }
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];
const SESSION_TTL_WARN_THRESHOLD_MS: u64 = 24 * 60 * 60 * 1000;

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a [`GantryConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, returns [`GantryConfig::default()`].
///
/// Environment variable overrides are applied on top in both cases.
pub fn load_config(path: Option<&Path>) -> Result<GantryConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => GantryConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into a [`GantryConfig`].
pub fn parse_toml(content: &str) -> Result<GantryConfig, ConfigError> {
    toml::from_str::<GantryConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides.
///
/// Recognised variables:
/// - `GANTRY_LOG_LEVEL`
/// - `GANTRY_ARTIFACT_MODE` (`memory | filesystem | external`)
/// - `GANTRY_ARTIFACT_VERBOSE`
/// - `GANTRY_ARTIFACT_DIR`
/// - `GANTRY_SESSION_TTL_MS`
pub fn apply_env_overrides(config: &mut GantryConfig) {
    if let Ok(val) = std::env::var("GANTRY_LOG_LEVEL") {
        config.log_level = val;
    }
    if let Ok(val) = std::env::var("GANTRY_ARTIFACT_MODE") {
        config.artifact_mode = match val.as_str() {
            "filesystem" => ArtifactMode::Filesystem,
            "external" => ArtifactMode::External,
            _ => ArtifactMode::Memory,
        };
    }
    if let Ok(val) = std::env::var("GANTRY_ARTIFACT_VERBOSE") {
        config.artifact_verbose = matches!(val.as_str(), "1" | "true" | "yes");
    }
    if let Ok(val) = std::env::var("GANTRY_ARTIFACT_DIR") {
        config.artifact_dir = Some(val);
    }
    if let Ok(val) = std::env::var("GANTRY_SESSION_TTL_MS") {
        if let Ok(ms) = val.parse::<u64>() {
            config.session_ttl_ms = ms;
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (invalid log level, empty redaction pattern) are returned as
/// a [`ConfigError::ValidationError`] accumulating every problem found; soft
/// issues come back as warnings.
pub fn validate_config(config: &GantryConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if !VALID_LOG_LEVELS.contains(&config.log_level.as_str()) {
        errors.push(format!("invalid log_level '{}'", config.log_level));
    }

    if config.max_inline_bytes == 0 {
        errors.push("max_inline_bytes must be greater than zero".into());
    }

    if config.session_ttl_ms == 0 {
        errors.push("session_ttl_ms must be greater than zero".into());
    } else if config.session_ttl_ms > SESSION_TTL_WARN_THRESHOLD_MS {
        warnings.push(ConfigWarning::LongSessionTtl {
            ttl_ms: config.session_ttl_ms,
        });
    }

    for rule in &config.redaction_rules {
        if rule.name.trim().is_empty() {
            errors.push("redaction rule name must not be empty".into());
        }
        if rule.pattern.trim().is_empty() {
            errors.push(format!("redaction rule '{}' has an empty pattern", rule.name));
        } else if regex_lite_is_invalid(&rule.pattern) {
            errors.push(format!(
                "redaction rule '{}' has an unbalanced pattern",
                rule.name
            ));
        }
    }

    if matches!(config.artifact_mode, ArtifactMode::Filesystem) && config.artifact_dir.is_none() {
        warnings.push(ConfigWarning::MissingArtifactDir);
    }

    if std::env::var(&config.pepper_env_var).is_err() {
        warnings.push(ConfigWarning::WeakPepper);
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

/// Cheap structural sanity check (balanced parens/brackets) for a regex
/// pattern, avoiding a hard dependency on a regex crate just for config
/// validation.
fn regex_lite_is_invalid(pattern: &str) -> bool {
    let mut depth: i32 = 0;
    for c in pattern.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
        if depth < 0 {
            return true;
        }
    }
    depth != 0
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// Merge two configurations. Values in `overlay` take precedence over `base`.
///
/// Redaction rules are combined by name; on name collisions the overlay
/// entry wins.
pub fn merge_configs(base: GantryConfig, overlay: GantryConfig) -> GantryConfig {
    let mut rules: Vec<RedactionRule> = base.redaction_rules;
    for overlay_rule in overlay.redaction_rules {
        if let Some(existing) = rules.iter_mut().find(|r| r.name == overlay_rule.name) {
            *existing = overlay_rule;
        } else {
            rules.push(overlay_rule);
        }
    }

    GantryConfig {
        pepper_env_var: overlay.pepper_env_var,
        artifact_mode: overlay.artifact_mode,
        artifact_verbose: overlay.artifact_verbose,
        artifact_dir: overlay.artifact_dir.or(base.artifact_dir),
        max_inline_bytes: overlay.max_inline_bytes,
        session_ttl_ms: overlay.session_ttl_ms,
        log_level: overlay.log_level,
        redaction_rules: rules,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_has_sensible_defaults() {
        let cfg = GantryConfig::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.max_inline_bytes, 64 * 1024);
        assert_eq!(cfg.session_ttl_ms, 60 * 60 * 1000);
        assert_eq!(cfg.redaction_rules.len(), 5);
    }

    #[test]
    #[allow(unsafe_code)]
    fn default_config_validates_with_warnings_only() {
        // SAFETY: test runs single-threaded within this process for env state.
        unsafe { std::env::remove_var("GANTRY_PEPPER") };
        let cfg = GantryConfig::default();
        let warnings = validate_config(&cfg).expect("default config should be structurally valid");
        assert!(warnings.contains(&ConfigWarning::WeakPepper));
    }

    #[test]
    fn parse_valid_toml_string() {
        let toml = r#"
            log_level = "debug"
            artifact_mode = "filesystem"
            artifact_dir = "/tmp/artifacts"
        "#;
        let cfg = parse_toml(toml).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert!(matches!(cfg.artifact_mode, ArtifactMode::Filesystem));
        assert_eq!(cfg.artifact_dir.as_deref(), Some("/tmp/artifacts"));
    }

    #[test]
    fn parse_invalid_toml_gives_parse_error() {
        let bad = "this is [not valid toml =";
        let err = parse_toml(bad).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn validation_catches_invalid_log_level() {
        let cfg = GantryConfig {
            log_level: "verbose".into(),
            ..Default::default()
        };
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn validation_accumulates_multiple_errors() {
        let cfg = GantryConfig {
            log_level: "verbose".into(),
            max_inline_bytes: 0,
            session_ttl_ms: 0,
            ..Default::default()
        };
        match validate_config(&cfg).unwrap_err() {
            ConfigError::ValidationError { reasons } => assert!(reasons.len() >= 3),
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[test]
    fn validation_catches_empty_redaction_pattern() {
        let mut cfg = GantryConfig::default();
        cfg.redaction_rules.push(RedactionRule {
            name: "custom".into(),
            pattern: "".into(),
        });
        let err = validate_config(&cfg).unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("empty pattern")));
            }
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[test]
    fn validation_warns_on_missing_artifact_dir() {
        let cfg = GantryConfig {
            artifact_mode: ArtifactMode::Filesystem,
            ..Default::default()
        };
        let warnings = validate_config(&cfg).unwrap();
        assert!(warnings.contains(&ConfigWarning::MissingArtifactDir));
    }

    #[test]
    fn validation_warns_on_long_session_ttl() {
        let cfg = GantryConfig {
            session_ttl_ms: SESSION_TTL_WARN_THRESHOLD_MS + 1,
            ..Default::default()
        };
        let warnings = validate_config(&cfg).unwrap();
        assert!(matches!(
            warnings.iter().find(|w| matches!(w, ConfigWarning::LongSessionTtl { .. })),
            Some(ConfigWarning::LongSessionTtl { .. })
        ));
    }

    #[test]
    fn merge_overlay_overrides_base() {
        let base = GantryConfig {
            log_level: "info".into(),
            ..Default::default()
        };
        let overlay = GantryConfig {
            log_level: "debug".into(),
            ..Default::default()
        };
        let merged = merge_configs(base, overlay);
        assert_eq!(merged.log_level, "debug");
    }

    #[test]
    fn merge_combines_redaction_rules_by_name() {
        let base = GantryConfig {
            redaction_rules: vec![RedactionRule {
                name: "api_key".into(),
                pattern: "old".into(),
            }],
            ..Default::default()
        };
        let overlay = GantryConfig {
            redaction_rules: vec![
                RedactionRule {
                    name: "api_key".into(),
                    pattern: "new".into(),
                },
                RedactionRule {
                    name: "custom".into(),
                    pattern: "x".into(),
                },
            ],
            ..Default::default()
        };
        let merged = merge_configs(base, overlay);
        assert_eq!(merged.redaction_rules.len(), 2);
        assert!(merged
            .redaction_rules
            .iter()
            .any(|r| r.name == "api_key" && r.pattern == "new"));
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = GantryConfig {
            log_level: "debug".into(),
            artifact_dir: Some("/ws".into()),
            ..Default::default()
        };
        let serialized = toml::to_string(&cfg).unwrap();
        let deserialized: GantryConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(cfg, deserialized);
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gantry.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "log_level = \"warn\"").unwrap();
        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.log_level, "warn");
    }

    #[test]
    fn load_missing_file_gives_file_not_found() {
        let err = load_config(Some(Path::new("/nonexistent/gantry.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn load_none_returns_default() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn config_error_maps_to_wire_code() {
        let e = ConfigError::FileNotFound { path: "/x".into() };
        assert_eq!(e.code(), gantry_error::ErrorCode::ConfigError);
    }
}
