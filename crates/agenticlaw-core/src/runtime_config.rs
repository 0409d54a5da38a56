//! Typed runtime configuration: `<home>/.snow/config.toml` merged over
//! `<project>/.snow/config.toml`, with environment variables covering secrets
//! only. Every field has a default, so an absent file is a valid config.

use crate::types::{AuthConfig, BindMode, GatewayConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// One entry in the sensitive-shell-command rule set, as read from config.
/// Converted into a `SensitiveCommandRule` by the tools layer — this crate
/// has no dependency on `agenticlaw-tools`, so the shape stays data-only.
#[derive(Debug, Clone, Deserialize)]
pub struct SensitiveRuleSpec {
    pub kind: SensitiveRuleKind,
    pub pattern: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SensitiveRuleKind {
    Literal,
    Prefix,
    Regex,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct PartialRetry {
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct PartialGateway {
    port: Option<u16>,
    bind: Option<String>,
    auth_mode: Option<String>,
    auth_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct PartialConfig {
    default_model: Option<String>,
    gateway: PartialGateway,
    retry: PartialRetry,
    idle_timeout_secs: Option<u64>,
    shell_timeout_secs: Option<u64>,
    sleep_threshold_pct: Option<f64>,
    sensitive_commands: Option<Vec<SensitiveRuleSpec>>,
    subagent_profile_paths: Option<Vec<String>>,
}

/// Retry bounds for the provider stream (C2).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

/// The merged, typed runtime configuration (C15). Loaded once at startup and
/// threaded through as part of `AppContext`-equivalent construction.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub default_model: String,
    pub gateway: GatewayConfig,
    pub retry: RetryConfig,
    pub idle_timeout_secs: u64,
    pub shell_timeout_secs: u64,
    pub sleep_threshold_pct: f64,
    /// Empty means "use the built-in default set" — see
    /// `agenticlaw_tools::permission::default_sensitive_rules`.
    pub sensitive_commands: Vec<SensitiveRuleSpec>,
    pub subagent_profile_paths: Vec<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_model: "claude-opus-4-6-20250929".to_string(),
            gateway: GatewayConfig::default(),
            retry: RetryConfig::default(),
            idle_timeout_secs: 180,
            shell_timeout_secs: 30,
            sleep_threshold_pct: 0.55,
            sensitive_commands: Vec::new(),
            subagent_profile_paths: Vec::new(),
        }
    }
}

fn read_partial(path: &Path) -> PartialConfig {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| toml::from_str(&s).ok())
        .unwrap_or_default()
}

/// Project overrides global, key by key — a key absent from the project
/// document falls through to whatever the global document (or the hardcoded
/// default) supplied.
fn merge(global: PartialConfig, project: PartialConfig) -> RuntimeConfig {
    let defaults = RuntimeConfig::default();

    let default_model = project
        .default_model
        .or(global.default_model)
        .unwrap_or(defaults.default_model);

    let port = project
        .gateway
        .port
        .or(global.gateway.port)
        .unwrap_or(defaults.gateway.port);
    let bind = project
        .gateway
        .bind
        .or(global.gateway.bind)
        .map(|b| if b == "loopback" { BindMode::Loopback } else { BindMode::Lan })
        .unwrap_or(defaults.gateway.bind);
    let auth_token = project
        .gateway
        .auth_token
        .or(global.gateway.auth_token)
        .or(std::env::var("AGENTICLAW_GATEWAY_TOKEN").ok());
    let auth = AuthConfig {
        mode: defaults.gateway.auth.mode.clone(),
        token: auth_token,
    };

    let retry = RetryConfig {
        base_delay_ms: project
            .retry
            .base_delay_ms
            .or(global.retry.base_delay_ms)
            .unwrap_or(defaults.retry.base_delay_ms),
        max_delay_ms: project
            .retry
            .max_delay_ms
            .or(global.retry.max_delay_ms)
            .unwrap_or(defaults.retry.max_delay_ms),
        max_attempts: project
            .retry
            .max_attempts
            .or(global.retry.max_attempts)
            .unwrap_or(defaults.retry.max_attempts),
    };

    let sensitive_commands = if !project
        .sensitive_commands
        .as_ref()
        .map(|v| v.is_empty())
        .unwrap_or(true)
    {
        project.sensitive_commands.unwrap()
    } else {
        global.sensitive_commands.unwrap_or_default()
    };

    let subagent_profile_paths = if !project
        .subagent_profile_paths
        .as_ref()
        .map(|v| v.is_empty())
        .unwrap_or(true)
    {
        project.subagent_profile_paths.unwrap()
    } else {
        global.subagent_profile_paths.unwrap_or_default()
    }
    .into_iter()
    .map(PathBuf::from)
    .collect();

    RuntimeConfig {
        default_model,
        gateway: GatewayConfig { port, bind, auth },
        retry,
        idle_timeout_secs: project
            .idle_timeout_secs
            .or(global.idle_timeout_secs)
            .unwrap_or(defaults.idle_timeout_secs),
        shell_timeout_secs: project
            .shell_timeout_secs
            .or(global.shell_timeout_secs)
            .unwrap_or(defaults.shell_timeout_secs),
        sleep_threshold_pct: project
            .sleep_threshold_pct
            .or(global.sleep_threshold_pct)
            .unwrap_or(defaults.sleep_threshold_pct),
        sensitive_commands,
        subagent_profile_paths,
    }
}

impl RuntimeConfig {
    /// `<home>/.snow/config.toml` — global defaults.
    pub fn global_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(".snow").join("config.toml")
    }

    /// `<project>/.snow/config.toml` — per-project overrides.
    pub fn project_path(workspace_root: &Path) -> PathBuf {
        workspace_root.join(".snow").join("config.toml")
    }

    /// Load and merge global + project configuration. Environment variables
    /// (`ANTHROPIC_API_KEY`, `AGENTICLAW_GATEWAY_TOKEN`) are consulted for
    /// secrets only, never logged.
    pub fn load(workspace_root: &Path) -> Self {
        let global = read_partial(&Self::global_path());
        let project = read_partial(&Self::project_path(workspace_root));
        merge(global, project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_files_yield_documented_defaults() {
        let cfg = merge(PartialConfig::default(), PartialConfig::default());
        assert_eq!(cfg.default_model, "claude-opus-4-6-20250929");
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.idle_timeout_secs, 180);
        assert!(cfg.sensitive_commands.is_empty());
    }

    #[test]
    fn project_key_overrides_global_key() {
        let mut global = PartialConfig::default();
        global.default_model = Some("global-model".to_string());
        global.retry.max_attempts = Some(9);

        let mut project = PartialConfig::default();
        project.default_model = Some("project-model".to_string());
        // retry left unset at the project level — falls through to global.

        let cfg = merge(global, project);
        assert_eq!(cfg.default_model, "project-model");
        assert_eq!(cfg.retry.max_attempts, 9);
    }

    #[test]
    fn non_empty_project_sensitive_rules_replace_global() {
        let mut global = PartialConfig::default();
        global.sensitive_commands = Some(vec![SensitiveRuleSpec {
            kind: SensitiveRuleKind::Prefix,
            pattern: "rm -rf".to_string(),
            description: "global rule".to_string(),
        }]);

        let mut project = PartialConfig::default();
        project.sensitive_commands = Some(vec![SensitiveRuleSpec {
            kind: SensitiveRuleKind::Literal,
            pattern: "sudo reboot".to_string(),
            description: "project rule".to_string(),
        }]);

        let cfg = merge(global, project);
        assert_eq!(cfg.sensitive_commands.len(), 1);
        assert_eq!(cfg.sensitive_commands[0].description, "project rule");
    }
}
