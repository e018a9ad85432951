//! Server configuration types
//!
//! Contains all configuration structures for the coderun server.

use coderun_core::SessionConfig;
use coderun_sandbox::{LanguageProfile, NetworkMode, ResourceLimits, SandboxConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub sessions: SessionSettings,
    /// Language profiles merged over the built-in ones
    #[serde(default)]
    pub languages: HashMap<String, LanguageProfile>,
}

impl AppConfig {
    /// Process runner configuration
    pub fn sandbox_config(&self) -> SandboxConfig {
        let mut languages = LanguageProfile::builtins();
        languages.extend(self.languages.clone());

        SandboxConfig {
            runtime_preference: self.sandbox.runtime.clone(),
            image: self.sandbox.image.clone(),
            network: self.sandbox.network,
            security_opts: self.sandbox.security_opts.clone(),
            limits: self.sandbox.limits.to_resource_limits(),
            allow_unsandboxed: self.sandbox.allow_unsandboxed,
            languages,
            default_language: self.sessions.default_language.clone(),
        }
    }

    /// Session Manager limits
    pub fn session_config(&self) -> SessionConfig {
        let s = &self.sessions;
        SessionConfig {
            max_sessions: s.max_sessions,
            max_concurrent_runs: s.max_concurrent_runs,
            transcript_bytes: s.transcript_bytes,
            runs_per_minute: s.runs_per_minute,
            max_source_bytes: s.max_source_bytes,
            max_line_bytes: s.max_line_bytes,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
            auth: AuthConfig::default(),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Enable authentication
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Auto-generate admin API key on first run
    #[serde(default = "default_true")]
    pub auto_generate_key: bool,
    /// Statically configured keys (SHA-256 hashes, see `coderun keygen`)
    #[serde(default)]
    pub api_keys: Vec<ApiKeyEntry>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_generate_key: true,
            api_keys: Vec::new(),
        }
    }
}

/// A pre-hashed API key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    pub user: String,
    /// Hex SHA-256 of the raw key
    pub hash: String,
    #[serde(default)]
    pub label: String,
    /// Grant Admin instead of the default client scopes
    #[serde(default)]
    pub admin: bool,
}

/// `[sandbox]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    /// auto | docker | apple_container | none
    #[serde(default = "default_runtime")]
    pub runtime: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default)]
    pub network: NetworkMode,
    #[serde(default = "default_security_opts")]
    pub security_opts: Vec<String>,
    /// Run programs directly on the host when no container runtime exists
    #[serde(default)]
    pub allow_unsandboxed: bool,
    #[serde(default)]
    pub limits: LimitSettings,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            image: default_image(),
            network: NetworkMode::default(),
            security_opts: default_security_opts(),
            allow_unsandboxed: false,
            limits: LimitSettings::default(),
        }
    }
}

fn default_runtime() -> String {
    "auto".to_string()
}

fn default_image() -> String {
    "gcc:13".to_string()
}

fn default_security_opts() -> Vec<String> {
    vec!["no-new-privileges:true".to_string()]
}

/// `[sandbox.limits]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_cpu_percent")]
    pub cpu_percent: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_compile_timeout_secs")]
    pub compile_timeout_secs: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_max_pids")]
    pub max_pids: u32,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            memory_mb: default_memory_mb(),
            cpu_percent: default_cpu_percent(),
            timeout_secs: default_timeout_secs(),
            compile_timeout_secs: default_compile_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            max_pids: default_max_pids(),
        }
    }
}

impl LimitSettings {
    pub fn to_resource_limits(&self) -> ResourceLimits {
        let mut limits = ResourceLimits::default()
            .with_memory_mb(self.memory_mb)
            .with_cpu_percent(self.cpu_percent)
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_compile_timeout(Duration::from_secs(self.compile_timeout_secs))
            .with_max_output_bytes(self.max_output_bytes);
        limits.max_pids = self.max_pids;
        limits
    }
}

fn default_memory_mb() -> u64 {
    256
}
fn default_cpu_percent() -> u32 {
    50
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_compile_timeout_secs() -> u64 {
    20
}
fn default_max_output_bytes() -> usize {
    256 * 1024
}
fn default_max_pids() -> u32 {
    64
}

/// `[sessions]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    #[serde(default = "default_transcript_bytes")]
    pub transcript_bytes: usize,
    #[serde(default = "default_runs_per_minute")]
    pub runs_per_minute: u32,
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: usize,
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    #[serde(default = "default_language")]
    pub default_language: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let core = SessionConfig::default();
        Self {
            max_sessions: core.max_sessions,
            max_concurrent_runs: core.max_concurrent_runs,
            transcript_bytes: core.transcript_bytes,
            runs_per_minute: core.runs_per_minute,
            max_source_bytes: core.max_source_bytes,
            max_line_bytes: core.max_line_bytes,
            default_language: default_language(),
        }
    }
}

fn default_max_sessions() -> usize {
    SessionConfig::default().max_sessions
}
fn default_max_concurrent_runs() -> usize {
    SessionConfig::default().max_concurrent_runs
}
fn default_transcript_bytes() -> usize {
    SessionConfig::default().transcript_bytes
}
fn default_runs_per_minute() -> u32 {
    SessionConfig::default().runs_per_minute
}
fn default_max_source_bytes() -> usize {
    SessionConfig::default().max_source_bytes
}
fn default_max_line_bytes() -> usize {
    SessionConfig::default().max_line_bytes
}
fn default_language() -> String {
    "c".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_builds_valid_sandbox_config() {
        let config = AppConfig::default();
        let sandbox = config.sandbox_config();
        assert!(sandbox.validate().is_ok());
        assert_eq!(sandbox.default_language, "c");
        assert!(!sandbox.allow_unsandboxed);
        assert_eq!(sandbox.limits.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_language_overrides_merge_over_builtins() {
        let mut config = AppConfig::default();
        config.languages.insert(
            "ruby".to_string(),
            LanguageProfile {
                source_file: "main.rb".to_string(),
                compile: None,
                run: vec!["ruby".to_string(), "{source}".to_string()],
                image: Some("ruby:3".to_string()),
            },
        );
        let sandbox = config.sandbox_config();
        assert!(sandbox.languages.contains_key("ruby"));
        assert!(sandbox.languages.contains_key("c"));
        assert!(sandbox.languages.contains_key("sh"));
    }

    #[test]
    fn test_limit_settings_conversion() {
        let limits = LimitSettings {
            memory_mb: 128,
            cpu_percent: 250,
            timeout_secs: 5,
            compile_timeout_secs: 7,
            max_output_bytes: 1000,
            max_pids: 8,
        }
        .to_resource_limits();
        assert_eq!(limits.memory_bytes, 128 * 1024 * 1024);
        assert_eq!(limits.cpu_percent, 100);
        assert_eq!(limits.timeout, Duration::from_secs(5));
        assert_eq!(limits.compile_timeout, Duration::from_secs(7));
        assert_eq!(limits.max_output_bytes, 1000);
        assert_eq!(limits.max_pids, 8);
    }

    #[test]
    fn test_session_config_mapping() {
        let mut config = AppConfig::default();
        config.sessions.runs_per_minute = 3;
        config.sessions.max_sessions = 2;
        let sessions = config.session_config();
        assert_eq!(sessions.runs_per_minute, 3);
        assert_eq!(sessions.max_sessions, 2);
    }
}
