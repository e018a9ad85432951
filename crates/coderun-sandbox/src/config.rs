//! Runner configuration

use crate::error::{Error, Result};
use crate::language::LanguageProfile;
use crate::limits::ResourceLimits;
use crate::runtime::ContainerRuntime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Network mode for sandboxed execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// No network access (default)
    #[default]
    None,
    /// Bridge network
    Bridge,
    /// Host network (not recommended)
    Host,
}

impl NetworkMode {
    /// Docker network mode string
    #[must_use]
    pub fn as_docker_arg(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bridge => "bridge",
            Self::Host => "host",
        }
    }

    /// Apple Container network mode string
    #[must_use]
    pub fn as_apple_container_arg(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bridge => "nat",
            Self::Host => "host",
        }
    }
}

/// Configuration for the process runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Preferred runtime: "auto", "docker", "apple_container", "none"
    #[serde(default = "default_runtime_preference")]
    pub runtime_preference: String,
    /// Default container image
    pub image: String,
    /// Container network mode
    #[serde(default)]
    pub network: NetworkMode,
    /// Additional security options (Docker only)
    #[serde(default)]
    pub security_opts: Vec<String>,
    /// Default resource limits
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Permit native execution when no container runtime is available
    #[serde(default)]
    pub allow_unsandboxed: bool,
    /// Language profiles keyed by name
    #[serde(default = "LanguageProfile::builtins")]
    pub languages: HashMap<String, LanguageProfile>,
    /// Profile used when a request names none
    #[serde(default = "default_language")]
    pub default_language: String,
}

fn default_runtime_preference() -> String {
    "auto".to_string()
}

fn default_language() -> String {
    "c".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime_preference: default_runtime_preference(),
            image: "gcc:13".to_string(),
            network: NetworkMode::None,
            security_opts: vec!["no-new-privileges:true".to_string()],
            limits: ResourceLimits::default(),
            allow_unsandboxed: false,
            languages: LanguageProfile::builtins(),
            default_language: default_language(),
        }
    }
}

impl SandboxConfig {
    /// Development configuration: native runtime, built-in profiles
    #[must_use]
    pub fn native() -> Self {
        Self {
            runtime_preference: "none".to_string(),
            allow_unsandboxed: true,
            ..Self::default()
        }
    }

    /// Select the runtime based on preference and availability
    ///
    /// Falling back to native execution is an error unless
    /// `allow_unsandboxed` is set.
    pub async fn select_runtime(&self) -> Result<ContainerRuntime> {
        let runtime = ContainerRuntime::from_preference(&self.runtime_preference).await;
        if runtime.is_isolated() || self.allow_unsandboxed {
            Ok(runtime)
        } else {
            Err(Error::RuntimeUnavailable(format!(
                "no container runtime for preference '{}' and unsandboxed execution is disabled",
                self.runtime_preference
            )))
        }
    }

    /// Look up a profile, falling back to the default language
    pub fn language(&self, name: Option<&str>) -> Result<(&str, &LanguageProfile)> {
        let name = name
            .filter(|n| !n.is_empty())
            .unwrap_or(self.default_language.as_str());
        self.languages
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| Error::UnknownLanguage(name.to_string()))
    }

    /// Validate every language profile
    pub fn validate(&self) -> Result<()> {
        for (name, profile) in &self.languages {
            profile.validate(name)?;
        }
        if !self.languages.contains_key(&self.default_language) {
            return Err(Error::UnknownLanguage(self.default_language.clone()));
        }
        Ok(())
    }
}
