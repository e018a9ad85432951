//! Production configuration validation
//!
//! Security checks for production deployments.

use super::config::AppConfig;
use super::loader::environment;
use anyhow::{bail, Result};
use tracing::warn;

/// Validate configuration for production security
pub fn validate_production_config(config: &AppConfig) -> Result<()> {
    let is_production = environment().to_lowercase() == "production";
    check_config(config, is_production)
}

fn check_config(config: &AppConfig, is_production: bool) -> Result<()> {
    if !is_production {
        return Ok(());
    }

    if config.sandbox.allow_unsandboxed || is_native(&config.sandbox.runtime) {
        bail!(
            "Unsandboxed execution is not permitted in production. \
             Set [sandbox] runtime to auto, docker or apple_container and allow_unsandboxed = false."
        );
    }

    if config.server.host == "0.0.0.0" {
        warn!(
            "SECURITY WARNING: Server is binding to all interfaces (0.0.0.0) in production. \
             Consider binding to 127.0.0.1 and using a reverse proxy."
        );
    }

    if !config.server.auth.enabled && config.server.host != "127.0.0.1" {
        warn!(
            "SECURITY WARNING: Authentication is DISABLED while server is exposed externally. \
             Enable [server.auth] enabled = true in production!"
        );
    }

    if config.sandbox.network != coderun_sandbox::NetworkMode::None {
        warn!(
            network = ?config.sandbox.network,
            "SECURITY WARNING: Sandboxed programs have network access in production."
        );
    }

    Ok(())
}

fn is_native(runtime: &str) -> bool {
    matches!(runtime.to_lowercase().as_str(), "none" | "native")
}
