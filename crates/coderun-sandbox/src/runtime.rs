//! Isolation runtime detection

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Runtime a run is executed under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerRuntime {
    /// Docker - cross-platform, namespace isolation
    Docker,
    /// Apple Container - macOS 26+ native, VM-based isolation
    AppleContainer,
    /// Native process group on the host (development only)
    Native,
}

impl ContainerRuntime {
    /// Detect the best available container runtime
    ///
    /// On macOS with Apple Silicon, prefers Apple Container if available.
    /// Falls back to Docker, then native execution.
    pub async fn detect() -> Self {
        #[cfg(target_os = "macos")]
        {
            if Self::is_apple_silicon() && Self::check_apple_container().await {
                info!("Using Apple Container runtime (VM-based isolation)");
                return Self::AppleContainer;
            }
        }

        if Self::check_docker().await {
            info!("Using Docker runtime");
            return Self::Docker;
        }

        warn!("No container runtime available - runs will not be isolated");
        Self::Native
    }

    /// Resolve a configured preference ("auto", "docker", "apple_container", "none")
    pub async fn from_preference(preference: &str) -> Self {
        match preference {
            "docker" => {
                if Self::check_docker().await {
                    Self::Docker
                } else {
                    warn!("Docker requested but not available");
                    Self::Native
                }
            }
            "apple_container" => {
                if Self::check_apple_container().await {
                    Self::AppleContainer
                } else {
                    warn!("Apple Container requested but not available");
                    Self::Native
                }
            }
            "none" | "native" => Self::Native,
            _ => Self::detect().await,
        }
    }

    /// Check if Apple Container CLI is available
    pub async fn check_apple_container() -> bool {
        match tokio::process::Command::new("container")
            .arg("--version")
            .output()
            .await
        {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }

    /// Check if Docker is available
    pub async fn check_docker() -> bool {
        match tokio::process::Command::new("docker")
            .arg("info")
            .output()
            .await
        {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "macos")]
    fn is_apple_silicon() -> bool {
        std::env::consts::ARCH == "aarch64"
    }

    /// CLI binary for container runtimes
    #[must_use]
    pub fn cli(&self) -> Option<&'static str> {
        match self {
            Self::Docker => Some("docker"),
            Self::AppleContainer => Some("container"),
            Self::Native => None,
        }
    }

    /// Get human-readable name for the runtime
    #[must_use]
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Docker => "Docker",
            Self::AppleContainer => "Apple Container",
            Self::Native => "Native (no isolation)",
        }
    }

    /// Whether runs are confined by a container boundary
    #[must_use]
    pub fn is_isolated(&self) -> bool {
        !matches!(self, Self::Native)
    }
}

impl std::fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}
