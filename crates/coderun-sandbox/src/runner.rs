//! Process runner: materialize, build, spawn

use crate::config::SandboxConfig;
use crate::error::{Error, Result};
use crate::handle::{supervise, RunHandle, Spawned};
use crate::invocation::{Invocation, Phase};
use crate::limits::ResourceLimits;
use crate::process::KillTarget;
use crate::runtime::ContainerRuntime;
use crate::workspace::Workspace;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Diagnostics beyond this size are cut off
const MAX_DIAGNOSTIC_BYTES: usize = 16 * 1024;

/// Parameters for [`ProcessRunner::start`]
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// Run id, used for logging and container names
    pub run_id: Uuid,
    /// Source payload
    pub source: String,
    /// Language profile name (`None` selects the default)
    pub language: Option<String>,
    /// Limits override (`None` uses the configured defaults)
    pub limits: Option<ResourceLimits>,
    /// Cancels the build step, and the run once spawned
    pub cancel: CancellationToken,
}

impl StartRequest {
    /// Request with a fresh run id and default language and limits
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source: source.into(),
            language: None,
            limits: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Set the language profile
    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Override the limits
    #[must_use]
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Set the run id
    #[must_use]
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    /// Use an externally owned cancellation token
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Compiles and runs source payloads in isolation
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    config: Arc<SandboxConfig>,
    runtime: ContainerRuntime,
    live: Arc<AtomicUsize>,
}

impl ProcessRunner {
    /// Validate the configuration and select a runtime
    pub async fn new(config: SandboxConfig) -> Result<Self> {
        config.validate()?;
        let runtime = config.select_runtime().await?;
        info!(runtime = %runtime, "process runner ready");
        Ok(Self::with_runtime(config, runtime))
    }

    /// Runner with an explicit runtime (no detection)
    #[must_use]
    pub fn with_runtime(config: SandboxConfig, runtime: ContainerRuntime) -> Self {
        if !runtime.is_isolated() {
            warn!("runs execute natively on the host without isolation");
        }
        Self {
            config: Arc::new(config),
            runtime,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Selected runtime
    #[must_use]
    pub fn runtime(&self) -> ContainerRuntime {
        self.runtime
    }

    /// Runner configuration
    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Programs currently alive
    #[must_use]
    pub fn live_processes(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Materialize the source, run the build step and spawn the program
    ///
    /// A failed build returns [`Error::Compile`] and spawns nothing.
    /// Cancelling `request.cancel` during the build returns [`Error::Cancelled`].
    #[instrument(skip(self, request), fields(run_id = %request.run_id, language = tracing::field::Empty))]
    pub async fn start(&self, request: StartRequest) -> Result<RunHandle> {
        let (language, profile) = self.config.language(request.language.as_deref())?;
        tracing::Span::current().record("language", language);
        let limits = request
            .limits
            .clone()
            .unwrap_or_else(|| self.config.limits.clone());

        let workspace = Workspace::materialize(profile, &request.source).await?;
        debug!(workspace = %workspace.path_str(), "workspace ready");

        let invocation = Invocation {
            runtime: self.runtime,
            config: &self.config,
            profile,
            limits: &limits,
            workspace: workspace.path(),
            run_id: request.run_id,
        };

        if let Some(cmd) = invocation.compile_command() {
            let kill = |pgid| KillTarget {
                pgid,
                marker: invocation.run_marker(),
                container: self.container(&invocation, Phase::Compile),
            };
            compile(cmd, &limits, &request.cancel, kill).await?;
        }

        if request.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let child = invocation
            .run_command()
            .spawn()
            .map_err(|e| Error::Spawn(format!("failed to spawn program: {e}")))?;
        let kill = KillTarget {
            pgid: child.id(),
            marker: invocation.run_marker(),
            container: self.container(&invocation, Phase::Run),
        };
        info!(pid = ?child.id(), runtime = %self.runtime, "program spawned");

        supervise(Spawned {
            id: request.run_id,
            language: language.to_string(),
            child,
            kill,
            workspace,
            timeout: limits.timeout,
            max_output_bytes: limits.max_output_bytes,
            cancel: request.cancel,
            live: Arc::clone(&self.live),
        })
    }

    fn container(&self, invocation: &Invocation<'_>, phase: Phase) -> Option<(&'static str, String)> {
        let cli = self.runtime.cli()?;
        invocation.container_name(phase).map(|name| (cli, name))
    }
}

async fn compile<F>(
    mut cmd: tokio::process::Command,
    limits: &ResourceLimits,
    cancel: &CancellationToken,
    kill: F,
) -> Result<()>
where
    F: FnOnce(Option<u32>) -> KillTarget,
{
    let child = cmd
        .spawn()
        .map_err(|e| Error::Spawn(format!("failed to spawn compiler: {e}")))?;
    let target = kill(child.id());

    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            target.kill().await;
            return Err(Error::Cancelled);
        }
        result = tokio::time::timeout(limits.compile_timeout, child.wait_with_output()) => match result {
            Ok(output) => output?,
            Err(_) => {
                target.kill().await;
                return Err(Error::Timeout(limits.compile_timeout.as_millis() as u64));
            }
        },
    };

    if output.status.success() {
        debug!("build step succeeded");
        return Ok(());
    }

    let mut raw = output.stderr;
    if !output.stdout.is_empty() {
        raw.extend_from_slice(&output.stdout);
    }
    let diagnostics = cap_diagnostics(&String::from_utf8_lossy(&raw));
    let exit_code = output.status.code();
    info!(exit_code = ?exit_code, "build step failed");
    Err(Error::Compile {
        diagnostics,
        exit_code,
    })
}

fn cap_diagnostics(text: &str) -> String {
    if text.len() <= MAX_DIAGNOSTIC_BYTES {
        return text.to_string();
    }
    let mut end = MAX_DIAGNOSTIC_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[diagnostics truncated]", &text[..end])
}
