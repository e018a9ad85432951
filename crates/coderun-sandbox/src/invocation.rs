//! Command construction for each runtime

use crate::config::SandboxConfig;
use crate::language::LanguageProfile;
use crate::limits::ResourceLimits;
use crate::mount::{Mount, CONTAINER_WORKSPACE};
use crate::process::RUN_MARKER_VAR;
use crate::runtime::ContainerRuntime;
use nix::unistd::{getgid, getuid};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Environment variables passed through to native runs
const ENV_WHITELIST: &[&str] = &["PATH", "LANG", "LC_ALL", "USER"];

/// Build or run step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Compile,
    Run,
}

impl Phase {
    fn suffix(self) -> &'static str {
        match self {
            Self::Compile => "build",
            Self::Run => "run",
        }
    }
}

/// Everything needed to turn a profile command into a spawnable `Command`
pub(crate) struct Invocation<'a> {
    pub(crate) runtime: ContainerRuntime,
    pub(crate) config: &'a SandboxConfig,
    pub(crate) profile: &'a LanguageProfile,
    pub(crate) limits: &'a ResourceLimits,
    pub(crate) workspace: &'a std::path::Path,
    pub(crate) run_id: uuid::Uuid,
}

impl Invocation<'_> {
    /// Container name for a phase, `None` in native mode
    pub(crate) fn container_name(&self, phase: Phase) -> Option<String> {
        self.runtime
            .is_isolated()
            .then(|| format!("coderun-{}-{}", self.run_id.simple(), phase.suffix()))
    }

    /// Build-step command, if the profile has one
    pub(crate) fn compile_command(&self) -> Option<Command> {
        let argv = self.profile.compile_argv(&self.command_dir())?;
        Some(self.command(Phase::Compile, argv))
    }

    /// Program command
    pub(crate) fn run_command(&self) -> Command {
        let argv = self.profile.run_argv(&self.command_dir());
        self.command(Phase::Run, argv)
    }

    /// `CODERUN_RUN=<id>` environment entry tagging a native run's processes
    pub(crate) fn run_marker(&self) -> Option<String> {
        (!self.runtime.is_isolated())
            .then(|| format!("{RUN_MARKER_VAR}={}", self.run_id.simple()))
    }

    fn command_dir(&self) -> String {
        if self.runtime.is_isolated() {
            CONTAINER_WORKSPACE.to_string()
        } else {
            self.workspace.to_string_lossy().into_owned()
        }
    }

    fn command(&self, phase: Phase, argv: Vec<String>) -> Command {
        let mut cmd = match self.runtime {
            ContainerRuntime::Native => self.native(argv),
            ContainerRuntime::Docker => self.docker(phase, argv),
            ContainerRuntime::AppleContainer => self.apple_container(phase, argv),
        };

        cmd.stdin(match phase {
            Phase::Compile => Stdio::null(),
            Phase::Run => Stdio::piped(),
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        // own process group so the whole tree can be signalled at once
        cmd.process_group(0);
        cmd
    }

    fn native(&self, argv: Vec<String>) -> Command {
        let mut iter = argv.into_iter();
        let program = iter.next().unwrap_or_default();
        let mut cmd = Command::new(program);
        cmd.args(iter).current_dir(self.workspace).env_clear();

        for key in ENV_WHITELIST {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd.env("HOME", self.workspace)
            .env("TMPDIR", self.workspace)
            .env(RUN_MARKER_VAR, self.run_id.simple().to_string());
        cmd
    }

    fn image(&self) -> &str {
        self.profile.image.as_deref().unwrap_or(&self.config.image)
    }

    /// Server's uid:gid; the workspace is private to it and containers drop
    /// CAP_DAC_OVERRIDE, so the container process must run as the same user
    fn container_user(&self) -> String {
        format!("--user={}:{}", getuid(), getgid())
    }

    fn mount(&self, phase: Phase) -> Mount {
        match phase {
            Phase::Compile => Mount::workspace_rw(self.workspace),
            Phase::Run => Mount::workspace_ro(self.workspace),
        }
    }

    fn docker(&self, phase: Phase, argv: Vec<String>) -> Command {
        let mut args = vec!["run".to_string(), "--rm".to_string()];
        if phase == Phase::Run {
            args.push("-i".to_string());
        }
        if let Some(name) = self.container_name(phase) {
            args.push(format!("--name={name}"));
        }
        args.extend([
            self.container_user(),
            format!("--network={}", self.config.network.as_docker_arg()),
            "--read-only".to_string(),
            "--cap-drop=ALL".to_string(),
            "--tmpfs=/tmp:rw,nosuid,size=64m".to_string(),
        ]);
        args.extend(self.limits.to_docker_args());

        if !self
            .config
            .security_opts
            .iter()
            .any(|o| o.starts_with("no-new-privileges"))
        {
            args.push("--security-opt=no-new-privileges:true".to_string());
        }
        for opt in &self.config.security_opts {
            args.push(format!("--security-opt={opt}"));
        }

        args.push(self.mount(phase).to_docker_arg());
        args.push(format!("--workdir={CONTAINER_WORKSPACE}"));
        args.push(self.image().to_string());
        args.extend(argv);

        debug!(args = ?args, "docker invocation");
        let mut cmd = Command::new("docker");
        cmd.args(args);
        cmd
    }

    fn apple_container(&self, phase: Phase, argv: Vec<String>) -> Command {
        let mut args = vec!["run".to_string(), "--rm".to_string()];
        if phase == Phase::Run {
            args.push("--interactive".to_string());
        }
        if let Some(name) = self.container_name(phase) {
            args.push(format!("--name={name}"));
        }
        args.push(self.container_user());
        args.push(format!(
            "--network={}",
            self.config.network.as_apple_container_arg()
        ));
        args.extend(self.limits.to_apple_container_args());
        args.push(self.mount(phase).to_apple_container_arg());
        args.push(format!("--workdir={CONTAINER_WORKSPACE}"));
        args.push(self.image().to_string());
        args.extend(argv);

        debug!(args = ?args, "apple container invocation");
        let mut cmd = Command::new("container");
        cmd.args(args);
        cmd
    }
}
