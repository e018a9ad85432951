//! `coderun run`: compile and run a file locally with the configured runner

use anyhow::{bail, Context, Result};
use coderun_sandbox::{Error as SandboxError, ProcessRunner, RunStatus, StartRequest, StreamKind};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::server::load_config;

pub async fn run(file: &Path, language: Option<String>) -> Result<()> {
    let source = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let config = load_config()?;
    let runner = ProcessRunner::new(config.sandbox_config())
        .await
        .context("Failed to initialize process runner")?;

    let mut request = StartRequest::new(source);
    if let Some(language) = language.or_else(|| language_for(file)) {
        request = request.with_language(language);
    }

    let mut handle = match runner.start(request).await {
        Ok(handle) => handle,
        Err(SandboxError::Compile { diagnostics, .. }) => {
            eprint!("{}", diagnostics);
            bail!("compilation failed");
        }
        Err(e) => return Err(e).context("Failed to start program"),
    };
    let Some(mut output) = handle.take_output() else {
        bail!("output stream unavailable");
    };

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();

    loop {
        tokio::select! {
            chunk = output.recv() => match chunk {
                Some(chunk) => {
                    let sink: &mut (dyn tokio::io::AsyncWrite + Unpin + Send) = match chunk.stream {
                        StreamKind::Stdout => &mut stdout,
                        StreamKind::Stderr | StreamKind::System => &mut stderr,
                    };
                    sink.write_all(&chunk.data).await?;
                    sink.flush().await?;
                }
                None => break,
            },
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if handle.write_input(&line).is_err() {
                        stdin_open = false;
                    }
                }
                Ok(None) | Err(_) => {
                    let _ = handle.close_input();
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                handle.terminate().await;
            }
        }
    }

    let status = handle.wait().await;
    debug!(status = %status, output_bytes = handle.output_bytes(), "run finished");
    match status {
        RunStatus::Exited { code: 0 } => Ok(()),
        RunStatus::Exited { code } => std::process::exit(code),
        other => bail!("program {}", other),
    }
}

/// Profile name for well-known file extensions
fn language_for(file: &Path) -> Option<String> {
    let name = match file.extension()?.to_str()? {
        "c" => "c",
        "cc" | "cpp" | "cxx" => "cpp",
        "py" => "python",
        "sh" => "sh",
        _ => return None,
    };
    Some(name.to_string())
}
