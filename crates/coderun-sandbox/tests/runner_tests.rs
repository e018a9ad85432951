//! End-to-end runner scenarios on the native runtime

use coderun_sandbox::{
    ContainerRuntime, Error, OutputChunk, ProcessRunner, RunHandle, RunStatus, SandboxConfig,
    StartRequest, StreamKind,
};
use std::time::Duration;

fn runner() -> ProcessRunner {
    ProcessRunner::with_runtime(SandboxConfig::native(), ContainerRuntime::Native)
}

fn has_c_compiler() -> bool {
    std::process::Command::new("cc")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// True once the pid is gone or only a zombie remains
fn is_dead(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .and_then(|rest| rest.split_whitespace().next())
            .map(|state| state == "Z" || state == "X")
            .unwrap_or(true),
        Err(_) => true,
    }
}

async fn wait_dead(pid: u32) -> bool {
    for _ in 0..40 {
        if is_dead(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn collect(handle: &mut RunHandle) -> Vec<OutputChunk> {
    let mut stream = handle.take_output().unwrap();
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.recv().await {
        chunks.push(chunk);
    }
    chunks
}

fn stdout_of(chunks: &[OutputChunk]) -> String {
    chunks
        .iter()
        .filter(|c| c.stream == StreamKind::Stdout)
        .map(|c| String::from_utf8_lossy(&c.data).into_owned())
        .collect()
}

#[tokio::test]
async fn test_c_hello() {
    if !has_c_compiler() {
        return;
    }
    let mut handle = runner()
        .start(
            StartRequest::new("int main(){printf(\"hi\");return 0;}").with_language("c"),
        )
        .await
        .unwrap();

    let chunks = collect(&mut handle).await;
    assert_eq!(stdout_of(&chunks), "hi");
    assert_eq!(handle.wait().await, RunStatus::Exited { code: 0 });
}

#[tokio::test]
async fn test_c_scanf_doubling() {
    if !has_c_compiler() {
        return;
    }
    // no headers and no return: accepted as written by an interactive user
    let source = "int main(){int x; scanf(\"%d\",&x); printf(\"%d\",x*2);}";
    let mut handle = runner()
        .start(StartRequest::new(source).with_language("c"))
        .await
        .unwrap();

    handle.write_input("21").unwrap();
    let chunks = collect(&mut handle).await;
    assert_eq!(stdout_of(&chunks), "42");
    assert_eq!(handle.wait().await, RunStatus::Exited { code: 0 });
}

#[tokio::test]
async fn test_c_malformed_source() {
    if !has_c_compiler() {
        return;
    }
    let result = runner()
        .start(StartRequest::new("int main( {").with_language("c"))
        .await;
    match result {
        Err(Error::Compile { diagnostics, .. }) => assert!(diagnostics.contains("error")),
        other => panic!("expected compile error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_signal_death_maps_to_exit_code() {
    let mut handle = runner()
        .start(StartRequest::new("kill -TERM $$").with_language("sh"))
        .await
        .unwrap();

    collect(&mut handle).await;
    assert_eq!(handle.wait().await, RunStatus::Exited { code: 128 + 15 });
}

#[tokio::test]
async fn test_terminate_kills_descendants() {
    let mut handle = runner()
        .start(StartRequest::new("sleep 60 &\necho $!\nwait").with_language("sh"))
        .await
        .unwrap();

    let mut stream = handle.take_output().unwrap();
    let first = tokio::time::timeout(Duration::from_secs(5), stream.recv())
        .await
        .unwrap()
        .unwrap();
    let child_pid: u32 = String::from_utf8_lossy(&first.data).trim().parse().unwrap();
    let shell_pid = handle.pid().unwrap();

    assert_eq!(handle.terminate().await, RunStatus::Killed);
    assert!(wait_dead(shell_pid).await, "shell survived");
    assert!(wait_dead(child_pid).await, "background child survived");
}

fn has_setsid() -> bool {
    std::process::Command::new("setsid")
        .arg("true")
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn test_terminate_kills_detached_session() {
    if !has_setsid() {
        return;
    }
    let mut handle = runner()
        .start(StartRequest::new("setsid sleep 60 &\necho $!\nsleep 30").with_language("sh"))
        .await
        .unwrap();

    let mut stream = handle.take_output().unwrap();
    let first = tokio::time::timeout(Duration::from_secs(5), stream.recv())
        .await
        .unwrap()
        .unwrap();
    let detached_pid: u32 = String::from_utf8_lossy(&first.data).trim().parse().unwrap();
    assert!(!is_dead(detached_pid));

    assert_eq!(handle.terminate().await, RunStatus::Killed);
    assert!(wait_dead(detached_pid).await, "setsid child escaped terminate");
}

#[tokio::test]
async fn test_detached_orphan_killed_after_normal_exit() {
    if !has_setsid() {
        return;
    }
    // the intermediate shell exits, so the sleeper is reparented out of the tree
    let mut handle = runner()
        .start(StartRequest::new("sh -c 'setsid sleep 60 & echo $!'").with_language("sh"))
        .await
        .unwrap();

    let chunks = tokio::time::timeout(Duration::from_secs(5), collect(&mut handle))
        .await
        .unwrap();
    let orphan_pid: u32 = stdout_of(&chunks).trim().parse().unwrap();
    assert_eq!(handle.wait().await, RunStatus::Exited { code: 0 });
    assert!(wait_dead(orphan_pid).await, "orphaned setsid child survived");
}

#[tokio::test]
async fn test_descendants_killed_after_normal_exit() {
    let mut handle = runner()
        .start(StartRequest::new("sleep 60 &\necho $!").with_language("sh"))
        .await
        .unwrap();

    let chunks = tokio::time::timeout(Duration::from_secs(5), collect(&mut handle))
        .await
        .unwrap();
    let child_pid: u32 = stdout_of(&chunks).trim().parse().unwrap();
    assert_eq!(handle.wait().await, RunStatus::Exited { code: 0 });
    assert!(wait_dead(child_pid).await, "background child survived");
}

#[tokio::test]
async fn test_stdin_backlog_is_bounded() {
    let handle = runner()
        .start(StartRequest::new("sleep 30").with_language("sh"))
        .await
        .unwrap();

    let line = "x".repeat(4096);
    let mut accepted = 0;
    let rejected = loop {
        match handle.write_input(&line) {
            Ok(()) => accepted += 1,
            Err(e) => break e,
        }
        assert!(accepted < 10_000, "stdin queue never filled up");
    };
    assert!(matches!(rejected, Error::InputBacklog { limit } if limit == coderun_sandbox::INPUT_QUEUE_LINES));
    assert!(accepted >= coderun_sandbox::INPUT_QUEUE_LINES);

    assert_eq!(handle.terminate().await, RunStatus::Killed);
    assert!(matches!(handle.write_input("late"), Err(Error::ProcessGone)));
}

#[tokio::test]
async fn test_input_after_close_is_eof() {
    let mut handle = runner()
        .start(
            StartRequest::new("while read l; do echo \"got $l\"; done; echo done").with_language("sh"),
        )
        .await
        .unwrap();

    handle.write_input("a").unwrap();
    handle.write_input("b").unwrap();
    handle.close_input().unwrap();
    let chunks = collect(&mut handle).await;
    assert_eq!(stdout_of(&chunks), "got a\ngot b\ndone\n");
}

#[tokio::test]
async fn test_workspace_removed_after_run() {
    let mut handle = runner()
        .start(StartRequest::new("pwd").with_language("sh"))
        .await
        .unwrap();

    let chunks = collect(&mut handle).await;
    handle.wait().await;
    let dir = stdout_of(&chunks);
    assert!(dir.contains("coderun-"));
    assert!(!std::path::Path::new(dir.trim()).exists());
}
