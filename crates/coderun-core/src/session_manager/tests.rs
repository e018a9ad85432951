use super::*;
use crate::auth::AuthMethod;
use crate::event::SessionEvent;
use crate::session::SessionState;
use coderun_sandbox::{ContainerRuntime, ResourceLimits, RunStatus, SandboxConfig, StreamKind};
use std::time::Duration;

fn user_auth(user_id: &str) -> AuthContext {
    AuthContext::user(user_id)
}

fn admin_auth() -> AuthContext {
    AuthContext {
        user_id: "admin".to_string(),
        method: AuthMethod::ApiKey,
        scopes: vec![Scope::Admin],
    }
}

fn sandbox_config() -> SandboxConfig {
    SandboxConfig {
        default_language: "sh".to_string(),
        ..SandboxConfig::native()
    }
}

fn manager_with(sandbox: SandboxConfig, config: SessionConfig) -> SessionManager {
    let runner = ProcessRunner::with_runtime(sandbox, ContainerRuntime::Native);
    SessionManager::new(runner, config)
}

fn manager() -> SessionManager {
    manager_with(sandbox_config(), SessionConfig::default())
}

async fn next_event(rx: &mut SessionEvents) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Collect events until `run_id` ends (run_ended, compile_error or run_cancelled)
async fn events_until_end(rx: &mut SessionEvents, run_id: Uuid) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(rx).await;
        let done = event.run_id() == Some(run_id)
            && matches!(
                event,
                SessionEvent::RunEnded { .. }
                    | SessionEvent::CompileError { .. }
                    | SessionEvent::RunCancelled { .. }
            );
        events.push(event);
        if done {
            return events;
        }
    }
}

fn stdout_of(events: &[SessionEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Output { chunk, .. } if chunk.stream == StreamKind::Stdout => {
                Some(String::from_utf8_lossy(&chunk.data).into_owned())
            }
            _ => None,
        })
        .collect()
}

fn end_status(events: &[SessionEvent]) -> Option<RunStatus> {
    events.iter().find_map(|e| match e {
        SessionEvent::RunEnded { status, .. } => Some(*status),
        _ => None,
    })
}

#[tokio::test]
async fn test_create_and_list_sessions_ownership() {
    let mgr = manager();
    let alice = user_auth("alice");
    let bob = user_auth("bob");

    let (a, _a_events) = mgr.create_session(&alice).await.unwrap();
    let (_b, _b_events) = mgr.create_session(&bob).await.unwrap();
    assert_eq!(a.owner, "alice");

    let alice_sessions = mgr.list_sessions(&alice).await;
    assert_eq!(alice_sessions.len(), 1);
    assert_eq!(alice_sessions[0].id, a.id);
    assert_eq!(mgr.list_sessions(&admin_auth()).await.len(), 2);
    assert_eq!(mgr.session_count().await, 2);
}

#[tokio::test]
async fn test_foreign_session_forbidden() {
    let mgr = manager();
    let alice = user_auth("alice");
    let bob = user_auth("bob");
    let (session, _events) = mgr.create_session(&alice).await.unwrap();

    let result = mgr
        .on_run_request(session.id, &bob, "echo hi".to_string(), None)
        .await;
    assert!(matches!(result, Err(Error::Unauthorized(_))));
    assert!(mgr.session_status(session.id, &admin_auth()).await.is_ok());
}

#[tokio::test]
async fn test_session_not_found() {
    let mgr = manager();
    let alice = user_auth("alice");
    let result = mgr.on_cancel(Uuid::new_v4(), &alice).await;
    assert!(matches!(result, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_read_only_key_cannot_run() {
    let mgr = manager();
    let viewer = AuthContext {
        user_id: "viewer".to_string(),
        method: AuthMethod::ApiKey,
        scopes: vec![Scope::SessionRead],
    };
    let (session, _events) = mgr.create_session(&viewer).await.unwrap();
    let result = mgr
        .on_run_request(session.id, &viewer, "echo hi".to_string(), None)
        .await;
    assert!(matches!(result, Err(Error::Unauthorized(_))));
}

#[tokio::test]
async fn test_run_hello() {
    let mgr = manager();
    let alice = user_auth("alice");
    let (session, mut events) = mgr.create_session(&alice).await.unwrap();

    let run_id = mgr
        .on_run_request(session.id, &alice, "printf hi".to_string(), None)
        .await
        .unwrap();
    let got = events_until_end(&mut events, run_id).await;

    assert!(matches!(
        &got[0],
        SessionEvent::RunStarted { run_id: id, language } if *id == run_id && language == "sh"
    ));
    assert_eq!(stdout_of(&got), "hi");
    assert_eq!(end_status(&got), Some(RunStatus::Exited { code: 0 }));

    let transcript = mgr.transcript(session.id, &alice).await.unwrap();
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript[0].data, b"hi");
}

#[tokio::test]
async fn test_input_without_run_is_dropped() {
    let mgr = manager();
    let alice = user_auth("alice");
    let (session, mut events) = mgr.create_session(&alice).await.unwrap();

    mgr.on_input_line(session.id, &alice, "hello").await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::NoActiveRun {
            request: "input".to_string()
        }
    );
    assert_eq!(mgr.runner().live_processes(), 0);

    mgr.on_cancel(session.id, &alice).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::NoActiveRun {
            request: "cancel".to_string()
        }
    );
}

#[tokio::test]
async fn test_input_relay_and_queue_during_compile() {
    let mgr = manager();
    let alice = user_auth("alice");
    let (session, mut events) = mgr.create_session(&alice).await.unwrap();

    let run_id = mgr
        .on_run_request(
            session.id,
            &alice,
            "read x\necho $((x * 2))\nread y\necho \"$y\"".to_string(),
            None,
        )
        .await
        .unwrap();
    // most likely still compiling: queued and flushed on start
    mgr.on_input_line(session.id, &alice, "21\n").await.unwrap();

    match next_event(&mut events).await {
        SessionEvent::RunStarted { run_id: id, .. } => assert_eq!(id, run_id),
        other => panic!("expected run_started, got {other:?}"),
    }
    mgr.on_input_line(session.id, &alice, "second").await.unwrap();

    let got = events_until_end(&mut events, run_id).await;
    assert_eq!(stdout_of(&got), "42\nsecond\n");
    assert_eq!(end_status(&got), Some(RunStatus::Exited { code: 0 }));
}

#[tokio::test]
async fn test_rapid_runs_replace_previous() {
    let mgr = manager();
    let alice = user_auth("alice");
    let (session, mut events) = mgr.create_session(&alice).await.unwrap();

    let first = mgr
        .on_run_request(
            session.id,
            &alice,
            "echo first; sleep 30".to_string(),
            None,
        )
        .await
        .unwrap();
    let second = mgr
        .on_run_request(session.id, &alice, "echo second".to_string(), None)
        .await
        .unwrap();
    assert!(mgr.runner().live_processes() <= 1);

    let got = events_until_end(&mut events, second).await;
    let first_end = got
        .iter()
        .position(|e| matches!(e, SessionEvent::RunEnded { run_id, .. } if *run_id == first))
        .expect("first run must end");
    let second_start = got
        .iter()
        .position(|e| matches!(e, SessionEvent::RunStarted { run_id, .. } if *run_id == second))
        .expect("second run must start");

    assert!(first_end < second_start);
    assert_eq!(end_status(&got[first_end..=first_end]), Some(RunStatus::Killed));
    assert!(got[second_start..]
        .iter()
        .all(|e| e.run_id() != Some(first)));
    assert_eq!(stdout_of(&got[second_start..]), "second\n");
}

#[tokio::test]
async fn test_seq_strictly_increasing() {
    let mgr = manager();
    let alice = user_auth("alice");
    let (session, mut events) = mgr.create_session(&alice).await.unwrap();

    let run_id = mgr
        .on_run_request(
            session.id,
            &alice,
            "for i in 1 2 3 4 5 6; do echo o$i; echo e$i >&2; done".to_string(),
            None,
        )
        .await
        .unwrap();
    let got = events_until_end(&mut events, run_id).await;

    let seqs: Vec<u64> = got
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Output { chunk, .. } => Some(chunk.seq),
            _ => None,
        })
        .collect();
    assert!(!seqs.is_empty());
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_timeout_reported() {
    let sandbox = SandboxConfig {
        limits: ResourceLimits::default().with_timeout(Duration::from_millis(300)),
        ..sandbox_config()
    };
    let mgr = manager_with(sandbox, SessionConfig::default());
    let alice = user_auth("alice");
    let (session, mut events) = mgr.create_session(&alice).await.unwrap();

    let run_id = mgr
        .on_run_request(session.id, &alice, "sleep 30".to_string(), None)
        .await
        .unwrap();
    let got = events_until_end(&mut events, run_id).await;
    assert_eq!(end_status(&got), Some(RunStatus::TimedOut));
}

#[tokio::test]
async fn test_cancel_running() {
    let mgr = manager();
    let alice = user_auth("alice");
    let (session, mut events) = mgr.create_session(&alice).await.unwrap();

    let run_id = mgr
        .on_run_request(session.id, &alice, "sleep 30".to_string(), None)
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::RunStarted { .. }
    ));

    mgr.on_cancel(session.id, &alice).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::RunCancelled { run_id }
    );

    let status = mgr.session_status(session.id, &alice).await.unwrap();
    assert_eq!(status.state, SessionState::Idle);
    assert_eq!(status.last_status, Some(RunStatus::Killed));
    assert_eq!(mgr.runner().live_processes(), 0);
    assert_eq!(mgr.active_runs(), 0);
}

#[tokio::test]
async fn test_compile_error_event() {
    let mgr = manager();
    let alice = user_auth("alice");
    let (session, mut events) = mgr.create_session(&alice).await.unwrap();

    let run_id = mgr
        .on_run_request(session.id, &alice, "if then fi (".to_string(), None)
        .await
        .unwrap();
    match next_event(&mut events).await {
        SessionEvent::CompileError {
            run_id: id,
            diagnostics,
            ..
        } => {
            assert_eq!(id, run_id);
            assert!(!diagnostics.is_empty());
        }
        other => panic!("expected compile_error, got {other:?}"),
    }
    let status = mgr.session_status(session.id, &alice).await.unwrap();
    assert_eq!(status.last_status, Some(RunStatus::CompileFailed));
}

#[tokio::test]
async fn test_request_validation() {
    let config = SessionConfig {
        max_source_bytes: 16,
        max_line_bytes: 4,
        ..SessionConfig::default()
    };
    let mgr = manager_with(sandbox_config(), config);
    let alice = user_auth("alice");
    let (session, _events) = mgr.create_session(&alice).await.unwrap();

    let too_big = mgr
        .on_run_request(session.id, &alice, "x".repeat(17), None)
        .await;
    assert!(matches!(too_big, Err(Error::InvalidInput(_))));

    let empty = mgr
        .on_run_request(session.id, &alice, "   ".to_string(), None)
        .await;
    assert!(matches!(empty, Err(Error::InvalidInput(_))));

    let unknown = mgr
        .on_run_request(session.id, &alice, "echo".to_string(), Some("cobol".into()))
        .await;
    assert!(matches!(
        unknown,
        Err(Error::Sandbox(coderun_sandbox::Error::UnknownLanguage(_)))
    ));

    let long_line = mgr.on_input_line(session.id, &alice, "12345").await;
    assert!(matches!(long_line, Err(Error::InvalidInput(_))));
}

#[tokio::test]
async fn test_rate_limited() {
    let config = SessionConfig {
        runs_per_minute: 2,
        ..SessionConfig::default()
    };
    let mgr = manager_with(sandbox_config(), config);
    let alice = user_auth("alice");
    let (session, _events) = mgr.create_session(&alice).await.unwrap();

    for _ in 0..2 {
        mgr.on_run_request(session.id, &alice, "true".to_string(), None)
            .await
            .unwrap();
    }
    let third = mgr
        .on_run_request(session.id, &alice, "true".to_string(), None)
        .await;
    assert!(matches!(third, Err(Error::RateLimited { .. })));
}

#[tokio::test]
async fn test_global_run_cap() {
    let config = SessionConfig {
        max_concurrent_runs: 1,
        ..SessionConfig::default()
    };
    let mgr = manager_with(sandbox_config(), config);
    let alice = user_auth("alice");
    let (a, _a_events) = mgr.create_session(&alice).await.unwrap();
    let (b, _b_events) = mgr.create_session(&alice).await.unwrap();

    mgr.on_run_request(a.id, &alice, "sleep 30".to_string(), None)
        .await
        .unwrap();
    let blocked = mgr
        .on_run_request(b.id, &alice, "echo hi".to_string(), None)
        .await;
    assert!(matches!(blocked, Err(Error::CapacityExceeded(_))));

    // replacing within the same session reuses the slot
    mgr.on_run_request(a.id, &alice, "sleep 30".to_string(), None)
        .await
        .unwrap();
    assert_eq!(mgr.active_runs(), 1);
    mgr.shutdown_all().await;
}

#[tokio::test]
async fn test_session_limit() {
    let config = SessionConfig {
        max_sessions: 1,
        ..SessionConfig::default()
    };
    let mgr = manager_with(sandbox_config(), config);
    let alice = user_auth("alice");
    let (first, _events) = mgr.create_session(&alice).await.unwrap();
    assert!(matches!(
        mgr.create_session(&alice).await,
        Err(Error::CapacityExceeded(_))
    ));

    mgr.on_disconnect(first.id).await.unwrap();
    assert!(mgr.create_session(&alice).await.is_ok());
}

#[tokio::test]
async fn test_disconnect_mid_run_releases_everything() {
    let mgr = manager();
    let alice = user_auth("alice");
    let (session, mut events) = mgr.create_session(&alice).await.unwrap();

    mgr.on_run_request(session.id, &alice, "sleep 60".to_string(), None)
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::RunStarted { .. }
    ));
    assert_eq!(mgr.runner().live_processes(), 1);

    mgr.on_disconnect(session.id).await.unwrap();
    assert_eq!(mgr.runner().live_processes(), 0);
    assert_eq!(mgr.active_runs(), 0);
    assert_eq!(mgr.session_count().await, 0);
    assert!(matches!(
        mgr.on_disconnect(session.id).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_shutdown_all_kills_runs() {
    let mgr = manager();
    let alice = user_auth("alice");
    let (session, mut events) = mgr.create_session(&alice).await.unwrap();

    let run_id = mgr
        .on_run_request(session.id, &alice, "sleep 60".to_string(), None)
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::RunStarted { .. }
    ));

    mgr.shutdown_all().await;
    let got = events_until_end(&mut events, run_id).await;
    assert_eq!(end_status(&got), Some(RunStatus::Killed));
    assert_eq!(mgr.runner().live_processes(), 0);
    assert!(matches!(
        mgr.create_session(&alice).await,
        Err(Error::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_status_while_running() {
    let mgr = manager();
    let alice = user_auth("alice");
    let (session, mut events) = mgr.create_session(&alice).await.unwrap();

    let run_id = mgr
        .on_run_request(session.id, &alice, "sleep 30".to_string(), None)
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::RunStarted { .. }
    ));

    let status = mgr.session_status(session.id, &alice).await.unwrap();
    assert_eq!(status.state, SessionState::Running);
    assert_eq!(status.run_id, Some(run_id));
    assert_eq!(status.language.as_deref(), Some("sh"));
    assert_eq!(status.runs_started, 1);
    mgr.on_disconnect(session.id).await.unwrap();
}

#[tokio::test]
async fn test_stdin_backlog_drops_input() {
    let mgr = manager();
    let alice = user_auth("alice");
    let (session, mut events) = mgr.create_session(&alice).await.unwrap();

    let run_id = mgr
        .on_run_request(session.id, &alice, "sleep 30".to_string(), None)
        .await
        .unwrap();
    loop {
        if let SessionEvent::RunStarted { .. } = next_event(&mut events).await {
            break;
        }
    }

    // the program never reads, so pipe and queue fill up
    let line = "x".repeat(4000);
    for _ in 0..(coderun_sandbox::INPUT_QUEUE_LINES + 200) {
        mgr.on_input_line(session.id, &alice, &line).await.unwrap();
    }
    loop {
        match next_event(&mut events).await {
            SessionEvent::InputDropped { run_id: id, reason } => {
                assert_eq!(id, run_id);
                assert!(reason.contains("backlog"));
                break;
            }
            SessionEvent::NoActiveRun { .. } => panic!("run should still be live"),
            _ => {}
        }
    }
    mgr.on_disconnect(session.id).await.unwrap();
}

#[tokio::test]
async fn test_input_queued_during_compile_is_bounded() {
    let mut sandbox = sandbox_config();
    sandbox.languages.insert(
        "slow".to_string(),
        coderun_sandbox::LanguageProfile {
            source_file: "main.sh".to_string(),
            compile: Some(vec!["sleep".to_string(), "2".to_string()]),
            run: vec!["sh".to_string(), "{source}".to_string()],
            image: None,
        },
    );
    let mgr = manager_with(sandbox, SessionConfig::default());
    let alice = user_auth("alice");
    let (session, mut events) = mgr.create_session(&alice).await.unwrap();

    let run_id = mgr
        .on_run_request(
            session.id,
            &alice,
            "sleep 30".to_string(),
            Some("slow".to_string()),
        )
        .await
        .unwrap();
    for i in 0..=coderun_sandbox::INPUT_QUEUE_LINES {
        mgr.on_input_line(session.id, &alice, &i.to_string())
            .await
            .unwrap();
    }

    // exactly one line overflows, before the program starts
    match next_event(&mut events).await {
        SessionEvent::InputDropped { run_id: id, .. } => assert_eq!(id, run_id),
        other => panic!("expected input_dropped, got {:?}", other),
    }
    mgr.on_cancel(session.id, &alice).await.unwrap();
    let rest = events_until_end(&mut events, run_id).await;
    assert!(rest
        .iter()
        .all(|e| !matches!(e, SessionEvent::InputDropped { .. })));
}
