//! Event conversion for the run WebSocket.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use coderun_core::SessionEvent;
use coderun_sandbox::OutputChunk;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::websocket::protocol::GatewayFrame;

/// Convert a SessionEvent to a GatewayFrame::Event tagged with its session.
pub fn convert_event(session_id: Uuid, event: &SessionEvent) -> GatewayFrame {
    let data = match event {
        SessionEvent::RunStarted { run_id, language } => json!({
            "session_id": session_id,
            "run_id": run_id,
            "language": language,
        }),
        SessionEvent::Output { run_id, chunk } => {
            let mut data = encode_chunk(chunk);
            data["session_id"] = json!(session_id);
            data["run_id"] = json!(run_id);
            data
        }
        SessionEvent::CompileError {
            run_id,
            diagnostics,
            exit_code,
        } => json!({
            "session_id": session_id,
            "run_id": run_id,
            "diagnostics": diagnostics,
            "exit_code": exit_code,
        }),
        SessionEvent::RunEnded {
            run_id,
            status,
            output_bytes,
            duration_ms,
        } => json!({
            "session_id": session_id,
            "run_id": run_id,
            "status": status.as_str(),
            "exit_code": status.exit_code(),
            "output_bytes": output_bytes,
            "duration_ms": duration_ms,
        }),
        SessionEvent::RunCancelled { run_id } => json!({
            "session_id": session_id,
            "run_id": run_id,
        }),
        SessionEvent::InputDropped { run_id, reason } => json!({
            "session_id": session_id,
            "run_id": run_id,
            "reason": reason,
        }),
        SessionEvent::NoActiveRun { request } => json!({
            "session_id": session_id,
            "request": request,
        }),
    };

    GatewayFrame::event(event.name(), data)
}

/// Wire form of an output chunk: text when the bytes are valid UTF-8,
/// base64 otherwise.
pub fn encode_chunk(chunk: &OutputChunk) -> Value {
    let (encoding, data) = match std::str::from_utf8(&chunk.data) {
        Ok(text) => ("utf8", text.to_string()),
        Err(_) => ("base64", STANDARD.encode(&chunk.data)),
    };
    json!({
        "seq": chunk.seq,
        "stream": chunk.stream,
        "encoding": encoding,
        "data": data,
        "truncated": chunk.truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use coderun_sandbox::{RunStatus, StreamKind};

    fn event_name(frame: &GatewayFrame) -> &str {
        match frame {
            GatewayFrame::Event { event, .. } => event,
            _ => panic!("expected event frame"),
        }
    }

    fn event_data(frame: GatewayFrame) -> Value {
        match frame {
            GatewayFrame::Event { data, .. } => data,
            _ => panic!("expected event frame"),
        }
    }

    #[test]
    fn test_convert_all_events() {
        let session = Uuid::new_v4();
        let run_id = Uuid::new_v4();
        let events = vec![
            SessionEvent::RunStarted {
                run_id,
                language: "sh".to_string(),
            },
            SessionEvent::Output {
                run_id,
                chunk: OutputChunk {
                    seq: 0,
                    stream: StreamKind::Stdout,
                    data: b"hi".to_vec(),
                    truncated: false,
                },
            },
            SessionEvent::CompileError {
                run_id,
                diagnostics: "error".to_string(),
                exit_code: Some(1),
            },
            SessionEvent::RunEnded {
                run_id,
                status: RunStatus::Exited { code: 0 },
                output_bytes: 2,
                duration_ms: 5,
            },
            SessionEvent::RunCancelled { run_id },
            SessionEvent::InputDropped {
                run_id,
                reason: "stdin backlog full (256 lines)".to_string(),
            },
            SessionEvent::NoActiveRun {
                request: "input".to_string(),
            },
        ];

        for event in events {
            let frame = convert_event(session, &event);
            assert_eq!(event_name(&frame), event.name());
            let json = frame.to_json();
            assert!(json.contains("\"frame\":\"event\""));
            assert!(json.contains(&session.to_string()));
        }
    }

    #[test]
    fn test_output_utf8_encoding() {
        let run_id = Uuid::new_v4();
        let frame = convert_event(
            Uuid::new_v4(),
            &SessionEvent::Output {
                run_id,
                chunk: OutputChunk {
                    seq: 3,
                    stream: StreamKind::Stderr,
                    data: "héllo\n".as_bytes().to_vec(),
                    truncated: false,
                },
            },
        );
        let data = event_data(frame);
        assert_eq!(data["encoding"], "utf8");
        assert_eq!(data["data"], "héllo\n");
        assert_eq!(data["stream"], "stderr");
        assert_eq!(data["seq"], 3);
        assert_eq!(data["run_id"], run_id.to_string());
    }

    #[test]
    fn test_output_binary_is_base64() {
        let chunk = OutputChunk {
            seq: 0,
            stream: StreamKind::Stdout,
            data: vec![0xff, 0xfe, 0x00],
            truncated: false,
        };
        let data = encode_chunk(&chunk);
        assert_eq!(data["encoding"], "base64");
        let decoded = STANDARD.decode(data["data"].as_str().unwrap()).unwrap();
        assert_eq!(decoded, vec![0xff, 0xfe, 0x00]);
    }

    #[test]
    fn test_run_ended_flattens_status() {
        let frame = convert_event(
            Uuid::new_v4(),
            &SessionEvent::RunEnded {
                run_id: Uuid::new_v4(),
                status: RunStatus::Exited { code: 3 },
                output_bytes: 10,
                duration_ms: 1,
            },
        );
        let data = event_data(frame);
        assert_eq!(data["status"], "exited");
        assert_eq!(data["exit_code"], 3);
        assert_eq!(data["output_bytes"], 10);

        let frame = convert_event(
            Uuid::new_v4(),
            &SessionEvent::RunEnded {
                run_id: Uuid::new_v4(),
                status: RunStatus::TimedOut,
                output_bytes: 0,
                duration_ms: 1,
            },
        );
        let data = event_data(frame);
        assert_eq!(data["status"], "timed_out");
        assert!(data["exit_code"].is_null());
    }
}
