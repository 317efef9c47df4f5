use super::*;
use crate::errors::ErrorCode;
use crate::runtime::MockEngine;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;

const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

fn manager_with(engine: Arc<MockEngine>, config: SessionConfig) -> SessionManager {
    let runtime = ContainerRuntime::new(engine, true);
    SessionManager::new(runtime, Arc::new(LanguageRegistry::builtin()), config, 4096)
        .expect("guard patterns compile")
}

fn manager(engine: Arc<MockEngine>) -> SessionManager {
    manager_with(engine, SessionConfig::default())
}

fn sink() -> (EventSink, mpsc::Receiver<SessionEvent>) {
    mpsc::channel(64)
}

async fn next_event(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("event within timeout")
        .expect("sink open")
}

/// Concatenate data events until `needle` shows up.
async fn read_until(rx: &mut mpsc::Receiver<SessionEvent>, needle: &str) -> String {
    let mut seen = String::new();
    while !seen.contains(needle) {
        match next_event(rx).await {
            SessionEvent::Data { chunk, .. } => seen.push_str(&String::from_utf8_lossy(&chunk)),
            other => panic!("unexpected event while waiting for {:?}: {:?}", needle, other),
        }
    }
    seen
}

/// Skip data events and return the first event of another kind.
async fn next_non_data(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    loop {
        match next_event(rx).await {
            SessionEvent::Data { .. } => continue,
            other => return other,
        }
    }
}

async fn start_ready(
    manager: &SessionManager,
    connection: &str,
    language: &str,
    sink: EventSink,
    rx: &mut mpsc::Receiver<SessionEvent>,
) -> SessionId {
    let outcome = manager
        .start(connection, SessionContext::new(language), sink)
        .await
        .expect("session starts");
    let StartOutcome::Ready(session_id) = outcome else {
        panic!("expected a ready session, got {:?}", outcome);
    };
    assert_eq!(
        next_event(rx).await,
        SessionEvent::Ready {
            session_id: session_id.clone()
        }
    );
    session_id
}

fn container_of(manager: &SessionManager, session_id: &str) -> String {
    manager
        .get(session_id)
        .and_then(|info| info.container_id)
        .expect("session has a container")
}

#[tokio::test]
async fn test_ready_is_first_event_and_input_is_echoed() {
    let engine = Arc::new(MockEngine::new().with_banner("welcome\n"));
    let manager = manager(Arc::clone(&engine));
    let (tx, mut rx) = sink();

    let session_id = start_ready(&manager, "conn-1", "bash", tx, &mut rx).await;
    read_until(&mut rx, "welcome").await;

    manager
        .input("conn-1", &session_id, RawInput::from("echo hi\n"))
        .expect("input accepted");
    let output = read_until(&mut rx, "hi").await;
    assert!(output.contains("echo hi"));

    let container = container_of(&manager, &session_id);
    assert_eq!(engine.pty_input(&container), b"echo hi\n".to_vec());
}

#[tokio::test]
async fn test_session_info_tracks_status_and_language() {
    let engine = Arc::new(MockEngine::new());
    let manager = manager(engine);
    let (tx, mut rx) = sink();

    let session_id = start_ready(&manager, "conn-1", "py", tx, &mut rx).await;
    let info = manager.get(&session_id).expect("session listed");
    assert_eq!(info.language, "python");
    assert_eq!(info.connection_id, "conn-1");
    assert_eq!(info.status, SessionStatus::Ready);

    manager
        .input("conn-1", &session_id, RawInput::from("1 + 1"))
        .expect("input accepted");
    assert_eq!(manager.get(&session_id).map(|i| i.status), Some(SessionStatus::Active));
    assert_eq!(manager.list().len(), 1);
}

#[tokio::test]
async fn test_unknown_language_is_rejected_without_a_container() {
    let engine = Arc::new(MockEngine::new());
    let manager = manager(Arc::clone(&engine));
    let (tx, _rx) = sink();

    let err = manager
        .start("conn-1", SessionContext::new("cobol"), tx)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::UnsupportedLanguage(_)));
    assert!(engine.created().is_empty());
    assert_eq!(manager.count(), 0);
}

#[tokio::test]
async fn test_stop_destroys_container_and_is_idempotent() {
    let engine = Arc::new(MockEngine::new());
    let manager = manager(Arc::clone(&engine));
    let (tx, mut rx) = sink();

    let session_id = start_ready(&manager, "conn-1", "bash", tx, &mut rx).await;
    assert_eq!(engine.live_count(), 1);

    manager.stop("conn-1", &session_id).await;
    assert_eq!(
        next_event(&mut rx).await,
        SessionEvent::Exit {
            session_id: session_id.clone(),
            code: None,
            reason: Some(ExitReason::Stopped),
        }
    );
    assert_eq!(manager.count(), 0);
    assert_eq!(engine.live_count(), 0);

    manager.stop("conn-1", &session_id).await;
    manager.stop("conn-1", "no-such-session").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(engine.removed().len(), 1);
}

#[tokio::test]
async fn test_input_and_resize_after_stop_report_session_not_found() {
    let engine = Arc::new(MockEngine::new());
    let manager = manager(engine);
    let (tx, mut rx) = sink();

    let session_id = start_ready(&manager, "conn-1", "bash", tx.clone(), &mut rx).await;
    manager.stop("conn-1", &session_id).await;
    next_non_data(&mut rx).await;

    let err = manager
        .input("conn-1", &session_id, RawInput::from("ls\n"))
        .unwrap_err();
    assert!(matches!(err, ExecError::SessionNotFound(_)));
    assert_eq!(err.to_string(), "session not found");

    let err = manager.resize("conn-1", &session_id, 100, 30).unwrap_err();
    assert!(matches!(err, ExecError::SessionNotFound(_)));

    manager
        .dispatch(
            "conn-1",
            TerminalCommand::SendInput {
                session_id: session_id.clone(),
                input: RawInput::from("ls\n"),
            },
            &tx,
        )
        .await;
    assert_eq!(
        next_event(&mut rx).await,
        SessionEvent::Error {
            session_id: Some(session_id),
            message: "session not found".to_string(),
            code: Some(ErrorCode::SessionNotFound),
        }
    );
}

#[tokio::test]
async fn test_sessions_are_private_to_their_connection() {
    let engine = Arc::new(MockEngine::new());
    let manager = manager(Arc::clone(&engine));
    let (tx, mut rx) = sink();

    let session_id = start_ready(&manager, "owner", "bash", tx, &mut rx).await;

    let err = manager
        .input("intruder", &session_id, RawInput::from("id\n"))
        .unwrap_err();
    assert!(matches!(err, ExecError::SessionNotFound(_)));

    manager.stop("intruder", &session_id).await;
    assert_eq!(manager.count(), 1);
    assert_eq!(engine.live_count(), 1);
}

#[tokio::test]
async fn test_dangerous_payload_never_reaches_the_pty() {
    let engine = Arc::new(MockEngine::new());
    let manager = manager(Arc::clone(&engine));
    let (tx, mut rx) = sink();

    let session_id = start_ready(&manager, "conn-1", "bash", tx, &mut rx).await;
    let container = container_of(&manager, &session_id);

    let err = manager
        .input("conn-1", &session_id, RawInput::from(":(){ :|:& };:\n"))
        .unwrap_err();
    assert!(matches!(err, ExecError::SecurityViolation(_)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let written = String::from_utf8_lossy(&engine.pty_input(&container)).into_owned();
    assert!(!written.contains(":(){"));

    // the session survives a rejected payload
    manager
        .input("conn-1", &session_id, RawInput::from("echo ok\n"))
        .expect("later input accepted");
}

#[tokio::test]
async fn test_dangerous_line_typed_key_by_key_is_not_submitted() {
    let engine = Arc::new(MockEngine::new());
    let manager = manager(Arc::clone(&engine));
    let (tx, mut rx) = sink();

    let session_id = start_ready(&manager, "conn-1", "bash", tx, &mut rx).await;
    let container = container_of(&manager, &session_id);

    for key in "rm -rf /".chars() {
        manager
            .input("conn-1", &session_id, RawInput::Text(key.to_string()))
            .expect("single keystrokes pass");
    }
    let err = manager
        .input("conn-1", &session_id, RawInput::from("\r"))
        .unwrap_err();
    assert!(matches!(err, ExecError::SecurityViolation(_)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let written = engine.pty_input(&container);
    assert!(!written.contains(&b'\r'));
    assert_eq!(written.last(), Some(&0x15));
}

#[tokio::test]
async fn test_session_limits_are_enforced() {
    let engine = Arc::new(MockEngine::new());
    let config = SessionConfig {
        max_sessions: 2,
        max_sessions_per_connection: 1,
        ..SessionConfig::default()
    };
    let manager = manager_with(Arc::clone(&engine), config);
    let (tx, mut rx) = sink();

    start_ready(&manager, "conn-1", "bash", tx.clone(), &mut rx).await;
    let err = manager
        .start("conn-1", SessionContext::new("bash"), tx.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::LimitExceeded(_)));

    start_ready(&manager, "conn-2", "bash", tx.clone(), &mut rx).await;
    let err = manager
        .start("conn-3", SessionContext::new("bash"), tx)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::LimitExceeded(_)));
    assert_eq!(engine.created().len(), 2);
}

#[tokio::test]
async fn test_unavailable_runtime_is_reported_once_per_connection() {
    let engine = Arc::new(MockEngine::new());
    let manager = manager(Arc::clone(&engine));
    let (tx, mut rx) = sink();
    engine.set_unreachable(true);

    let first = manager
        .start("conn-1", SessionContext::new("bash"), tx.clone())
        .await
        .expect("outage is not an error");
    assert_eq!(first, StartOutcome::Unavailable { first_notice: true });
    let repeat = manager
        .start("conn-1", SessionContext::new("bash"), tx.clone())
        .await
        .expect("outage is not an error");
    assert_eq!(repeat, StartOutcome::Unavailable { first_notice: false });
    let other = manager
        .start("conn-2", SessionContext::new("bash"), tx.clone())
        .await
        .expect("outage is not an error");
    assert_eq!(other, StartOutcome::Unavailable { first_notice: true });
    assert_eq!(manager.count(), 0);

    engine.set_unreachable(false);
    start_ready(&manager, "conn-1", "bash", tx.clone(), &mut rx).await;

    engine.set_unreachable(true);
    let again = manager
        .start("conn-1", SessionContext::new("bash"), tx)
        .await
        .expect("outage is not an error");
    assert_eq!(again, StartOutcome::Unavailable { first_notice: true });
}

#[tokio::test]
async fn test_dispatch_sends_one_unavailable_notice() {
    let engine = Arc::new(MockEngine::new());
    let manager = manager(Arc::clone(&engine));
    let (tx, mut rx) = sink();
    engine.set_unreachable(true);

    let start = || TerminalCommand::StartSession(SessionContext::new("bash"));
    manager.dispatch("conn-1", start(), &tx).await;
    manager.dispatch("conn-1", start(), &tx).await;

    match next_event(&mut rx).await {
        SessionEvent::Error { session_id, code, .. } => {
            assert_eq!(session_id, None);
            assert_eq!(code, Some(ErrorCode::RuntimeUnavailable));
        }
        other => panic!("expected an error event, got {:?}", other),
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_disconnect_stops_only_that_connections_sessions() {
    let engine = Arc::new(MockEngine::new());
    let manager = manager(Arc::clone(&engine));
    let (tx_a, mut rx_a) = sink();
    let (tx_b, mut rx_b) = sink();

    start_ready(&manager, "conn-a", "bash", tx_a.clone(), &mut rx_a).await;
    start_ready(&manager, "conn-a", "python", tx_a, &mut rx_a).await;
    let kept = start_ready(&manager, "conn-b", "bash", tx_b, &mut rx_b).await;
    assert_eq!(engine.live_count(), 3);

    manager.on_disconnect("conn-a").await;
    assert_eq!(manager.count(), 1);
    assert_eq!(manager.count_for("conn-a"), 0);
    assert!(manager.get(&kept).is_some());
    assert_eq!(engine.live_count(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(rx_a.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_program_exit_closes_the_session() {
    let engine = Arc::new(MockEngine::new());
    let manager = manager(Arc::clone(&engine));
    let (tx, mut rx) = sink();

    let session_id = start_ready(&manager, "conn-1", "bash", tx, &mut rx).await;
    manager
        .input("conn-1", &session_id, RawInput::from("exit\n"))
        .expect("input accepted");

    assert_eq!(
        next_non_data(&mut rx).await,
        SessionEvent::Exit {
            session_id: session_id.clone(),
            code: Some(0),
            reason: Some(ExitReason::Exited),
        }
    );
    assert_eq!(manager.count(), 0);
    assert_eq!(engine.live_count(), 0);
}

#[tokio::test]
async fn test_container_exit_code_is_reported() {
    let engine = Arc::new(MockEngine::new());
    let manager = manager(Arc::clone(&engine));
    let (tx, mut rx) = sink();

    let session_id = start_ready(&manager, "conn-1", "ruby", tx, &mut rx).await;
    engine.exit_container(&container_of(&manager, &session_id), 3);

    assert_eq!(
        next_non_data(&mut rx).await,
        SessionEvent::Exit {
            session_id,
            code: Some(3),
            reason: Some(ExitReason::Exited),
        }
    );
    assert_eq!(engine.live_count(), 0);
}

#[tokio::test]
async fn test_idle_sessions_are_reaped() {
    let engine = Arc::new(MockEngine::new());
    let config = SessionConfig {
        idle_timeout_secs: 60,
        max_lifetime_secs: 0,
        ..SessionConfig::default()
    };
    let manager = manager_with(Arc::clone(&engine), config);
    let (tx, mut rx) = sink();

    let session_id = start_ready(&manager, "conn-1", "bash", tx, &mut rx).await;
    assert_eq!(manager.reap_idle().await, 0);

    let later = Instant::now() + Duration::from_secs(61);
    assert_eq!(manager.reap_idle_at(later).await, 1);
    assert_eq!(
        next_event(&mut rx).await,
        SessionEvent::Exit {
            session_id,
            code: None,
            reason: Some(ExitReason::Idle),
        }
    );
    assert_eq!(engine.live_count(), 0);
}

#[tokio::test]
async fn test_lifetime_ceiling_applies_to_busy_sessions() {
    let engine = Arc::new(MockEngine::new());
    let config = SessionConfig {
        idle_timeout_secs: 0,
        max_lifetime_secs: 120,
        ..SessionConfig::default()
    };
    let manager = manager_with(engine, config);
    let (tx, mut rx) = sink();

    let session_id = start_ready(&manager, "conn-1", "bash", tx, &mut rx).await;
    manager
        .input("conn-1", &session_id, RawInput::from("true\n"))
        .expect("input accepted");

    assert_eq!(manager.reap_idle_at(Instant::now() + Duration::from_secs(60)).await, 0);
    assert_eq!(manager.reap_idle_at(Instant::now() + Duration::from_secs(121)).await, 1);
    assert_eq!(
        next_non_data(&mut rx).await,
        SessionEvent::Exit {
            session_id,
            code: None,
            reason: Some(ExitReason::Lifetime),
        }
    );
}

#[tokio::test]
async fn test_reaping_disabled_when_both_limits_are_zero() {
    let config = SessionConfig {
        idle_timeout_secs: 0,
        max_lifetime_secs: 0,
        ..SessionConfig::default()
    };
    let manager = manager_with(Arc::new(MockEngine::new()), config);
    let (tx, mut rx) = sink();

    start_ready(&manager, "conn-1", "bash", tx, &mut rx).await;
    let far = Instant::now() + Duration::from_secs(365 * 24 * 3600);
    assert_eq!(manager.reap_idle_at(far).await, 0);
    assert_eq!(manager.count(), 1);
}

#[tokio::test]
async fn test_failed_start_leaves_nothing_behind() {
    let engine = Arc::new(MockEngine::new());
    let manager = manager(Arc::clone(&engine));
    let (tx, mut rx) = sink();
    engine.set_fail_start(true);

    let err = manager
        .start("conn-1", SessionContext::new("bash"), tx)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::ContainerRuntime { .. }));
    assert_eq!(manager.count(), 0);
    assert_eq!(engine.live_count(), 0);
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_resize_reaches_the_engine() {
    let engine = Arc::new(MockEngine::new());
    let manager = manager(Arc::clone(&engine));
    let (tx, mut rx) = sink();

    let session_id = start_ready(&manager, "conn-1", "bash", tx, &mut rx).await;
    let container = container_of(&manager, &session_id);

    let err = manager.resize("conn-1", &session_id, 0, 40).unwrap_err();
    assert!(matches!(err, ExecError::Validation(_)));

    manager
        .resize("conn-1", &session_id, 120, 40)
        .expect("resize accepted");
    let expected = (container, 120, 40);
    for _ in 0..50 {
        if engine.resizes().contains(&expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("resize never reached the engine: {:?}", engine.resizes());
}

#[tokio::test]
async fn test_shutdown_closes_every_session() {
    let engine = Arc::new(MockEngine::new());
    let manager = manager(Arc::clone(&engine));
    let (tx, mut rx) = sink();

    let first = start_ready(&manager, "conn-1", "bash", tx.clone(), &mut rx).await;
    let second = start_ready(&manager, "conn-2", "bash", tx, &mut rx).await;

    manager.shutdown_all().await;
    let mut closed = Vec::new();
    for _ in 0..2 {
        match next_event(&mut rx).await {
            SessionEvent::Exit { session_id, reason, .. } => {
                assert_eq!(reason, Some(ExitReason::Shutdown));
                closed.push(session_id);
            }
            other => panic!("expected exit, got {:?}", other),
        }
    }
    closed.sort();
    let mut expected = vec![first, second];
    expected.sort();
    assert_eq!(closed, expected);
    assert_eq!(engine.live_count(), 0);
}

#[tokio::test]
async fn test_unterminated_output_is_flushed_when_the_pty_goes_quiet() {
    let engine = Arc::new(MockEngine::new().with_banner("$ "));
    let manager = manager(engine);
    let (tx, mut rx) = sink();

    let session_id = start_ready(&manager, "conn-1", "bash", tx, &mut rx).await;
    assert_eq!(
        next_event(&mut rx).await,
        SessionEvent::Data {
            session_id,
            chunk: Bytes::from_static(b"$ "),
        }
    );
}

#[tokio::test]
async fn test_trailing_carriage_return_is_released_after_a_quiet_period() {
    let engine = Arc::new(MockEngine::new().with_banner("50%\r"));
    let config = SessionConfig {
        fix_line_endings: true,
        ..SessionConfig::default()
    };
    let manager = manager_with(engine, config);
    let (tx, mut rx) = sink();

    let session_id = start_ready(&manager, "conn-1", "bash", tx, &mut rx).await;
    for expected in [&b"50%"[..], &b"\r"[..]] {
        assert_eq!(
            next_event(&mut rx).await,
            SessionEvent::Data {
                session_id: session_id.clone(),
                chunk: Bytes::copy_from_slice(expected),
            }
        );
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_outage_during_create_counts_as_the_notice() {
    let engine = Arc::new(MockEngine::new().with_create_delay(Duration::from_millis(200)));
    let manager = manager(Arc::clone(&engine));
    let (tx, _rx) = sink();

    let pending = {
        let manager = manager.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            manager
                .start("conn-1", SessionContext::new("bash"), tx)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.set_unreachable(true);

    let first = pending
        .await
        .expect("start task finishes")
        .expect("outage is not an error");
    assert_eq!(first, StartOutcome::Unavailable { first_notice: true });
    assert_eq!(manager.count(), 0);
    assert_eq!(engine.live_count(), 0);

    let repeat = manager
        .start("conn-1", SessionContext::new("bash"), tx)
        .await
        .expect("outage is not an error");
    assert_eq!(repeat, StartOutcome::Unavailable { first_notice: false });
}
