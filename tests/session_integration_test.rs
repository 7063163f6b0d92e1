//! Session Integration Tests
//!
//! Drives `SessionManager` and `Session` against the in-process server in
//! `support`. Covers:
//! - SRP, ECDHE, static-key and resume authentication
//! - Ticket refill by ticket_request and by re-handshake
//! - Pool-bounded concurrency, cancellation and timeouts
//! - Fatal errors tearing the session down

mod support;

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use sessionwire::{CallOptions, SessionError, SessionEvent, SessionOptions, Strategy, TransportError};
use support::{manager, manager_with, record_events, SimServer};

fn srp(username: &str, password: &str) -> SessionOptions {
    SessionOptions::new(Strategy::Srp {
        username: username.to_string(),
        password: password.to_string(),
        mixer: None,
    })
}

fn ecdhe() -> SessionOptions {
    SessionOptions::new(Strategy::Ecdhe)
}

// === Authentication ===

#[tokio::test]
async fn test_srp_session_end_to_end() {
    let server = SimServer::new();
    server.add_account("alice", "pw", None);
    let manager = manager(&server);

    let session = manager.create_session(srp("alice", "pw")).await.unwrap();
    assert!(session.is_connected());
    assert_eq!(session.server(), "http://sim.test:8080");
    assert_eq!(session.tickets_count(), 10);

    assert_eq!(session.call("ping", json!({})).await.unwrap(), json!("pong"));
    assert_eq!(
        session.call("echo", json!({ "n": 1 })).await.unwrap(),
        json!({ "n": 1 })
    );

    // One ticket per call, nothing requested while the pool is healthy
    assert_eq!(session.tickets_count(), 8);
    assert_eq!(server.full_handshakes(), 1);
    assert_eq!(server.ticket_requests(), 0);

    let calls = server.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].method, "ping");
    assert_eq!(calls[1].method, "echo");
    assert_eq!(calls[1].params, json!({ "n": 1 }));
}

#[tokio::test]
async fn test_srp_wrong_password_rejected() {
    let server = SimServer::new();
    server.add_account("alice", "pw", None);
    let manager = manager(&server);

    let err = manager
        .create_session(srp("alice", "not-pw"))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Alert(_)), "got {err:?}");
    assert_eq!(server.full_handshakes(), 0);
    // The failed session released its server
    assert_eq!(manager.registry().server_count(), 0);
}

#[tokio::test]
async fn test_srp_unknown_identity_rejected() {
    let server = SimServer::new();
    let manager = manager(&server);

    let err = manager.create_session(srp("mallory", "pw")).await.unwrap_err();
    assert!(matches!(err, SessionError::Alert(_)));
}

#[tokio::test]
async fn test_srp_with_pbkdf2_login_data() {
    use base64::{engine::general_purpose::STANDARD, Engine};

    let server = SimServer::new();
    server.add_account(
        "bob",
        "hunter2",
        Some(json!({
            "algorithm": "PBKDF2",
            "hash": "SHA512",
            "salt": STANDARD.encode(b"login-salt"),
            "rounds": 1000,
            "length": 32,
        })),
    );
    let manager = manager(&server);

    let session = manager.create_session(srp("bob", "hunter2")).await.unwrap();
    assert_eq!(session.call("ping", json!({})).await.unwrap(), json!("pong"));

    let err = manager.create_session(srp("bob", "hunter3")).await.unwrap_err();
    assert!(matches!(err, SessionError::Alert(_)));
}

#[tokio::test]
async fn test_ecdhe_session() {
    let server = SimServer::new();
    let manager = manager(&server);

    let session = manager.create_session(ecdhe()).await.unwrap();
    assert_eq!(session.call("ping", json!({})).await.unwrap(), json!("pong"));
    assert_eq!(server.full_handshakes(), 1);
}

#[tokio::test]
async fn test_static_key_session() {
    let server = SimServer::new();
    server.add_static_key("device-1", &[5u8; 32]);
    let manager = manager(&server);

    let session = manager
        .create_session(SessionOptions::new(Strategy::Key {
            key_id: "device-1".into(),
            key: vec![5u8; 32],
        }))
        .await
        .unwrap();
    assert_eq!(
        session.call("echo", json!(["a", "b"])).await.unwrap(),
        json!(["a", "b"])
    );
}

#[tokio::test]
async fn test_static_key_mismatch_fails() {
    let server = SimServer::new();
    server.add_static_key("device-1", &[5u8; 32]);
    let manager = manager(&server);

    let unknown = manager
        .create_session(SessionOptions::new(Strategy::Key {
            key_id: "device-2".into(),
            key: vec![5u8; 32],
        }))
        .await
        .unwrap_err();
    assert!(matches!(unknown, SessionError::Alert(_)));

    // Wrong key bytes: the handshake carries nothing encrypted, so the
    // mismatch surfaces on the first resumed call and is fatal
    let wrong = manager
        .create_session(SessionOptions::new(Strategy::Key {
            key_id: "device-1".into(),
            key: vec![6u8; 32],
        }))
        .await
        .unwrap();
    let err = wrong.call("ping", json!({})).await.unwrap_err();
    assert!(err.is_fatal(), "got {err:?}");
    assert!(!wrong.is_connected());
}

#[tokio::test]
async fn test_events_for_connect_and_disconnect() {
    let server = SimServer::new();
    let manager = manager(&server);
    let events = record_events(&manager);

    let session = manager.create_session(ecdhe()).await.unwrap();
    session.disconnect();
    session.disconnect();

    let events = events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            SessionEvent::TicketsRefilled {
                session: session.id().to_string(),
                count: 10,
            },
            SessionEvent::Connected {
                session: session.id().to_string(),
                server: "http://sim.test:8080".into(),
                strategy: "ecdhe",
            },
            SessionEvent::Disconnected {
                session: session.id().to_string(),
                reason: SessionError::ConnectionClosed.to_string(),
            },
        ]
    );
}

// === Tickets ===

#[tokio::test]
async fn test_ticket_request_refills_pool() {
    let server = SimServer::new();
    server.set_tickets_per_handshake(2);
    let manager = manager(&server);

    let session = manager.create_session(ecdhe()).await.unwrap();
    assert_eq!(session.tickets_count(), 2);

    session.call("ping", json!({})).await.unwrap();
    // Below the minimum: the call carried a ticket_request for 10 more
    assert_eq!(server.ticket_requests(), 1);
    assert_eq!(session.tickets_count(), 11);
    assert_eq!(server.full_handshakes(), 1);
}

#[tokio::test]
async fn test_empty_pool_triggers_full_handshake() {
    let server = SimServer::new();
    server.set_tickets_per_handshake(1);
    server.set_refuse_ticket_requests(true);
    let manager = manager(&server);

    let session = manager.create_session(ecdhe()).await.unwrap();
    session.call("ping", json!({})).await.unwrap();
    assert_eq!(session.tickets_count(), 0);

    session.call("ping", json!({})).await.unwrap();
    assert_eq!(server.full_handshakes(), 2);
    assert!(session.is_connected());
}

#[tokio::test]
async fn test_resume_only_session_runs_dry() {
    let server = SimServer::new();
    server.set_refuse_ticket_requests(true);
    let secret = vec![7u8; 32];
    let tickets = server.issue_tickets(2, &secret);
    let manager = manager(&server);

    let session = manager
        .create_session(SessionOptions::new(Strategy::Resume {
            tickets,
            ttl_secs: support::TICKET_TTL,
            master_secret: secret,
        }))
        .await
        .unwrap();
    assert_eq!(session.tickets_count(), 2);

    session.call("ping", json!({})).await.unwrap();
    session.call("ping", json!({})).await.unwrap();
    let err = session.call("ping", json!({})).await.unwrap_err();
    assert_eq!(err, SessionError::NoTickets);
    assert!(err.is_retryable());
    // Running dry is not fatal
    assert!(session.is_connected());
    assert_eq!(server.full_handshakes(), 0);
}

#[tokio::test]
async fn test_resume_ticket_is_single_use() {
    let server = SimServer::new();
    server.set_refuse_ticket_requests(true);
    let secret = vec![3u8; 32];
    let tickets = server.issue_tickets(1, &secret);
    let manager = manager(&server);

    let resume = || {
        SessionOptions::new(Strategy::Resume {
            tickets: tickets.clone(),
            ttl_secs: support::TICKET_TTL,
            master_secret: secret.clone(),
        })
    };
    let first = manager.create_session(resume()).await.unwrap();
    first.call("ping", json!({})).await.unwrap();

    // Replaying the spent ticket is refused by the server
    let second = manager.create_session(resume()).await.unwrap();
    let err = second.call("ping", json!({})).await.unwrap_err();
    assert!(err.is_fatal(), "got {err:?}");
    assert!(!second.is_connected());
}

// === Calls ===

#[tokio::test]
async fn test_remote_error_is_not_fatal() {
    let server = SimServer::new();
    let manager = manager(&server);
    let session = manager.create_session(ecdhe()).await.unwrap();

    let err = session.call("fail", json!({})).await.unwrap_err();
    assert_eq!(
        err,
        SessionError::Remote {
            code: 42,
            message: "requested failure".into()
        }
    );
    assert!(session.is_connected());
    assert_eq!(session.call("ping", json!({})).await.unwrap(), json!("pong"));
}

#[tokio::test]
async fn test_concurrent_calls_bounded_by_pool() {
    let server = SimServer::new();
    server.set_post_delay(Some(Duration::from_millis(30)));
    let manager = manager_with(&server, support::config(2));
    let session = manager.create_session(ecdhe()).await.unwrap();

    let calls = (0..6).map(|i| {
        let session = session.clone();
        async move { session.call("echo", json!(i)).await }
    });
    let results = join_all(calls).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), json!(i));
    }
    assert!(server.max_concurrent_posts() <= 2);
    assert_eq!(server.calls().len(), 6);
}

#[tokio::test]
async fn test_cancel_aborts_call() {
    let server = SimServer::new();
    let manager = manager(&server);
    let session = manager.create_session(ecdhe()).await.unwrap();
    server.set_post_delay(Some(Duration::from_secs(5)));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let err = session
        .send("ping", json!({}), CallOptions::default(), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(session.is_connected());

    // The slot went back to the pool
    server.set_post_delay(None);
    assert_eq!(session.call("ping", json!({})).await.unwrap(), json!("pong"));
}

#[tokio::test]
async fn test_call_timeout() {
    let server = SimServer::new();
    let manager = manager(&server);
    let session = manager.create_session(ecdhe()).await.unwrap();
    server.set_post_delay(Some(Duration::from_millis(500)));

    let options = CallOptions {
        timeout: Some(Duration::from_millis(50)),
        ..CallOptions::default()
    };
    let err = session
        .send("ping", json!({}), options, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, SessionError::Timeout);
    assert!(session.is_connected());
}

#[tokio::test]
async fn test_http_error_status_surfaces() {
    let server = SimServer::new();
    let manager = manager(&server);
    let session = manager.create_session(ecdhe()).await.unwrap();
    server.set_status_override(Some(502));

    let err = session.call("ping", json!({})).await.unwrap_err();
    assert_eq!(
        err,
        SessionError::Transport(TransportError::InvalidStatus { status: 502 })
    );
    assert!(err.is_retryable());
    assert!(session.is_connected());
}

#[tokio::test]
async fn test_tampered_reply_disconnects_session() {
    let server = SimServer::new();
    let manager = manager(&server);
    let events = record_events(&manager);
    let session = manager.create_session(ecdhe()).await.unwrap();
    server.set_corrupt_replies(true);

    let err = session.call("ping", json!({})).await.unwrap_err();
    assert!(matches!(err, SessionError::Protocol(_)), "got {err:?}");
    assert!(!session.is_connected());
    assert_eq!(session.tickets_count(), 0);

    let err = session.call("ping", json!({})).await.unwrap_err();
    assert_eq!(err, SessionError::ConnectionClosed);

    let disconnected = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, SessionEvent::Disconnected { .. }))
        .count();
    assert_eq!(disconnected, 1);
}

// === Plaintext ===

#[tokio::test]
async fn test_send_plain_without_session() {
    let server = SimServer::new();
    let manager = manager(&server);

    let info = manager
        .send_plain(None, "server_info", json!({}))
        .await
        .unwrap();
    assert_eq!(info, json!({ "version": "sim" }));

    let err = manager
        .send_plain(None, "echo", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Remote { code: 401, .. }));
}

#[tokio::test]
async fn test_force_plaintext_spends_no_ticket() {
    let server = SimServer::new();
    let manager = manager(&server);
    let session = manager.create_session(ecdhe()).await.unwrap();

    let options = CallOptions {
        force_plaintext: true,
        ..CallOptions::default()
    };
    let reply = session
        .send("ping", json!({}), options, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(reply, json!("pong"));
    assert_eq!(session.tickets_count(), 10);
}

// === Lifecycle ===

#[tokio::test]
async fn test_manager_shutdown_disconnects_sessions() {
    let server = SimServer::new();
    let manager = manager(&server);
    let first = manager.create_session(ecdhe()).await.unwrap();
    let second = manager.create_session(ecdhe()).await.unwrap();
    assert_eq!(manager.registry().server_count(), 1);

    manager.shutdown();
    assert!(!first.is_connected());
    assert!(!second.is_connected());
    assert_eq!(
        first.call("ping", json!({})).await.unwrap_err(),
        SessionError::ConnectionClosed
    );
    assert_eq!(
        manager.create_session(ecdhe()).await.unwrap_err(),
        SessionError::ConnectionClosed
    );
}

#[tokio::test]
async fn test_sessions_share_server_pool() {
    let server = SimServer::new();
    let manager = manager(&server);
    let first = manager.create_session(ecdhe()).await.unwrap();
    let second = manager.create_session(ecdhe()).await.unwrap();

    let registry = Arc::clone(manager.registry());
    assert_eq!(registry.server_count(), 1);

    first.disconnect();
    assert_eq!(registry.server_count(), 1);
    assert_eq!(second.call("ping", json!({})).await.unwrap(), json!("pong"));

    second.disconnect();
    assert_eq!(registry.server_count(), 0);
}
