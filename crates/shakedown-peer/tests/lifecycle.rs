//! End-to-end session lifecycle tests against the real peer binary.
//!
//! These exercise the full contract: spawn, handshake, optional mutual
//! TLS, byte-exact KV round-trips, teardown without residue, and every
//! misbehaving-peer failure mode.

use std::time::{Duration, Instant};

use shakedown_core::config::PluginConfigBuilder;
use shakedown_core::{
    HandshakeError, KV_PROTOCOL_ID, KeyType, PluginConfig, Session, SessionError, SessionState,
    TlsMode, install_crypto_provider,
};

const PEER_BIN: &str = env!("CARGO_BIN_EXE_shakedown-peer");

fn peer_config() -> PluginConfigBuilder {
    PluginConfig::builder(PEER_BIN).connect_timeout(Duration::from_secs(10))
}

async fn assert_roundtrip(session: &Session) {
    let all_bytes: Vec<u8> = (0u8..=255).collect();
    session.put("bytes", &all_bytes).await.unwrap();
    assert_eq!(session.get("bytes").await.unwrap().unwrap(), all_bytes);

    session.put("empty", b"").await.unwrap();
    assert_eq!(session.get("empty").await.unwrap().unwrap(), b"");

    assert!(session.get("never-written").await.unwrap().is_none());
}

#[tokio::test]
async fn plaintext_tcp_session_roundtrips_bytes() {
    let config = peer_config().build().unwrap();
    let mut session = Session::start(&config).await.unwrap();

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.handshake().protocol, KV_PROTOCOL_ID);

    assert_roundtrip(&session).await;

    // Last put wins on the same key.
    session.put("k", b"first").await.unwrap();
    session.put("k", b"second").await.unwrap();
    assert_eq!(session.get("k").await.unwrap().unwrap(), b"second");

    let status = session.close().await;
    assert!(status.is_some(), "peer was not reaped");
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn closed_session_refuses_further_calls() {
    let config = peer_config().build().unwrap();
    let mut session = Session::start(&config).await.unwrap();
    session.close().await;

    assert!(matches!(
        session.put("k", b"v").await,
        Err(SessionError::Closed)
    ));
    assert!(matches!(session.get("k").await, Err(SessionError::Closed)));

    // close is idempotent.
    let again = session.close().await;
    assert_eq!(again, session.close().await);
}

#[tokio::test]
async fn mutual_tls_matrix_reaches_ready_and_roundtrips() {
    install_crypto_provider();

    let combos: [(KeyType, &str); 6] = [
        (KeyType::Ec, "auto"),
        (KeyType::Ec, "secp256r1"),
        (KeyType::Ec, "P-384"),
        (KeyType::Ec, "secp521r1"),
        (KeyType::Rsa, "auto"),
        // An invalid curve must be ignored for RSA.
        (KeyType::Rsa, "definitely-not-a-curve"),
    ];

    for (key_type, curve) in combos {
        let config = peer_config()
            .tls_mode(TlsMode::Auto)
            .key_type(key_type)
            .curve(curve)
            .build()
            .unwrap();

        let mut session = Session::start(&config)
            .await
            .unwrap_or_else(|e| panic!("{key_type:?}/{curve} failed to start: {e}"));
        assert!(session.handshake().server_cert.is_some());

        assert_roundtrip(&session).await;
        assert!(session.close().await.is_some());
    }
}

#[tokio::test]
async fn unix_transport_roundtrips_plain_and_tls() {
    install_crypto_provider();

    for tls_mode in [TlsMode::Disabled, TlsMode::Auto] {
        let config = peer_config()
            .tls_mode(tls_mode)
            .env("SHAKEDOWN_PEER_NETWORK", "unix")
            .build()
            .unwrap();

        let mut session = Session::start(&config).await.unwrap();
        assert_eq!(
            session.handshake().network,
            shakedown_core::Network::Unix
        );
        assert_roundtrip(&session).await;
        assert!(session.close().await.is_some());
    }
}

#[tokio::test]
async fn missing_binary_fails_fast_with_binary_not_found() {
    let config = PluginConfig::builder("/nonexistent/shakedown-peer")
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap();

    let started = Instant::now();
    let err = Session::start(&config).await.unwrap_err();

    assert!(matches!(err, SessionError::BinaryNotFound { .. }));
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "BinaryNotFound must not consume the connection timeout"
    );
}

#[tokio::test]
async fn unresponsive_peer_times_out_at_the_configured_budget() {
    let config = peer_config()
        .connect_timeout(Duration::from_secs(2))
        .env("SHAKEDOWN_PEER_MODE", "hang")
        .build()
        .unwrap();

    let started = Instant::now();
    let err = Session::start(&config).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, SessionError::HandshakeTimeout { .. }));
    assert!(
        elapsed >= Duration::from_millis(1800),
        "timed out early: {elapsed:?}"
    );
    assert!(
        elapsed <= Duration::from_millis(3500),
        "timeout overshot the budget: {elapsed:?}"
    );
}

#[tokio::test]
async fn malformed_handshake_line_is_a_parse_error() {
    let config = peer_config()
        .connect_timeout(Duration::from_secs(5))
        .env("SHAKEDOWN_PEER_MODE", "bad-handshake")
        .build()
        .unwrap();

    let err = Session::start(&config).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Handshake(HandshakeError::Parse(_))
    ));
}

#[tokio::test]
async fn peer_exiting_without_handshake_is_process_exited() {
    let config = peer_config()
        .env("SHAKEDOWN_PEER_MODE", "exit")
        .build()
        .unwrap();

    let err = Session::start(&config).await.unwrap_err();
    assert!(matches!(err, SessionError::ProcessExited { .. }));
}

#[tokio::test]
async fn sequential_cycles_leave_no_residue() {
    for cycle in 0..8 {
        let config = peer_config().build().unwrap();
        let mut session = Session::start(&config).await.unwrap();

        let key = format!("cycle-{cycle}");
        session.put(&key, b"value").await.unwrap();
        assert_eq!(session.get(&key).await.unwrap().unwrap(), b"value");

        // Every session gets a fresh peer: earlier cycles' keys are gone.
        if cycle > 0 {
            let previous = format!("cycle-{}", cycle - 1);
            assert!(session.get(&previous).await.unwrap().is_none());
        }

        let status = session.close().await;
        assert!(status.is_some(), "cycle {cycle} left an unreaped peer");
    }
}

#[tokio::test]
async fn cancelling_start_mid_handshake_converges() {
    let config = peer_config()
        .connect_timeout(Duration::from_secs(30))
        .env("SHAKEDOWN_PEER_MODE", "hang")
        .build()
        .unwrap();

    let started = Instant::now();
    let result = tokio::time::timeout(Duration::from_millis(300), Session::start(&config)).await;

    // The start future is dropped mid-handshake; the spawned peer is
    // killed by the drop guard rather than living out the 30s budget.
    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn concurrent_calls_on_one_session_stay_isolated() {
    let config = peer_config().build().unwrap();
    let session = std::sync::Arc::new(Session::start(&config).await.unwrap());

    let mut tasks = Vec::new();
    for i in 0u8..8 {
        let session = std::sync::Arc::clone(&session);
        tasks.push(tokio::spawn(async move {
            let key = format!("task-{i}");
            let value = vec![i; 1024];
            session.put(&key, &value).await.unwrap();
            assert_eq!(session.get(&key).await.unwrap().unwrap(), value);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut session = std::sync::Arc::try_unwrap(session)
        .unwrap_or_else(|_| panic!("session still shared after tasks joined"));
    assert!(session.close().await.is_some());
}

#[tokio::test]
async fn file_backed_store_persists_under_the_configured_directory() {
    let store_dir = tempfile::tempdir().unwrap();
    let config = peer_config()
        .env("SHAKEDOWN_STORE_DIR", store_dir.path().display().to_string())
        .build()
        .unwrap();

    let mut session = Session::start(&config).await.unwrap();
    session.put("persisted", b"on-disk").await.unwrap();
    assert_eq!(
        session.get("persisted").await.unwrap().unwrap(),
        b"on-disk"
    );
    session.close().await;

    assert_eq!(
        std::fs::read(store_dir.path().join("kv_persisted")).unwrap(),
        b"on-disk"
    );
}

#[test]
fn peer_refuses_direct_execution_without_activation_secret() {
    let output = std::process::Command::new(PEER_BIN)
        .env_remove("SHAKEDOWN_PLUGIN")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(
        String::from_utf8_lossy(&output.stderr).contains("not meant to be executed directly")
    );
}
