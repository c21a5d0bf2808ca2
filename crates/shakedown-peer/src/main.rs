//! shakedown-peer - reference peer for the shakedown plugin protocol.
//!
//! Spawned as a subprocess by a harness. The peer refuses to run without
//! the activation secret in its environment, binds a listener, emits
//! exactly one handshake line on stdout, and then serves the KV protocol
//! until it receives SIGTERM. All logging goes to stderr; stdout belongs
//! to the handshake line.
//!
//! # Environment
//!
//! - `SHAKEDOWN_PLUGIN`: activation secret, mandatory
//! - `SHAKEDOWN_CLIENT_CERT`: harness certificate PEM; presence switches
//!   the peer to mutual TLS with a freshly provisioned server certificate
//! - `SHAKEDOWN_LOG`: stderr log verbosity (tracing `EnvFilter` syntax)
//! - `SHAKEDOWN_STORE_DIR`: file-backed value storage location
//! - `SHAKEDOWN_PEER_NETWORK`: `tcp` (default) or `unix`
//! - `SHAKEDOWN_PEER_KEY_TYPE` / `SHAKEDOWN_PEER_CURVE`: server key
//!   parameters for mutual TLS
//! - `SHAKEDOWN_PEER_MODE`: conformance fixture modes (`hang`,
//!   `bad-handshake`, `exit`) used by misbehaving-peer tests

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use shakedown_core::cert;
use shakedown_core::config::{
    CLIENT_CERT_ENV, DEFAULT_ACTIVATION_KEY, DEFAULT_ACTIVATION_TOKEN, KeyType,
};
use shakedown_core::handshake::{CORE_PROTOCOL_VERSION, HandshakeMessage};
use shakedown_core::kv::{self, KV_PROTOCOL_ID, KV_PROTOCOL_VERSION, KvStore};
use shakedown_core::transport::{
    Listener, PluginIo, TlsServerContext, certificate_from_pem, install_crypto_provider,
};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Reference peer for the shakedown plugin protocol.
#[derive(Parser, Debug)]
#[command(name = "shakedown-peer")]
#[command(version, about, long_about = None)]
struct Args {
    /// Network to listen on; overridden by SHAKEDOWN_PEER_NETWORK.
    #[arg(long, default_value = "tcp")]
    network: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // stdout carries the handshake line, so logs must go to stderr.
    let filter =
        EnvFilter::try_from_env("SHAKEDOWN_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Activation gate: this binary is useless (and refuses to run) outside
    // a harness that provides the shared secret.
    match std::env::var(DEFAULT_ACTIVATION_KEY) {
        Ok(token) if token == DEFAULT_ACTIVATION_TOKEN => {}
        _ => {
            eprintln!(
                "This binary is a shakedown plugin peer and is not meant to be \
                 executed directly. Run it through a shakedown harness."
            );
            std::process::exit(1);
        }
    }

    // Fixture modes for the misbehaving-peer conformance tests.
    match std::env::var("SHAKEDOWN_PEER_MODE").ok().as_deref() {
        Some("hang") => loop {
            std::thread::sleep(Duration::from_secs(60));
        },
        Some("bad-handshake") => {
            println!("not|a|valid|handshake");
            std::io::stdout().flush().ok();
            loop {
                std::thread::sleep(Duration::from_secs(60));
            }
        }
        Some("exit") => return Ok(()),
        Some(other) => bail!("unknown SHAKEDOWN_PEER_MODE {other:?}"),
        None => {}
    }

    install_crypto_provider();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(run(&args))
}

async fn run(args: &Args) -> Result<()> {
    let network =
        std::env::var("SHAKEDOWN_PEER_NETWORK").unwrap_or_else(|_| args.network.clone());

    // Keeps the socket directory alive for unix transports.
    let mut socket_dir = None;
    let listener = match network.as_str() {
        "tcp" => Listener::bind_tcp()
            .await
            .context("failed to bind tcp listener")?,
        "unix" => {
            let dir = tempfile::tempdir().context("failed to create socket directory")?;
            let path = dir.path().join("peer.sock");
            let listener = Listener::bind_unix(&path).context("failed to bind unix listener")?;
            socket_dir = Some(dir);
            listener
        }
        other => bail!("unsupported network {other:?}"),
    };

    let tls = match std::env::var(CLIENT_CERT_ENV) {
        Ok(pem) => Some(build_tls(&pem)?),
        Err(_) => None,
    };

    let (net, address) = listener
        .handshake_endpoint()
        .context("failed to resolve listen address")?;
    let message = HandshakeMessage {
        core_version: CORE_PROTOCOL_VERSION,
        app_version: KV_PROTOCOL_VERSION,
        network: net,
        address,
        protocol: KV_PROTOCOL_ID.to_string(),
        server_cert: tls.as_ref().map(|(_, encoded)| encoded.clone()),
    };

    let mut stdout = std::io::stdout();
    stdout
        .write_all(message.encode().as_bytes())
        .and_then(|()| stdout.flush())
        .context("failed to emit handshake line")?;
    info!(address = %message.address, network = %message.network, tls = tls.is_some(), "handshake emitted, serving");

    let store = Arc::new(match std::env::var("SHAKEDOWN_STORE_DIR") {
        Ok(dir) => KvStore::directory(dir),
        Err(_) => KvStore::memory(),
    });
    let acceptor = tls.map(|(ctx, _)| Arc::new(ctx));

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(io) => {
                    let acceptor = acceptor.clone();
                    let store = Arc::clone(&store);
                    tokio::spawn(handle_connection(io, acceptor, store));
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    drop(socket_dir);
    Ok(())
}

/// Provisions server credentials and builds the mutual-TLS acceptor.
///
/// Returns the acceptor plus the base64 DER certificate for the handshake
/// line.
fn build_tls(client_pem: &str) -> Result<(TlsServerContext, String)> {
    let key_type = match std::env::var("SHAKEDOWN_PEER_KEY_TYPE") {
        Ok(value) => value
            .parse::<KeyType>()
            .context("invalid SHAKEDOWN_PEER_KEY_TYPE")?,
        Err(_) => KeyType::Ec,
    };
    let curve = std::env::var("SHAKEDOWN_PEER_CURVE").unwrap_or_else(|_| "auto".to_string());

    let credentials = cert::provision(key_type, &curve)
        .context("failed to provision server credentials")?;
    let client_cert =
        certificate_from_pem(client_pem).context("invalid client certificate in environment")?;
    let context = TlsServerContext::new(&credentials, client_cert)
        .context("failed to build TLS acceptor")?;
    let encoded = credentials.certificate_base64();

    Ok((context, encoded))
}

async fn handle_connection(
    io: PluginIo,
    tls: Option<Arc<TlsServerContext>>,
    store: Arc<KvStore>,
) {
    let io = match tls {
        None => io,
        Some(ctx) => match ctx.accept(io).await {
            Ok(secured) => secured,
            Err(e) => {
                debug!(error = %e, "TLS accept failed, dropping connection");
                return;
            }
        },
    };

    if let Err(e) = kv::serve_connection(io, store).await {
        debug!(error = %e, "connection ended with error");
    }
}
