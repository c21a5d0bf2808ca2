//! shakedown - conformance harness CLI.
//!
//! Drives the plugin session lifecycle against an arbitrary peer binary:
//! repeated create / put / get / close cycles, or a sweep of the whole
//! TLS and key-parameter support matrix. Any binary honoring the
//! handshake-line and KV wire contracts can be tested; the reference
//! implementation ships as `shakedown-peer`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use shakedown_core::{KeyType, PluginConfig, Session, TlsMode, install_crypto_provider};
use tracing_subscriber::EnvFilter;

/// Conformance harness for shakedown plugin peers.
#[derive(Parser, Debug)]
#[command(name = "shakedown")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run repeated conformance cycles against a peer binary.
    Run {
        /// Path to the peer executable.
        #[arg(long)]
        plugin: PathBuf,

        /// Transport security mode.
        #[arg(long, value_enum, default_value_t = TlsArg::Disabled)]
        tls: TlsArg,

        /// Key family for mutual TLS credentials.
        #[arg(long, value_enum, default_value_t = KeyTypeArg::Ec)]
        key_type: KeyTypeArg,

        /// Curve name for EC credentials (ignored for RSA).
        #[arg(long, default_value = "auto")]
        curve: String,

        /// Number of create/use/close cycles.
        #[arg(long, default_value_t = 8)]
        cycles: u32,

        /// Startup budget per session, in seconds.
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },

    /// Sweep the TLS / key-type / curve support matrix.
    Matrix {
        /// Path to the peer executable.
        #[arg(long)]
        plugin: PathBuf,

        /// Startup budget per session, in seconds.
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TlsArg {
    Disabled,
    Auto,
}

impl From<TlsArg> for TlsMode {
    fn from(arg: TlsArg) -> Self {
        match arg {
            TlsArg::Disabled => Self::Disabled,
            TlsArg::Auto => Self::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KeyTypeArg {
    Rsa,
    Ec,
}

impl From<KeyTypeArg> for KeyType {
    fn from(arg: KeyTypeArg) -> Self {
        match arg {
            KeyTypeArg::Rsa => Self::Rsa,
            KeyTypeArg::Ec => Self::Ec,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_env("SHAKEDOWN_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    install_crypto_provider();

    match cli.command {
        Commands::Run {
            plugin,
            tls,
            key_type,
            curve,
            cycles,
            timeout_secs,
        } => {
            let config = PluginConfig::builder(plugin)
                .tls_mode(tls.into())
                .key_type(key_type.into())
                .curve(curve)
                .connect_timeout(Duration::from_secs(timeout_secs))
                .build()
                .context("invalid configuration")?;
            run_cycles(&config, cycles).await
        }
        Commands::Matrix {
            plugin,
            timeout_secs,
        } => run_matrix(&plugin, Duration::from_secs(timeout_secs)).await,
    }
}

async fn run_cycles(config: &PluginConfig, cycles: u32) -> Result<()> {
    for cycle in 1..=cycles {
        run_cycle(config)
            .await
            .with_context(|| format!("cycle {cycle}/{cycles} failed"))?;
        println!("cycle {cycle}/{cycles}: ok");
    }
    println!("{cycles} cycles passed");
    Ok(())
}

/// One full create / exercise / close cycle.
async fn run_cycle(config: &PluginConfig) -> Result<()> {
    let mut session = Session::start(config).await?;

    let result = exercise(&session).await;
    // The peer is terminated whether or not the exchange held up.
    session.close().await;
    result
}

/// The byte-exactness checks run on a ready session.
async fn exercise(session: &Session) -> Result<()> {
    let all_bytes: Vec<u8> = (0u8..=255).collect();
    let cases: [(&str, &[u8]); 3] = [
        ("bytes", &all_bytes),
        ("empty", b""),
        ("text", b"shakedown"),
    ];

    for (key, value) in cases {
        session.put(key, value).await?;
        let got = session.get(key).await?;
        if got.as_deref() != Some(value) {
            bail!("round-trip mismatch for key {key:?}");
        }
    }

    // Last put wins.
    session.put("bytes", b"rewritten").await?;
    if session.get("bytes").await?.as_deref() != Some(&b"rewritten"[..]) {
        bail!("overwrite did not take effect");
    }

    // A key never written stays absent.
    if session.get("never-written").await?.is_some() {
        bail!("phantom value for an unwritten key");
    }

    Ok(())
}

async fn run_matrix(plugin: &Path, timeout: Duration) -> Result<()> {
    let combos: [(TlsMode, KeyType, &str); 6] = [
        (TlsMode::Disabled, KeyType::Ec, "auto"),
        (TlsMode::Auto, KeyType::Ec, "secp256r1"),
        (TlsMode::Auto, KeyType::Ec, "secp384r1"),
        (TlsMode::Auto, KeyType::Ec, "secp521r1"),
        (TlsMode::Auto, KeyType::Ec, "auto"),
        (TlsMode::Auto, KeyType::Rsa, "auto"),
    ];

    let mut failures = 0u32;
    for (tls, key_type, curve) in combos {
        let label = format!("tls={tls:?} key={key_type:?} curve={curve}");
        let config = PluginConfig::builder(plugin)
            .tls_mode(tls)
            .key_type(key_type)
            .curve(curve)
            .connect_timeout(timeout)
            .build()
            .context("invalid configuration")?;

        match run_cycle(&config).await {
            Ok(()) => println!("{label}: ok"),
            Err(e) => {
                failures += 1;
                println!("{label}: FAIL ({e:#})");
            }
        }
    }

    if failures > 0 {
        bail!("{failures} matrix combinations failed");
    }
    println!("matrix passed");
    Ok(())
}
