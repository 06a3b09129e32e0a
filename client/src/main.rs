use std::{
    cell::RefCell,
    rc::Rc,
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use interlink_client::{ChannelConfig, CipherScheme, LegacyIv, OutboundChannel, PeerAddress};
use interlink_common::Answer;
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

const TICK_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Parser)]
#[command(name = "interlink-call")]
#[command(about = "Issue calls to a peer controller")]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Peer controller as host:port
    #[arg(short, long, default_value = "127.0.0.1:31500")]
    peer: PeerAddress,

    /// Shared secret (falls back to INTERLINK_SECRET)
    #[arg(short, long, env = "INTERLINK_SECRET", hide_env_values = true)]
    secret: String,

    /// Cipher scheme the peer uses
    #[arg(long, default_value = "legacy")]
    scheme: CipherScheme,

    /// Legacy scheme IV, 16 characters or 32 hex digits
    #[arg(long, env = "INTERLINK_LEGACY_IV", default_value_t = LegacyIv::default())]
    legacy_iv: LegacyIv,

    /// Give up waiting for the answer after this many milliseconds
    #[arg(short, long, default_value_t = 5000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call the peer's Ping method
    Ping,
    /// Call an arbitrary method
    Call {
        /// Method name
        method: String,
        /// JSON payload
        #[arg(default_value = "null")]
        data: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let (method, data) = match &args.command {
        Commands::Ping => ("Ping".to_string(), json!({ "n": 1 })),
        Commands::Call { method, data } => {
            let data: Value = serde_json::from_str(data).context("Payload is not valid JSON")?;
            (method.clone(), data)
        }
    };

    let timeout = Duration::from_millis(args.timeout_ms);
    let config = ChannelConfig::new(args.secret.as_str())
        .with_scheme(args.scheme)
        .with_legacy_iv(args.legacy_iv)
        .with_connect_timeout(timeout);
    let mut channel = OutboundChannel::connect_with(args.peer.clone(), &config)
        .with_context(|| format!("Failed to connect to {}", args.peer))?;

    info!("Calling {} on {}", method, args.peer);
    let slot: Rc<RefCell<Option<Answer>>> = Rc::default();
    let sink = Rc::clone(&slot);
    channel
        .call_with_timeout(move |answer| *sink.borrow_mut() = Some(answer), &method, data, timeout)
        .context("Failed to send call")?;

    let started = Instant::now();
    let answer = loop {
        channel.tick();
        if let Some(answer) = slot.borrow_mut().take() {
            break answer;
        }
        if !channel.is_open() {
            bail!("Peer closed the connection before answering");
        }
        // the callback's own deadline fires first; this guards a stuck tick
        if started.elapsed() > timeout * 2 {
            bail!("No answer within {:?}", timeout);
        }
        std::thread::sleep(TICK_INTERVAL);
    };
    channel.close();

    println!("{}", serde_json::to_string_pretty(&answer.data)?);
    if answer.error {
        bail!("Peer answered with an error");
    }
    Ok(())
}
