use std::{
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use clap::Parser;
use interlink_server::{
    Answer, CipherScheme, CommConfig, CommunicationServer, LegacyIv, PeerAddress, SharedHandler,
};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const TICK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "interlink-server")]
#[command(about = "Interlink communication server host")]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Logical server index; listens on 31500 + index
    #[arg(long, conflicts_with = "port")]
    server_index: Option<u32>,

    /// Listening port (overrides INTERLINK_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides INTERLINK_BIND_ADDRESS)
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Shared secret (overrides INTERLINK_SECRET)
    #[arg(short, long)]
    secret: Option<String>,

    /// Cipher scheme (overrides INTERLINK_CIPHER_SCHEME)
    #[arg(long)]
    scheme: Option<CipherScheme>,

    /// Legacy scheme IV, 16 characters or 32 hex digits (overrides INTERLINK_LEGACY_IV)
    #[arg(long)]
    legacy_iv: Option<LegacyIv>,

    /// Peer controller to ping periodically, as host:port
    #[arg(long, requires = "peer_secret")]
    peer: Option<PeerAddress>,

    /// Secret of the peer controller
    #[arg(long)]
    peer_secret: Option<String>,

    /// Seconds between pings to the peer
    #[arg(long, default_value_t = 10)]
    ping_interval: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = build_config(&args)?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, stopping server...");
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    let mut server = CommunicationServer::new(config);
    register_demo_listeners(&mut server)?;
    info!("Registered methods: {:?}", server.registry().methods());

    if server.config().enabled {
        // not fatal: the host keeps running with outbound channels only
        if let Err(e) = server.enable() {
            warn!("Listening disabled: {}", e);
        }
    } else {
        info!("Listening disabled by configuration (set INTERLINK_ENABLED=true)");
    }

    let peer_channel = match (&args.peer, &args.peer_secret) {
        (Some(peer), Some(secret)) => match server.create_outbound_channel(peer.clone(), secret.as_str()) {
            Ok(id) => Some(id),
            Err(e) => {
                error!("Could not reach peer {}: {}", peer, e);
                None
            }
        },
        _ => None,
    };

    let ping_interval = Duration::from_secs(args.ping_interval);
    let mut last_ping = Instant::now();
    let mut n = 0;

    while running.load(Ordering::SeqCst) {
        server.tick();

        if let Some(id) = peer_channel {
            if last_ping.elapsed() >= ping_interval {
                last_ping = Instant::now();
                n += 1;
                let sent = server.call(
                    id,
                    |answer: Answer| {
                        if answer.is_error() {
                            warn!("Peer ping failed: {}", answer.data);
                        } else {
                            info!("Peer answered ping: {}", answer.data);
                        }
                    },
                    "Ping",
                    json!({ "n": n }),
                );
                if let Err(e) = sent {
                    warn!("Ping not sent: {}", e);
                }
            }
        }

        std::thread::sleep(TICK_INTERVAL);
    }

    server.on_shutdown();
    info!("✓ Server shutdown completed");
    Ok(())
}

fn build_config(args: &Args) -> Result<CommConfig> {
    let mut config = CommConfig::from_env().context("Invalid INTERLINK_* environment")?;

    if let Some(index) = args.server_index {
        config.port = CommConfig::port_for_index(index)?;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(secret) = &args.secret {
        config.secret = secret.as_str().into();
        config.enabled = true;
    }
    if let Some(scheme) = args.scheme {
        config.scheme = scheme;
    }
    if let Some(legacy_iv) = args.legacy_iv {
        config.legacy_iv = legacy_iv;
    }

    Ok(config)
}

fn register_demo_listeners(server: &mut CommunicationServer) -> Result<()> {
    let ping: SharedHandler = Arc::new(|data: Value| {
        let n = data.get("n")?.as_i64()?;
        Some(Answer::ok(json!({ "n": n + 1 })))
    });
    let echo: SharedHandler = Arc::new(|data: Value| Some(Answer::ok(data)));
    let time: SharedHandler = Arc::new(|_data: Value| {
        let since_epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .ok()?;
        Some(Answer::ok(json!({ "unix_ms": since_epoch.as_millis() as u64 })))
    });

    server.register_listener("Ping", ping)?;
    server.register_listener("Echo", echo)?;
    server.register_listener("Time", time)?;
    Ok(())
}
