use std::{
    cell::RefCell,
    net::{IpAddr, Ipv4Addr},
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use interlink_server::{Answer, CommConfig, CommunicationServer, PeerAddress, SharedHandler};
use serde_json::{json, Value};
use tracing::info;

/// Echo example: one server answers its own outbound channel over loopback
fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("=== Interlink Echo Example ===");

    let config = CommConfig::new()
        .with_enabled(true)
        .with_secret("echo-secret")
        .with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .with_port(0);
    let mut server = CommunicationServer::new(config);

    let echo: SharedHandler = Arc::new(|data: Value| Some(Answer::ok(data)));
    let shout: SharedHandler = Arc::new(|data: Value| {
        let text = data.as_str()?;
        Some(Answer::ok(text.to_uppercase()))
    });
    server.register_listener("Echo", echo)?;
    server.register_listener("Shout", shout)?;
    server.enable().context("Failed to start listening")?;

    let addr = server.local_addr().context("Server is not listening")?;
    println!("✓ Listening on {}", addr);

    let peer = PeerAddress::new(addr.ip().to_string(), addr.port())?;
    let channel = server
        .create_outbound_channel(peer, "echo-secret")
        .context("Failed to open loopback channel")?;

    let answers: Rc<RefCell<Vec<(&'static str, Answer)>>> = Rc::default();
    let calls: [(&'static str, Value); 3] = [
        ("Echo", json!({ "hello": "world" })),
        ("Shout", json!("quiet please")),
        ("Whisper", json!("nobody listens")),
    ];
    for (method, data) in calls {
        let sink = Rc::clone(&answers);
        server.call(channel, move |answer| sink.borrow_mut().push((method, answer)), method, data)?;
    }

    let started = Instant::now();
    while answers.borrow().len() < 3 {
        if started.elapsed() > Duration::from_secs(5) {
            bail!("Timed out waiting for answers");
        }
        server.tick();
        std::thread::sleep(Duration::from_millis(10));
    }

    for (method, answer) in answers.borrow().iter() {
        println!("  {:<8} error={:<5} data={}", method, answer.error, answer.data);
    }

    info!("Closing channel");
    server.close_outbound_channel(channel);
    server.on_shutdown();
    println!("✓ Echo example completed");
    Ok(())
}
