use std::{
    cell::RefCell,
    rc::Rc,
    time::Duration,
};

use anyhow::Result;
use interlink_client::{Answer, ChannelConfig, OutboundChannel, PeerAddress};
use serde_json::json;

/// Talks to a controller started with `cargo run -p interlink-server -- --secret demo`
fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== Interlink Outbound Channel Basic Example ===");

    let peer: PeerAddress = "127.0.0.1:31500".parse()?;
    let config = ChannelConfig::new("demo").with_connect_timeout(Duration::from_secs(2));
    let mut channel = OutboundChannel::connect_with(peer, &config)?;

    // Example 1: callbacks, answered strictly in call order
    println!("\n1. Two calls issued before any tick:");
    let answers: Rc<RefCell<Vec<(&str, Answer)>>> = Rc::default();
    for (tag, n) in [("A", 1), ("B", 10)] {
        let answers = Rc::clone(&answers);
        channel.call(
            move |answer| answers.borrow_mut().push((tag, answer)),
            "Ping",
            json!({ "n": n }),
        )?;
    }

    // Example 2: promise-style call
    println!("\n2. Promise-style call:");
    let status = channel.call_pending("Echo", json!({ "hello": "controller" }))?;

    // Example 3: a call nobody listens for, with a caller-side timeout
    println!("\n3. Unknown method with a timeout:");
    let unknown = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&unknown);
    channel.call_with_timeout(
        move |answer| *slot.borrow_mut() = Some(answer),
        "NoSuchMethod",
        json!(null),
        Duration::from_secs(2),
    )?;

    while channel.pending_calls() > 0 && channel.is_open() {
        channel.tick();
        std::thread::sleep(Duration::from_millis(20));
    }

    for (tag, answer) in answers.borrow().iter() {
        println!("  {tag}: error={} data={}", answer.error, answer.data);
    }
    if let Some(answer) = status.try_answer() {
        println!("  Echo: {}", answer.data);
    }
    if let Some(answer) = unknown.borrow().as_ref() {
        println!("  NoSuchMethod: {:?}", answer.message());
    }

    println!("\nStats: {:?}", channel.stats());
    channel.close();
    println!("✓ Example completed");
    Ok(())
}
