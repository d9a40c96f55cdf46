// MIT License - Copyright (c) 2021 TJForc
//! Example: Connect to a Tesira server, subscribe and print attribute states.

use tesira_lan_bridge::{event_channel, Attribute, Subscription, TesiraClient, TesiraConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = TesiraConfig::builder()
        .host("192.168.1.50")
        .port(23)
        .build();

    let subscriptions = [
        Subscription::new("Mixer1", Attribute::Mute, 1, "Mic 1", "Conference Room"),
        Subscription::new("Level1", Attribute::Level, 1, "Main Volume", "Conference Room"),
    ];

    println!("Connecting to Tesira...");
    let (events, _rx) = event_channel();
    let client = TesiraClient::open(config, events).await?;
    println!("Serial number: {}", client.serial_number());

    let report = client.subscribe_all(&subscriptions).await?;
    println!(
        "Subscribed: {} new, {} already, {} partial, {} failed",
        report.subscribed,
        report.already_subscribed,
        report.partial,
        report.failed.len()
    );
    for (identifier, e) in &report.failed {
        println!("  {identifier}: {e}");
    }

    println!("\n--- Attributes ---");
    for state in client.snapshot().await {
        match state.bounds {
            Some(bounds) => println!(
                "  {:24} {:>10} ({} .. {} dB)",
                state.identifier, state.value, bounds.min_level, bounds.max_level
            ),
            None => println!("  {:24} {:>10}", state.identifier, state.value),
        }
    }

    println!("\nPress Ctrl+C to disconnect...");
    tokio::signal::ctrl_c().await?;
    client.close().await;
    println!("Disconnected.");

    Ok(())
}
