// MIT License - Copyright (c) 2021 TJForc
//! Example: Print push notifications as the device reports changes.

use tesira_lan_bridge::{event_channel, Attribute, Subscription, TesiraClient, TesiraConfig, TesiraEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = TesiraConfig::builder().host("192.168.1.50").build();
    let (events, mut rx) = event_channel();
    let client = TesiraClient::open(config, events).await?;

    let mute = Subscription::new("Mixer1", Attribute::Mute, 1, "Mic 1", "Conference Room");
    client.subscribe_all(&[mute]).await?;

    println!("Listening for attribute changes (Ctrl+C to stop)...\n");

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(TesiraEvent::AttributeUpdated(state)) => {
                        println!("{} ({}) = {}", state.name, state.identifier, state.value);
                    }
                    Some(TesiraEvent::Disconnected) => {
                        println!("Tesira disconnected!");
                        break;
                    }
                    Some(event) => {
                        println!("Event: {:?}", event);
                    }
                    None => {
                        println!("Event channel closed");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    client.close().await;
    Ok(())
}
