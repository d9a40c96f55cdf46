// MIT License - Copyright (c) 2021 TJForc
// Tesira Text Protocol client and MQTT bridge
//
//! # tesira-lan-bridge
//!
//! Talks to a Biamp Tesira DSP over the Tesira Text Protocol (Telnet, port 23)
//! and mirrors subscribed mute and level controls onto MQTT.
//!
//! Two Telnet sessions are held open: one for synchronous commands, one for
//! subscriptions and the push notifications they produce. State changes are
//! emitted as [`TesiraEvent`]s on an [`event_channel`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use tesira_lan_bridge::{event_channel, Attribute, Subscription, TesiraClient, TesiraConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = TesiraConfig::builder().host("192.168.1.50").build();
//!     let (events, mut rx) = event_channel();
//!     let client = TesiraClient::open(config, events).await?;
//!
//!     let main = Subscription::new("Level1", Attribute::Level, 1, "Main", "Lounge");
//!     client.subscribe_all(&[main]).await?;
//!
//!     while let Some(event) = rx.recv().await {
//!         println!("Event: {:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod attribute;
pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod mqtt;
pub mod protocol;
pub mod scheduler;
pub mod transport;

pub use attribute::{AttributeState, AttributeValue, LevelBounds, SubscriptionTable, ValueKind};
pub use client::TesiraClient;
pub use config::{Attribute, Subscription, SubscriptionSet, TesiraConfig};
pub use error::{Result, TesiraError};
pub use event::{event_channel, EventReceiver, EventSender, TesiraEvent};
pub use scheduler::resubscribe_on_schedule;
pub use transport::{SubscribeOutcome, SubscribeReport};
