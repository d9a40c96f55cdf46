// MIT License - Copyright (c) 2021 TJForc
// Tesira client: command session, subscription session and attribute table

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::attribute::{AttributeState, LevelBounds, SubscriptionTable};
use crate::config::{Subscription, TesiraConfig};
use crate::error::{Result, TesiraError};
use crate::event::{EventSender, TesiraEvent};
use crate::protocol::Command;
use crate::transport::command::CommandEngine;
use crate::transport::line::LineTransport;
use crate::transport::session::{spawn_session, SessionHandle, SubscribeOutcome, SubscribeReport};

/// The main public API for talking to a Tesira server.
///
/// Cheap to clone; every clone shares the same two sessions.
///
/// # Example
///
/// ```no_run
/// use tesira_lan_bridge::{event_channel, Attribute, Subscription, TesiraClient, TesiraConfig};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = TesiraConfig::builder().host("192.168.1.50").build();
///     let (events, mut rx) = event_channel();
///
///     let client = TesiraClient::open(config, events).await?;
///     tokio::spawn(async move {
///         while let Some(event) = rx.recv().await {
///             println!("Event: {:?}", event);
///         }
///     });
///
///     let mic = Subscription::new("Mixer1", Attribute::Mute, 1, "Mic", "Room");
///     client.subscribe_all(&[mic]).await?;
///     client.apply_incoming_update("Mixer1_mute_1", "true").await?;
///
///     tokio::signal::ctrl_c().await?;
///     client.close().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct TesiraClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: TesiraConfig,
    serial_number: String,
    commands: CommandEngine,
    session: SessionHandle,
    session_task: Mutex<Option<JoinHandle<()>>>,
    table: SubscriptionTable,
    events: EventSender,
    commands_lost: AtomicBool,
    cancel: CancellationToken,
}

impl TesiraClient {
    /// Open both sessions, read the serial number and start draining push notifications.
    ///
    /// The subscription session is opened first, then the command session. Any failure
    /// closes whatever was opened.
    pub async fn open(config: TesiraConfig, events: EventSender) -> Result<Self> {
        info!("Connecting to Tesira at {}", config.address());
        let limit = config.response_timeout();

        let mut subscription = LineTransport::new("subscription_telnet");
        subscription.connect(&config.host, config.port, limit).await?;

        let mut command = LineTransport::new("command_telnet");
        if let Err(e) = command.connect(&config.host, config.port, limit).await {
            subscription.close();
            return Err(e);
        }

        Self::from_transports(config, subscription, command, events).await
    }

    /// Build a client on top of two transports that are already open.
    pub async fn from_transports(
        config: TesiraConfig,
        mut subscription: LineTransport,
        command: LineTransport,
        events: EventSender,
    ) -> Result<Self> {
        let commands = CommandEngine::new(command, &config);

        let serial_number = match commands.send(&Command::SerialNumber).await {
            Ok(Some(serial)) => serial,
            Ok(None) => {
                subscription.close();
                commands.close().await;
                return Err(TesiraError::InvalidResponse {
                    details: "serial number reply carried no value".to_string(),
                });
            }
            Err(e) => {
                subscription.close();
                commands.close().await;
                return Err(e);
            }
        };
        info!("Connected to Tesira {}", serial_number);

        let table = SubscriptionTable::new();
        let cancel = CancellationToken::new();
        let (session, task) = spawn_session(
            subscription,
            &config,
            serial_number.clone(),
            table.clone(),
            events.clone(),
            cancel.child_token(),
        );

        let _ = events.send(TesiraEvent::Connected {
            serial_number: serial_number.clone(),
        });

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                serial_number,
                commands,
                session,
                session_task: Mutex::new(Some(task)),
                table,
                events,
                commands_lost: AtomicBool::new(false),
                cancel,
            }),
        })
    }

    pub fn serial_number(&self) -> &str {
        &self.inner.serial_number
    }

    pub fn config(&self) -> &TesiraConfig {
        &self.inner.config
    }

    /// Shared table of subscribed attribute states.
    pub fn table(&self) -> &SubscriptionTable {
        &self.inner.table
    }

    pub async fn snapshot(&self) -> Vec<AttributeState> {
        self.inner.table.snapshot().await
    }

    /// True while both sessions are alive.
    pub fn is_connected(&self) -> bool {
        self.inner.session.is_running()
            && !self.inner.commands_lost.load(Ordering::SeqCst)
            && !self.inner.cancel.is_cancelled()
    }

    /// Send a raw command on the command session.
    pub async fn command(&self, command: &str) -> Result<Option<String>> {
        let result = self.inner.commands.command(command).await;
        self.watch_commands(result)
    }

    pub async fn subscribe(&self, subscription: &Subscription) -> Result<SubscribeOutcome> {
        self.inner.session.subscribe(subscription.clone()).await
    }

    /// Subscribe to every entry in order, pausing between each.
    ///
    /// Rejections by the device are collected in the report; connection failures and
    /// timeouts abort the cycle.
    pub async fn subscribe_all(&self, subscriptions: &[Subscription]) -> Result<SubscribeReport> {
        self.inner.session.subscribe_all(subscriptions.to_vec()).await
    }

    pub async fn level_bounds(&self, subscription: &Subscription) -> Result<LevelBounds> {
        self.inner.session.level_bounds(subscription.clone()).await
    }

    /// Forward a value set on the bus to the device.
    ///
    /// The table is not touched; the device's push notification reports the new value.
    pub async fn apply_incoming_update(&self, identifier: &str, raw_value: &str) -> Result<()> {
        let state = self.inner.table.get(identifier).await.ok_or_else(|| {
            TesiraError::UnknownSubscription {
                identifier: identifier.to_string(),
            }
        })?;

        let command = Command::Set {
            instance_tag: state.instance_tag,
            attribute: state.attribute,
            index: state.index,
            value: raw_value.trim().to_string(),
        };
        debug!("Sending {}", command.to_wire_string());
        let result = self.inner.commands.send(&command).await;
        self.watch_commands(result)?;
        Ok(())
    }

    /// A command session that failed or missed a reply takes the whole client down:
    /// the subscription session is stopped and `Disconnected` is emitted once.
    fn watch_commands<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result
            && e.is_retryable()
            && !self.inner.cancel.is_cancelled()
            && !self.inner.commands_lost.swap(true, Ordering::SeqCst)
        {
            error!("Command session failed: {}", e);
            self.inner.cancel.cancel();
            let _ = self.inner.events.send(TesiraEvent::Disconnected);
        }
        result
    }

    /// Stop the subscription session and close both transports. Safe to call repeatedly.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        if let Some(task) = self.inner.session_task.lock().await.take()
            && let Err(e) = task.await
        {
            warn!("Subscription session ended abnormally: {}", e);
        }
        self.inner.commands.close().await;
        debug!("Tesira client closed");
    }
}
