// MIT License - Copyright (c) 2021 TJForc
// MQTT bridge

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use serde::Deserialize;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::{mpsc, oneshot, Barrier};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tesira_lan_bridge::constants::DEFAULT_PORT;
use tesira_lan_bridge::mqtt::{self, Availability, MqttPublisher, STATUS_OFFLINE, STATUS_ONLINE};
use tesira_lan_bridge::{
    event_channel, resubscribe_on_schedule, EventReceiver, EventSender, Subscription,
    SubscriptionSet, TesiraClient, TesiraConfig, TesiraError, TesiraEvent,
};

/// Bound on each shutdown step (offline publish, task joins, MQTT disconnect).
const SHUTDOWN_STEP_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "tesira2mqtt")]
#[command(about = "Bridge between a Biamp Tesira DSP and MQTT")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, env = "CONFIG", default_value = "config.toml")]
    config: String,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "LOGLEVEL", default_value = "info")]
    log_level: String,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Config {
    tesira: TesiraToml,
    mqtt: MqttToml,
    #[serde(default)]
    subscriptions: Vec<Subscription>,
}

#[derive(Debug, Deserialize)]
struct TesiraToml {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_response_timeout")]
    response_timeout_ms: u64,
    #[serde(default = "default_settle_delay")]
    settle_delay_ms: u64,
    #[serde(default = "default_subscribe_pause")]
    subscribe_pause_ms: u64,
    #[serde(default = "default_resubscription_interval")]
    resubscription_interval_secs: u64,
    #[serde(default = "default_drain_timeout")]
    drain_timeout_ms: u64,
    #[serde(default = "default_reconnect_delay")]
    reconnect_delay_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_response_timeout() -> u64 {
    10000
}
fn default_settle_delay() -> u64 {
    1000
}
fn default_subscribe_pause() -> u64 {
    1000
}
fn default_resubscription_interval() -> u64 {
    60
}
fn default_drain_timeout() -> u64 {
    10000
}
fn default_reconnect_delay() -> u64 {
    10000
}

#[derive(Debug, Clone, Deserialize)]
struct MqttToml {
    url: String,
    #[serde(default = "default_client_id")]
    client_id: String,
    #[serde(default = "default_base_topic")]
    base_topic: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default = "default_keepalive")]
    keepalive_secs: u64,
}

fn default_client_id() -> String {
    "tesira2mqtt".to_string()
}
fn default_base_topic() -> String {
    "tesira".to_string()
}
fn default_keepalive() -> u64 {
    60
}

fn build_tesira_config(toml: &TesiraToml) -> TesiraConfig {
    TesiraConfig::builder()
        .host(&toml.host)
        .port(toml.port)
        .response_timeout_ms(toml.response_timeout_ms)
        .settle_delay_ms(toml.settle_delay_ms)
        .subscribe_pause_ms(toml.subscribe_pause_ms)
        .resubscription_interval_secs(toml.resubscription_interval_secs)
        .drain_timeout_ms(toml.drain_timeout_ms)
        .reconnect_delay_ms(toml.reconnect_delay_ms)
        .build()
}

/// Everything one bridge run needs, validated.
struct Settings {
    tesira: TesiraConfig,
    mqtt: MqttToml,
    mqtt_host: String,
    mqtt_port: u16,
    subscriptions: SubscriptionSet,
}

fn load_settings(path: &str) -> Result<Settings> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {path}"))?;
    let config: Config = toml::from_str(&text).context("Failed to parse config file")?;
    let (mqtt_host, mqtt_port) = parse_mqtt_url(&config.mqtt.url)?;
    let subscriptions =
        SubscriptionSet::new(config.subscriptions).context("Invalid subscriptions")?;
    if subscriptions.is_empty() {
        warn!("No subscriptions configured");
    }

    Ok(Settings {
        tesira: build_tesira_config(&config.tesira),
        mqtt: config.mqtt,
        mqtt_host,
        mqtt_port,
        subscriptions,
    })
}

/// Reload config from disk; keep the previous settings on failure.
fn reload_settings(path: &str, current: Settings) -> Settings {
    info!("Reloading config from {path}");
    match load_settings(path) {
        Ok(settings) => {
            info!("Config reloaded successfully");
            settings
        }
        Err(e) => {
            warn!("Failed to reload config, keeping previous: {e:#}");
            current
        }
    }
}

/// Parse an MQTT URL like "mqtt://host:port" into (host, port).
fn parse_mqtt_url(url: &str) -> Result<(String, u16)> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    let (host, port_str) = stripped
        .rsplit_once(':')
        .context("MQTT URL must be in format mqtt://host:port")?;

    let port: u16 = port_str.parse().context("Invalid MQTT port number")?;

    Ok((host.to_string(), port))
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

enum Exit {
    Shutdown,
    Reload,
    Disconnected,
}

struct Signals {
    sighup: Signal,
    sigterm: Signal,
}

impl Signals {
    fn new() -> Result<Self> {
        Ok(Self {
            sighup: signal(SignalKind::hangup())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> Exit {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
                Exit::Shutdown
            }
            _ = self.sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                Exit::Shutdown
            }
            _ = self.sighup.recv() => {
                info!("Received SIGHUP, reloading config and restarting connections...");
                Exit::Reload
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Tesira events → MQTT. Signals `disconnected` when the subscription session drops.
async fn forward_events(
    mut rx: EventReceiver,
    publisher: Arc<MqttPublisher>,
    disconnected: oneshot::Sender<()>,
) {
    let mut serial_number = String::new();
    let mut disconnected = Some(disconnected);

    while let Some(event) = rx.recv().await {
        match event {
            TesiraEvent::Connected {
                serial_number: serial,
            } => {
                info!("Tesira connected, serial number {serial}");
                serial_number = serial;
            }
            TesiraEvent::AttributeUpdated(state) => {
                publisher.publish_state(&state, &serial_number).await;
            }
            TesiraEvent::SubscriptionsRefreshed { subscribed, failed } => {
                debug!("Subscriptions refreshed: {subscribed} ok, {failed} failed");
            }
            TesiraEvent::Disconnected => {
                warn!("Tesira disconnected, will attempt reconnection");
                if let Some(tx) = disconnected.take() {
                    let _ = tx.send(());
                }
            }
        }
    }
    debug!("Event channel closed");
}

/// Drive the MQTT event loop; command-topic payloads go to `inbound`.
async fn poll_mqtt(
    mut eventloop: EventLoop,
    client: AsyncClient,
    base_topic: String,
    inbound: mpsc::UnboundedSender<(String, String)>,
) {
    let filter = mqtt::command_filter(&base_topic);
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                // rumqttc does not resubscribe after a broker reconnect
                info!("MQTT: connected, subscribing to {filter}");
                if let Err(e) = client.subscribe(&filter, QoS::AtLeastOnce).await {
                    error!("Failed to subscribe to {filter}: {e}");
                }
            }
            Ok(Event::Incoming(Packet::Publish(msg))) => {
                match mqtt::identifier_from_command_topic(&base_topic, &msg.topic) {
                    Some(identifier) => {
                        let payload = String::from_utf8_lossy(&msg.payload).into_owned();
                        info!("MQTT command received: {identifier} = {payload}");
                        let _ = inbound.send((identifier.to_string(), payload));
                    }
                    None => debug!("Ignoring message on {}", msg.topic),
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT: disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT event loop error: {e}");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// MQTT set commands → Tesira. Starts after the rendezvous.
async fn bus_intake(
    tesira: TesiraClient,
    mut inbound: mpsc::UnboundedReceiver<(String, String)>,
    ready: Arc<Barrier>,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = ready.wait() => {}
    }
    info!("Starting MQTT command intake");

    loop {
        let (identifier, payload) = tokio::select! {
            _ = cancel.cancelled() => break,
            message = inbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        match tesira.apply_incoming_update(&identifier, &payload).await {
            Ok(()) => {}
            Err(e @ TesiraError::UnknownSubscription { .. }) => warn!("{e}"),
            Err(e) if e.is_retryable() => {
                // the client has already reported Disconnected
                error!("Failed to set {identifier}: {e}");
                break;
            }
            Err(e) => error!("Failed to set {identifier}: {e}"),
        }
    }
    debug!("MQTT command intake stopped");
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

async fn connect_tesira(settings: &Settings, events: EventSender) -> Result<TesiraClient> {
    let tesira = TesiraClient::open(settings.tesira.clone(), events)
        .await
        .context("Failed to connect to Tesira")?;

    match tesira.subscribe_all(settings.subscriptions.as_slice()).await {
        Ok(report) if report.is_complete() => {}
        Ok(report) => {
            for (identifier, e) in &report.failed {
                warn!("Subscription {identifier} was rejected: {e}");
            }
        }
        Err(e) => {
            tesira.close().await;
            return Err(e).context("Failed to subscribe to Tesira");
        }
    }
    Ok(tesira)
}

fn mqtt_options(settings: &Settings) -> MqttOptions {
    let mqtt = &settings.mqtt;
    let mut options = MqttOptions::new(&mqtt.client_id, &settings.mqtt_host, settings.mqtt_port);
    options.set_keep_alive(Duration::from_secs(mqtt.keepalive_secs));
    if let Some(username) = &mqtt.username {
        options.set_credentials(username, mqtt.password.as_deref().unwrap_or_default());
    }

    let offline = serde_json::to_string(&Availability {
        state: STATUS_OFFLINE,
    })
    .unwrap_or_default();
    options.set_last_will(LastWill::new(
        mqtt::availability_topic(&mqtt.base_topic),
        offline,
        QoS::AtLeastOnce,
        true,
    ));
    options
}

/// One bridge run: connect, subscribe, run until a signal or a device disconnect.
///
/// Sets `ready` once the loops are running and "online" has been published.
async fn run_bridge(settings: &Settings, signals: &mut Signals, ready: &mut bool) -> Result<Exit> {
    let base_topic = settings.mqtt.base_topic.clone();
    let (client, eventloop) = AsyncClient::new(mqtt_options(settings), 256);
    let publisher = Arc::new(MqttPublisher::new(client.clone(), &base_topic));
    let cancel = CancellationToken::new();

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let mqtt_handle = tokio::spawn(poll_mqtt(
        eventloop,
        client.clone(),
        base_topic.clone(),
        inbound_tx,
    ));

    let (event_tx, event_rx) = event_channel();
    let (disconnected_tx, disconnected_rx) = oneshot::channel();
    let forward_handle = tokio::spawn(forward_events(
        event_rx,
        Arc::clone(&publisher),
        disconnected_tx,
    ));

    let tesira = match connect_tesira(settings, event_tx).await {
        Ok(tesira) => tesira,
        Err(e) => {
            error!("{e:#}");
            shutdown_bridge(
                &publisher,
                &client,
                None,
                &cancel,
                vec![forward_handle],
                mqtt_handle,
            )
            .await;
            return Err(e);
        }
    };

    let barrier = Arc::new(Barrier::new(3));
    let intake_handle = tokio::spawn(bus_intake(
        tesira.clone(),
        inbound_rx,
        Arc::clone(&barrier),
        cancel.child_token(),
    ));
    let resubscribe_handle = tokio::spawn(resubscribe_on_schedule(
        tesira.clone(),
        settings.subscriptions.clone(),
        settings.tesira.resubscription_interval(),
        Arc::clone(&barrier),
        cancel.child_token(),
    ));

    barrier.wait().await;
    if let Err(e) = publisher.publish_status(STATUS_ONLINE).await {
        error!("Failed to publish online status: {e}");
    }
    *ready = true;
    info!("MQTT bridge running. Send SIGHUP to restart, SIGINT/SIGTERM to stop.");

    let exit = tokio::select! {
        exit = signals.recv() => exit,
        _ = disconnected_rx => Exit::Disconnected,
    };

    shutdown_bridge(
        &publisher,
        &client,
        Some(&tesira),
        &cancel,
        vec![intake_handle, resubscribe_handle, forward_handle],
        mqtt_handle,
    )
    .await;
    Ok(exit)
}

/// Cancel the loops, close the device sessions, then say goodbye on MQTT.
async fn shutdown_bridge(
    publisher: &MqttPublisher,
    client: &AsyncClient,
    tesira: Option<&TesiraClient>,
    cancel: &CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    mut mqtt_handle: JoinHandle<()>,
) {
    cancel.cancel();
    if let Some(tesira) = tesira {
        tesira.close().await;
    }
    for mut task in tasks {
        if timeout(SHUTDOWN_STEP_TIMEOUT, &mut task).await.is_err() {
            task.abort();
        }
    }

    match timeout(SHUTDOWN_STEP_TIMEOUT, publisher.publish_status(STATUS_OFFLINE)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Failed to publish offline status: {e}"),
        Err(_) => warn!("Timed out publishing offline status"),
    }
    if let Ok(Err(e)) = timeout(SHUTDOWN_STEP_TIMEOUT, client.disconnect()).await {
        warn!("MQTT disconnect failed: {e}");
    }
    if timeout(SHUTDOWN_STEP_TIMEOUT, &mut mqtt_handle).await.is_err() {
        mqtt_handle.abort();
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn init_logging(level: &str) {
    // RUST_LOG wins (e.g. RUST_LOG=tesira_lan_bridge=debug); otherwise --log-level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt()
            .without_time()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    info!("tesira2mqtt {}", env!("CARGO_PKG_VERSION"));

    let mut settings = load_settings(&cli.config)?;
    let mut signals = Signals::new()?;
    let mut ever_ready = false;
    let mut attempt: u32 = 0;

    loop {
        info!(
            "Connecting to Tesira at {} with {} subscription(s)",
            settings.tesira.address(),
            settings.subscriptions.len()
        );
        let mut ready = false;
        let outcome = run_bridge(&settings, &mut signals, &mut ready).await;
        if ready {
            ever_ready = true;
            attempt = 0;
        }

        match outcome {
            Ok(Exit::Shutdown) => break,
            Ok(Exit::Reload) => {
                settings = reload_settings(&cli.config, settings);
                attempt = 0;
                continue;
            }
            Ok(Exit::Disconnected) => {}
            // The first connection must succeed; later ones are retried
            Err(e) if !ever_ready => return Err(e),
            Err(e) => warn!("Reconnection error: {e:#}"),
        }

        attempt += 1;
        let delay = settings.tesira.reconnect_backoff(attempt);
        info!(
            "Reconnection attempt {attempt} in {:.1}s...",
            delay.as_secs_f64()
        );
        tokio::select! {
            _ = sleep(delay) => {}
            exit = signals.recv() => match exit {
                Exit::Reload => settings = reload_settings(&cli.config, settings),
                _ => break,
            },
        }
    }

    info!("Shutdown complete");
    Ok(())
}
