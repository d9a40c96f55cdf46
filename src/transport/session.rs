// MIT License - Copyright (c) 2021 TJForc
// Subscription session: single owner of the event transport

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::attribute::{AttributeState, LevelBounds, SubscriptionTable, ValueKind};
use crate::config::{Attribute, Subscription, TesiraConfig};
use crate::error::{Result, TesiraError};
use crate::event::{EventSender, TesiraEvent};
use crate::protocol::{is_echo, Command, PublishToken, Reply};
use crate::transport::line::LineTransport;

const REQUEST_QUEUE: usize = 32;

/// Result of a single subscribe exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscribeOutcome {
    /// Subscribed; the state was stored and published.
    Subscribed(AttributeState),
    /// The device still had the subscription. Nothing changed.
    AlreadySubscribed,
    /// `+OK` arrived without a value line. Nothing was stored or published.
    Partial,
}

/// Summary of a subscribe-all cycle.
#[derive(Debug, Default)]
pub struct SubscribeReport {
    pub subscribed: usize,
    pub already_subscribed: usize,
    pub partial: usize,
    /// Subscriptions the device rejected, with the error carrying its reply.
    pub failed: Vec<(String, TesiraError)>,
}

impl SubscribeReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Requests served by the session task, one at a time.
pub enum SessionRequest {
    Subscribe {
        subscription: Subscription,
        reply: oneshot::Sender<Result<SubscribeOutcome>>,
    },
    SubscribeAll {
        subscriptions: Vec<Subscription>,
        reply: oneshot::Sender<Result<SubscribeReport>>,
    },
    LevelBounds {
        subscription: Subscription,
        reply: oneshot::Sender<Result<LevelBounds>>,
    },
}

/// Cloneable handle for submitting requests to the session task.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionRequest>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub async fn subscribe(&self, subscription: Subscription) -> Result<SubscribeOutcome> {
        let (reply, rx) = oneshot::channel();
        self.submit(SessionRequest::Subscribe {
            subscription,
            reply,
        })
        .await?;
        rx.await.map_err(|_| TesiraError::ChannelClosed)?
    }

    pub async fn subscribe_all(&self, subscriptions: Vec<Subscription>) -> Result<SubscribeReport> {
        let (reply, rx) = oneshot::channel();
        self.submit(SessionRequest::SubscribeAll {
            subscriptions,
            reply,
        })
        .await?;
        rx.await.map_err(|_| TesiraError::ChannelClosed)?
    }

    pub async fn level_bounds(&self, subscription: Subscription) -> Result<LevelBounds> {
        let (reply, rx) = oneshot::channel();
        self.submit(SessionRequest::LevelBounds {
            subscription,
            reply,
        })
        .await?;
        rx.await.map_err(|_| TesiraError::ChannelClosed)?
    }

    /// Stop the session task at its next suspension point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn submit(&self, request: SessionRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| TesiraError::ChannelClosed)
    }
}

/// Spawn the session task. It owns `transport` until it exits.
pub fn spawn_session(
    transport: LineTransport,
    config: &TesiraConfig,
    serial_number: String,
    table: SubscriptionTable,
    events: EventSender,
    cancel: CancellationToken,
) -> (SessionHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
    let session = Session {
        transport,
        table,
        events,
        serial_number,
        response_timeout: config.response_timeout(),
        settle_delay: config.settle_delay(),
        subscribe_pause: config.subscribe_pause(),
        drain_timeout: config.drain_timeout(),
    };
    let task = tokio::spawn(session.run(rx, cancel.clone()));
    (SessionHandle { tx, cancel }, task)
}

enum Step {
    Stop,
    Request(SessionRequest),
    Line(Result<String>),
}

struct Session {
    transport: LineTransport,
    table: SubscriptionTable,
    events: EventSender,
    serial_number: String,
    response_timeout: Duration,
    settle_delay: Duration,
    subscribe_pause: Duration,
    drain_timeout: Duration,
}

impl Session {
    /// Serve requests; while idle, drain push notifications.
    ///
    /// Requests win over draining; a pending line read is dropped without losing bytes.
    async fn run(mut self, mut requests: mpsc::Receiver<SessionRequest>, cancel: CancellationToken) {
        info!("Starting Tesira subscription telnet reading loop");
        let mut failed = false;

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Stop,
                request = requests.recv() => match request {
                    Some(request) => Step::Request(request),
                    None => Step::Stop,
                },
                line = self.transport.read_line(self.drain_timeout) => Step::Line(line),
            };

            match step {
                Step::Stop => break,
                Step::Request(request) => {
                    let broken = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        broken = self.handle_request(request) => broken,
                    };
                    if broken {
                        error!("Subscription session unusable, stopping");
                        failed = true;
                        break;
                    }
                }
                Step::Line(Ok(line)) => self.route_line(&line).await,
                Step::Line(Err(e)) if e.is_timeout() => {}
                Step::Line(Err(e)) => {
                    error!("Subscription session failed: {}", e);
                    failed = true;
                    break;
                }
            }
        }

        requests.close();
        self.transport.close();
        if failed {
            let _ = self.events.send(TesiraEvent::Disconnected);
        }
        debug!("Subscription session stopped");
    }

    /// Serve one request. Returns true when the transport is no longer usable.
    async fn handle_request(&mut self, request: SessionRequest) -> bool {
        match request {
            SessionRequest::Subscribe {
                subscription,
                reply,
            } => {
                let result = self.subscribe(&subscription).await;
                let broken = is_broken(&result);
                let _ = reply.send(result);
                broken
            }
            SessionRequest::SubscribeAll {
                subscriptions,
                reply,
            } => {
                let result = self.subscribe_all(&subscriptions).await;
                let broken = is_broken(&result);
                let _ = reply.send(result);
                broken
            }
            SessionRequest::LevelBounds {
                subscription,
                reply,
            } => {
                let result = self.level_bounds(&subscription).await;
                let broken = is_broken(&result);
                let _ = reply.send(result);
                broken
            }
        }
    }

    async fn subscribe_all(&mut self, subscriptions: &[Subscription]) -> Result<SubscribeReport> {
        info!("Subscribing to Tesira");
        let mut report = SubscribeReport::default();

        for (i, subscription) in subscriptions.iter().enumerate() {
            if i > 0 {
                sleep(self.subscribe_pause).await;
            }
            match self.subscribe(subscription).await {
                Ok(SubscribeOutcome::Subscribed(_)) => report.subscribed += 1,
                Ok(SubscribeOutcome::AlreadySubscribed) => report.already_subscribed += 1,
                Ok(SubscribeOutcome::Partial) => report.partial += 1,
                Err(e) if e.is_response() => {
                    let identifier = subscription.identifier();
                    error!("Subscription {} failed: {}", identifier, e);
                    report.failed.push((identifier, e));
                }
                Err(e) => return Err(e),
            }
        }

        if report.is_complete() {
            info!("Tesira Subscriptions created successfully");
        } else {
            warn!(
                "Tesira Subscriptions created with {} failure(s)",
                report.failed.len()
            );
        }
        let _ = self.events.send(TesiraEvent::SubscriptionsRefreshed {
            subscribed: report.subscribed + report.already_subscribed,
            failed: report.failed.len(),
        });
        Ok(report)
    }

    /// Issue one subscribe command and read until its terminator.
    ///
    /// Pushes for other identifiers may arrive in between and are applied as they come.
    /// The publish-token line for this identifier carries the initial value.
    async fn subscribe(&mut self, subscription: &Subscription) -> Result<SubscribeOutcome> {
        let identifier = subscription.identifier();
        debug!("Creating subscription for {}", identifier);

        let command = Command::subscribe(subscription).to_wire_string();
        self.transport.write_line(&command).await?;
        sleep(self.settle_delay).await;

        let mut initial: Option<String> = None;
        let mut echo_seen = false;
        loop {
            let line = self.transport.read_line(self.response_timeout).await?;
            if !echo_seen && is_echo(&line, &command) {
                echo_seen = true;
                continue;
            }
            match Reply::parse(&line) {
                Reply::Blank => {}
                Reply::Ok => break,
                Reply::Value(value) => {
                    initial = Some(value);
                    break;
                }
                Reply::AlreadySubscribed => {
                    debug!("{} already subscribed", identifier);
                    return Ok(SubscribeOutcome::AlreadySubscribed);
                }
                Reply::Error(reply) => return Err(TesiraError::Response { reply }),
                Reply::Publish(token) if token.identifier == identifier => {
                    initial = Some(token.value);
                }
                Reply::Publish(token) => self.apply_push(token).await,
                Reply::Other(other) => {
                    warn!("Unexpected line while subscribing {}: {}", identifier, other);
                }
            }
        }

        self.resync().await?;

        let Some(raw) = initial else {
            warn!("Subscription {} acknowledged without a value", identifier);
            return Ok(SubscribeOutcome::Partial);
        };

        let value = ValueKind::for_attribute(&subscription.attribute).coerce(&raw)?;
        let bounds = match subscription.attribute {
            Attribute::Level => Some(self.level_bounds(subscription).await?),
            _ => None,
        };

        let state = AttributeState::new(subscription, &self.serial_number, value, bounds);
        self.table.insert(state.clone()).await;
        let _ = self
            .events
            .send(TesiraEvent::AttributeUpdated(state.clone()));
        Ok(SubscribeOutcome::Subscribed(state))
    }

    async fn level_bounds(&mut self, subscription: &Subscription) -> Result<LevelBounds> {
        let min_level = self.get_float(&Command::min_level(subscription)).await?;
        let max_level = self.get_float(&Command::max_level(subscription)).await?;
        Ok(LevelBounds {
            min_level,
            max_level,
        })
    }

    /// Synchronous `get` on the event transport. Pushes read while waiting do not count
    /// as the answer.
    async fn get_float(&mut self, command: &Command) -> Result<f64> {
        let command = command.to_wire_string();
        self.transport.write_line(&command).await?;
        sleep(self.settle_delay).await;

        let mut echo_seen = false;
        let raw = loop {
            let line = self.transport.read_line(self.response_timeout).await?;
            if !echo_seen && is_echo(&line, &command) {
                echo_seen = true;
                continue;
            }
            match Reply::parse(&line) {
                Reply::Value(value) => break value,
                Reply::Publish(token) => self.apply_push(token).await,
                Reply::Blank => {}
                Reply::Error(reply) => return Err(TesiraError::Response { reply }),
                _ => {
                    return Err(TesiraError::InvalidResponse {
                        details: format!("{command}: {line}"),
                    });
                }
            }
        };

        self.resync().await?;
        raw.parse::<f64>()
            .map_err(|_| TesiraError::InvalidResponse {
                details: format!("{command}: expected a number, got {raw:?}"),
            })
    }

    /// Consume the line trailing a reply. Usually blank; a push is applied.
    async fn resync(&mut self) -> Result<()> {
        match self.transport.read_line(self.response_timeout).await {
            Ok(line) => {
                self.route_line(&line).await;
                Ok(())
            }
            Err(e) if e.is_timeout() => {
                debug!("No trailing line after reply");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn route_line(&mut self, line: &str) {
        match Reply::parse(line) {
            Reply::Publish(token) => self.apply_push(token).await,
            Reply::Blank | Reply::Ok => {}
            other => debug!("Ignoring unsolicited line: {:?}", other),
        }
    }

    async fn apply_push(&mut self, token: PublishToken) {
        if let Err(e) = handle_push(&self.table, &self.events, token).await {
            match e {
                TesiraError::UnknownSubscription { identifier } => {
                    error!("Push notification for unknown subscription {}; dropped", identifier);
                }
                other => warn!("Push notification rejected: {}", other),
            }
        }
    }
}

/// Apply a push notification to the table and emit exactly one update.
pub async fn handle_push(
    table: &SubscriptionTable,
    events: &EventSender,
    token: PublishToken,
) -> Result<AttributeState> {
    let state = table.apply(&token).await?;
    debug!("{} is now {}", state.identifier, state.value);
    let _ = events.send(TesiraEvent::AttributeUpdated(state.clone()));
    Ok(state)
}

/// Connection failures and missed replies both leave the session unusable; a late
/// reply would end the next exchange early.
fn is_broken<T>(result: &Result<T>) -> bool {
    matches!(result, Err(e) if e.is_retryable())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::AttributeValue;
    use crate::constants::WELCOME_BANNER;
    use crate::event::{event_channel, EventReceiver};
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};

    const PUSH_LIMIT: Duration = Duration::from_secs(2);

    fn test_config() -> TesiraConfig {
        TesiraConfig::builder()
            .settle_delay_ms(0)
            .subscribe_pause_ms(0)
            .response_timeout_ms(1000)
            .drain_timeout_ms(100)
            .build()
    }

    struct Device {
        lines: tokio::io::Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        write: WriteHalf<DuplexStream>,
    }

    impl Device {
        async fn expect(&mut self, command: &str) {
            let line = self.lines.next_line().await.unwrap().unwrap();
            assert_eq!(line.trim(), command);
        }

        async fn send(&mut self, lines: &[&str]) {
            let mut out = String::new();
            for line in lines {
                out.push_str(line);
                out.push_str("\r\n");
            }
            self.write.write_all(out.as_bytes()).await.unwrap();
        }
    }

    async fn start() -> (SessionHandle, JoinHandle<()>, Device, SubscriptionTable, EventReceiver) {
        let (client, server) = duplex(8192);
        let (read, mut write) = tokio::io::split(server);
        write.write_all(WELCOME_BANNER.as_bytes()).await.unwrap();

        let config = test_config();
        let mut transport = LineTransport::new("subscription");
        transport
            .attach(client, config.response_timeout())
            .await
            .unwrap();

        let table = SubscriptionTable::new();
        let (events, rx) = event_channel();
        let (handle, task) = spawn_session(
            transport,
            &config,
            "SN1".to_string(),
            table.clone(),
            events,
            CancellationToken::new(),
        );
        let device = Device {
            lines: BufReader::new(read).lines(),
            write,
        };
        (handle, task, device, table, rx)
    }

    fn mute() -> Subscription {
        Subscription::new("Mixer1", Attribute::Mute, 1, "Mic", "Room")
    }

    fn level() -> Subscription {
        Subscription::new("Level1", Attribute::Level, 1, "Main", "Room")
    }

    async fn next_update(rx: &mut EventReceiver) -> AttributeState {
        loop {
            let event = tokio::time::timeout(PUSH_LIMIT, rx.recv())
                .await
                .expect("no event")
                .expect("channel closed");
            if let TesiraEvent::AttributeUpdated(state) = event {
                return state;
            }
        }
    }

    #[tokio::test]
    async fn test_subscribe_mute() {
        let (handle, _task, mut device, table, mut rx) = start().await;

        let pending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.subscribe(mute()).await }
        });
        device.expect("Mixer1 subscribe mute 1 Mixer1_mute_1").await;
        device
            .send(&[
                "Mixer1 subscribe mute 1 Mixer1_mute_1",
                "",
                "! \"publishToken\":\"Mixer1_mute_1\" \"value\":true",
                "+OK",
                "",
            ])
            .await;

        let outcome = pending.await.unwrap().unwrap();
        let SubscribeOutcome::Subscribed(state) = outcome else {
            panic!("unexpected outcome: {outcome:?}");
        };
        assert_eq!(state.value, AttributeValue::Bool(true));
        assert_eq!(state.unique_id, "SN1_Mixer1_mute_1");
        assert!(state.bounds.is_none());
        assert_eq!(table.get("Mixer1_mute_1").await, Some(state.clone()));
        assert_eq!(next_update(&mut rx).await, state);
    }

    #[tokio::test]
    async fn test_subscribe_level_fetches_bounds() {
        let (handle, _task, mut device, _table, mut rx) = start().await;

        let pending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.subscribe(level()).await }
        });
        device.expect("Level1 subscribe level 1 Level1_level_1").await;
        device
            .send(&[
                "! \"publishToken\":\"Level1_level_1\" \"value\":-10.000000",
                "+OK",
                "",
            ])
            .await;
        device.expect("Level1 get minLevel 1").await;
        device
            .send(&["Level1 get minLevel 1", "+OK \"value\":-100.000000", ""])
            .await;
        device.expect("Level1 get maxLevel 1").await;
        device
            .send(&["Level1 get maxLevel 1", "+OK \"value\":12.000000", ""])
            .await;

        let outcome = pending.await.unwrap().unwrap();
        let SubscribeOutcome::Subscribed(state) = outcome else {
            panic!("unexpected outcome: {outcome:?}");
        };
        assert_eq!(state.value, AttributeValue::Float(-10.0));
        assert_eq!(
            state.bounds,
            Some(LevelBounds {
                min_level: -100.0,
                max_level: 12.0
            })
        );
        assert_eq!(next_update(&mut rx).await, state);
    }

    #[tokio::test]
    async fn test_subscribe_error_reply() {
        let (handle, _task, mut device, table, _rx) = start().await;

        let pending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.subscribe(mute()).await }
        });
        device.expect("Mixer1 subscribe mute 1 Mixer1_mute_1").await;
        device
            .send(&["-ERR address not found: {\"deviceId\":0 \"classCode\":0 \"instanceNum\":0}"])
            .await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_response());
        assert!(err.to_string().contains("address not found"));
        assert_eq!(table.len().await, 0);
        assert!(handle.is_running());
    }

    #[tokio::test]
    async fn test_partial_response_is_not_published() {
        let (handle, _task, mut device, table, mut rx) = start().await;

        let pending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.subscribe(mute()).await }
        });
        device.expect("Mixer1 subscribe mute 1 Mixer1_mute_1").await;
        device.send(&["+OK", ""]).await;

        assert_eq!(pending.await.unwrap().unwrap(), SubscribeOutcome::Partial);
        assert_eq!(table.len().await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bounds_skip_interleaved_push() {
        let (handle, _task, mut device, table, mut rx) = start().await;
        table
            .insert(AttributeState::new(
                &mute(),
                "SN1",
                AttributeValue::Bool(false),
                None,
            ))
            .await;

        let pending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.level_bounds(level()).await }
        });
        device.expect("Level1 get minLevel 1").await;
        device
            .send(&[
                "! \"publishToken\":\"Mixer1_mute_1\" \"value\":true",
                "+OK \"value\":-60.000000",
                "",
            ])
            .await;
        device.expect("Level1 get maxLevel 1").await;
        device.send(&["+OK \"value\":0.000000", ""]).await;

        let bounds = pending.await.unwrap().unwrap();
        assert_eq!(bounds.min_level, -60.0);
        assert_eq!(bounds.max_level, 0.0);
        assert_eq!(next_update(&mut rx).await.value, AttributeValue::Bool(true));
    }

    #[tokio::test]
    async fn test_bounds_unexpected_reply() {
        let (handle, _task, mut device, _table, _rx) = start().await;

        let pending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.level_bounds(level()).await }
        });
        device.expect("Level1 get minLevel 1").await;
        device.send(&["+OK"]).await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, TesiraError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn test_drain_applies_push_once() {
        let (_handle, _task, mut device, table, mut rx) = start().await;
        table
            .insert(AttributeState::new(
                &mute(),
                "SN1",
                AttributeValue::Bool(false),
                None,
            ))
            .await;

        device
            .send(&["! \"publishToken\":\"Mixer1_mute_1\" \"value\":true", ""])
            .await;

        let state = next_update(&mut rx).await;
        assert_eq!(state.value, AttributeValue::Bool(true));
        assert_eq!(
            table.get("Mixer1_mute_1").await.unwrap().value,
            AttributeValue::Bool(true)
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drain_drops_unknown_identifier() {
        let (handle, _task, mut device, table, mut rx) = start().await;
        device
            .send(&["! \"publishToken\":\"Ghost_mute_9\" \"value\":true"])
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(table.len().await, 0);
        assert!(handle.is_running());
    }

    #[tokio::test]
    async fn test_missed_reply_ends_session() {
        let (handle, task, mut device, table, mut rx) = start().await;

        let pending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.subscribe(mute()).await }
        });
        device.expect("Mixer1 subscribe mute 1 Mixer1_mute_1").await;
        device.send(&["Mixer1 subscribe mute 1 Mixer1_mute_1"]).await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_timeout());
        task.await.unwrap();
        assert!(matches!(rx.recv().await, Some(TesiraEvent::Disconnected)));
        assert!(!handle.is_running());

        // the late reply never reaches a later exchange
        let _ = device.write.write_all(b"+OK\r\n").await;
        assert!(handle.subscribe(level()).await.unwrap_err().is_connection());
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn test_device_hangup_emits_disconnected() {
        let (handle, task, device, _table, mut rx) = start().await;
        drop(device);
        task.await.unwrap();
        assert!(matches!(rx.recv().await, Some(TesiraEvent::Disconnected)));
        assert!(matches!(
            handle.subscribe(mute()).await,
            Err(TesiraError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_cancel_stops_without_disconnect_event() {
        let (handle, task, _device, _table, mut rx) = start().await;
        handle.cancel();
        task.await.unwrap();
        assert!(rx.recv().await.is_none());
        assert!(!handle.is_running());
    }
}
