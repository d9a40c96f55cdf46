// MIT License - Copyright (c) 2021 TJForc
// Scripted Tesira Text Protocol server for integration tests
//
// Accepts two connections in the order the client opens them (subscription
// session first, command session second), sends the welcome banner on each,
// echoes every command and answers it through a responder function.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tesira_lan_bridge::constants::WELCOME_BANNER;
use tesira_lan_bridge::{EventReceiver, TesiraConfig, TesiraEvent};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const SERIAL: &str = "SN-0001";
pub const WAIT: Duration = Duration::from_secs(3);

/// Maps one received command line to the reply lines (without CRLF).
pub type Responder = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;

pub struct FakeDevice {
    pub port: u16,
    pub subscription_log: mpsc::UnboundedReceiver<String>,
    pub command_log: mpsc::UnboundedReceiver<String>,
    push: mpsc::UnboundedSender<String>,
    hang_up: CancellationToken,
    command_hang_up: CancellationToken,
}

impl FakeDevice {
    pub async fn start(responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (sub_log_tx, subscription_log) = mpsc::unbounded_channel();
        let (cmd_log_tx, command_log) = mpsc::unbounded_channel();
        let (push, push_rx) = mpsc::unbounded_channel();
        let hang_up = CancellationToken::new();
        let command_hang_up = hang_up.child_token();

        let token = hang_up.clone();
        let command_token = command_hang_up.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::spawn(serve(
                stream,
                responder.clone(),
                sub_log_tx,
                Some(push_rx),
                token.clone(),
            ));
            let (stream, _) = listener.accept().await.unwrap();
            tokio::spawn(serve(stream, responder, cmd_log_tx, None, command_token));
        });

        Self {
            port,
            subscription_log,
            command_log,
            push,
            hang_up,
            command_hang_up,
        }
    }

    /// Client config pointed at this device, with test-friendly timings.
    pub fn config(&self) -> TesiraConfig {
        TesiraConfig::builder()
            .host("127.0.0.1")
            .port(self.port)
            .settle_delay_ms(0)
            .subscribe_pause_ms(0)
            .response_timeout_ms(1000)
            .drain_timeout_ms(100)
            .build()
    }

    /// Send an unsolicited line on the subscription session.
    pub fn push(&self, line: &str) {
        self.push.send(format!("{line}\r\n")).unwrap();
    }

    /// Close both sessions from the device side.
    pub fn hang_up(&self) {
        self.hang_up.cancel();
    }

    /// Close only the command session; the subscription session stays up.
    pub fn hang_up_commands(&self) {
        self.command_hang_up.cancel();
    }
}

async fn serve(
    stream: TcpStream,
    responder: Responder,
    log: mpsc::UnboundedSender<String>,
    mut push: Option<mpsc::UnboundedReceiver<String>>,
    hang_up: CancellationToken,
) {
    let (read, mut write) = stream.into_split();
    write.write_all(WELCOME_BANNER.as_bytes()).await.unwrap();
    let mut lines = BufReader::new(read).lines();

    loop {
        tokio::select! {
            _ = hang_up.cancelled() => break,
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let line = line.trim().to_string();
                let mut out = format!("{line}\r\n");
                for reply in responder(&line) {
                    out.push_str(&reply);
                    out.push_str("\r\n");
                }
                let _ = log.send(line);
                if write.write_all(out.as_bytes()).await.is_err() {
                    break;
                }
            }
            Some(text) = next_push(&mut push) => {
                if write.write_all(text.as_bytes()).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn next_push(push: &mut Option<mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match push {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

pub fn publish(identifier: &str, value: &str) -> String {
    format!("! \"publishToken\":\"{identifier}\" \"value\":{value}")
}

/// Behaves like a device with mutes at `false` and levels at -20 dB in a -100..12 range.
pub fn tesira_responder() -> Responder {
    let subscribed: Arc<Mutex<HashSet<String>>> = Arc::default();
    Arc::new(move |line: &str| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["DEVICE", "get", "serialNumber"] => vec![format!("+OK \"value\":\"{SERIAL}\"")],
            [_, "subscribe", attribute, _, identifier] => {
                if !subscribed.lock().unwrap().insert(identifier.to_string()) {
                    return vec!["-ERR ALREADY_SUBSCRIBED".to_string()];
                }
                let value = if *attribute == "mute" { "false" } else { "-20.000000" };
                vec![publish(identifier, value), "+OK".to_string(), String::new()]
            }
            [_, "get", "minLevel", _] => vec!["+OK \"value\":-100.000000".to_string(), String::new()],
            [_, "get", "maxLevel", _] => vec!["+OK \"value\":12.000000".to_string(), String::new()],
            [_, "set", _, _, _] => vec!["+OK".to_string()],
            _ => vec!["-ERR PARSE_ERROR".to_string()],
        }
    })
}

pub async fn next_line(log: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(WAIT, log.recv())
        .await
        .expect("device received nothing")
        .expect("device log closed")
}

pub async fn next_event(rx: &mut EventReceiver) -> TesiraEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no event")
        .expect("event channel closed")
}

/// Collect every event that is already queued.
pub fn pending_events(rx: &mut EventReceiver) -> Vec<TesiraEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
