// MIT License - Copyright (c) 2021 TJForc
// Synchronous command/reply exchanges on the command session

use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::config::TesiraConfig;
use crate::error::Result;
use crate::protocol::{interpret_command_reply, is_echo, Command};
use crate::transport::line::LineTransport;

/// Owns the command session and serializes every exchange on it.
///
/// Shared by the startup path (serial number lookup) and by bus intake, so access
/// goes through an async mutex: one command and its reply at a time.
pub struct CommandEngine {
    transport: Mutex<LineTransport>,
    settle_delay: Duration,
    response_timeout: Duration,
}

impl CommandEngine {
    pub fn new(transport: LineTransport, config: &TesiraConfig) -> Self {
        Self {
            transport: Mutex::new(transport),
            settle_delay: config.settle_delay(),
            response_timeout: config.response_timeout(),
        }
    }

    /// Send a command and interpret the reply.
    ///
    /// `None` for a bare `+OK`, the unquoted value for `+OK "value":..`, the raw reply
    /// otherwise. `-ERR` replies fail with a response error.
    pub async fn command(&self, command: &str) -> Result<Option<String>> {
        let reply = self.exchange(command).await?;
        interpret_command_reply(&reply).inspect_err(|e| {
            warn!("Command {:?} failed: {}", command, e);
        })
    }

    pub async fn send(&self, command: &Command) -> Result<Option<String>> {
        self.command(&command.to_wire_string()).await
    }

    /// Write the command, wait the settle delay, then read the reply.
    ///
    /// The device echoes commands back; when the first line contains the command text
    /// the following line is the reply. Blank lines never count as a reply.
    ///
    /// A reply that does not arrive in time closes the session, so a late reply is never
    /// read as the answer to a later command.
    async fn exchange(&self, command: &str) -> Result<String> {
        let mut transport = self.transport.lock().await;
        transport.write_line(command).await?;
        sleep(self.settle_delay).await;

        let reply = read_reply(&mut transport, command, self.response_timeout).await;
        if let Err(e) = &reply
            && e.is_timeout()
        {
            warn!("No reply to {:?}, closing command session", command);
            transport.close();
        }
        reply
    }

    /// Close the command session. Idempotent.
    pub async fn close(&self) {
        self.transport.lock().await.close();
    }

    pub async fn is_open(&self) -> bool {
        self.transport.lock().await.is_open()
    }
}

async fn read_reply(transport: &mut LineTransport, command: &str, limit: Duration) -> Result<String> {
    let first = read_non_blank(transport, limit).await?;
    if !is_echo(&first, command) {
        return Ok(first);
    }
    debug!("Skipping echo of {:?}", command);
    read_non_blank(transport, limit).await
}

async fn read_non_blank(transport: &mut LineTransport, limit: Duration) -> Result<String> {
    loop {
        let line = transport.read_line(limit).await?;
        if !line.is_empty() {
            return Ok(line);
        }
    }
}
