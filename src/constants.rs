// MIT License - Copyright (c) 2021 TJForc
// Tesira Text Protocol constants

/// Greeting sent by the device once per Telnet session.
pub const WELCOME_BANNER: &str = "Welcome to the Tesira Text Protocol Server...\r\n";

/// Line terminator for outgoing commands.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Default Telnet port of the Tesira Text Protocol server.
pub const DEFAULT_PORT: u16 = 23;

/// Successful reply, optionally followed by a `"value":` field.
pub const OK: &str = "+OK";

/// Prefix of every successful reply that carries a value.
pub const OK_VALUE_PREFIX: &str = "+OK \"value\":";

/// Prefix of every error reply.
pub const ERR: &str = "-ERR";

/// Error reason returned when re-subscribing an identifier the device still tracks.
pub const ALREADY_SUBSCRIBED: &str = "-ERR ALREADY_SUBSCRIBED";

/// Prefix of asynchronous push notifications.
///
/// Full form: `! "publishToken":"<identifier>" "value":<value>`
pub const PUBLISH_TOKEN_PREFIX: &str = "! \"publishToken\":";

/// Separator between the token and the value field of a push notification.
pub const VALUE_FIELD: &str = "\"value\":";

/// Instance tag that addresses the device itself.
pub const DEVICE_INSTANCE_TAG: &str = "DEVICE";

/// Manufacturer advertised in discovery payloads.
pub const MANUFACTURER: &str = "Biamp Systems, LLC";

/// Telnet command bytes (RFC 854).
pub mod telnet {
    pub const IAC: u8 = 255;
    pub const DONT: u8 = 254;
    pub const DO: u8 = 253;
    pub const WONT: u8 = 252;
    pub const WILL: u8 = 251;
    pub const SB: u8 = 250;
    pub const SE: u8 = 240;
}
