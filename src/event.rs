// MIT License - Copyright (c) 2021 TJForc
// Client events

use crate::attribute::AttributeState;

/// All events that can be emitted by the client.
///
/// Created with [`event_channel`]; the receiver is handed to whatever publishes state
/// (the MQTT bridge in this crate).
#[derive(Debug, Clone)]
pub enum TesiraEvent {
    /// Both Telnet sessions are open and the serial number is known
    Connected { serial_number: String },
    /// The event session was closed by the device or failed
    Disconnected,
    /// An attribute was subscribed, or its value changed on the device
    AttributeUpdated(AttributeState),
    /// A subscribe-all cycle finished
    SubscriptionsRefreshed { subscribed: usize, failed: usize },
}

/// Type alias for the event sender.
pub type EventSender = tokio::sync::mpsc::UnboundedSender<TesiraEvent>;

/// Type alias for the event receiver.
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<TesiraEvent>;

/// Create a new event channel.
///
/// Unbounded: state updates are never dropped, even while the bus is not being polled.
pub fn event_channel() -> (EventSender, EventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}
