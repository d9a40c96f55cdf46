// MIT License - Copyright (c) 2021 TJForc
// Error taxonomy

/// All errors that can occur while talking to a Tesira device.
#[derive(Debug, thiserror::Error)]
pub enum TesiraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Client not connected: {transport}")]
    NotConnected { transport: &'static str },

    #[error("Connection closed by device: {transport}")]
    Disconnected { transport: &'static str },

    #[error("Timeout waiting for {context}")]
    Timeout { context: String },

    #[error("Device error: {reply}")]
    Response { reply: String },

    #[error("Invalid response: {details}")]
    InvalidResponse { details: String },

    #[error("Key: {identifier} does not match any subscriptions")]
    UnknownSubscription { identifier: String },

    #[error("Duplicate subscription identifier: {identifier}")]
    DuplicateSubscription { identifier: String },

    #[error("Invalid subscription: {reason}")]
    InvalidSubscription { reason: String },

    #[error("Channel closed")]
    ChannelClosed,
}

impl TesiraError {
    /// Whether the transport is unusable after this error.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            TesiraError::Io(_)
                | TesiraError::Connect { .. }
                | TesiraError::NotConnected { .. }
                | TesiraError::Disconnected { .. }
                | TesiraError::ChannelClosed
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TesiraError::Timeout { .. })
    }

    /// The device answered, but with an error or something we could not parse.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            TesiraError::Response { .. } | TesiraError::InvalidResponse { .. }
        )
    }

    /// Whether this error is transient and the connection should be retried.
    pub fn is_retryable(&self) -> bool {
        self.is_connection() || self.is_timeout()
    }

    /// The raw device reply, when the error carries one.
    pub fn device_reply(&self) -> Option<&str> {
        match self {
            TesiraError::Response { reply } => Some(reply),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TesiraError>;
