//! Error types for the forwarding bridge

use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Main error type for bridge operations
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// Attach requested while no downstream connection exists
    #[error("No downstream connection available")]
    NoDownstreamConnection,

    /// The sender factory reported a failure
    #[error("Failed to create downstream sender for {address}: {reason}")]
    SenderCreationFailed {
        /// Downstream address the sender was requested for
        address: String,
        /// Reason reported by the factory
        reason: String,
    },

    /// The sender factory did not complete in time
    #[error("Downstream sender for {address} not created within {timeout_ms}ms")]
    SenderCreationTimeout {
        /// Downstream address the sender was requested for
        address: String,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// A message arrived for a client without a registered link
    #[error("No link registered for client {client_id}")]
    UnknownClient {
        /// Client the message was addressed from
        client_id: String,
    },

    /// The downstream connection went away
    #[error("Downstream connection lost")]
    DownstreamConnectionLost,

    /// A link for this client is already registered
    #[error("Client {client_id} is already attached on connection {connection_id}")]
    DuplicateLink {
        /// Upstream connection of the rejected attach
        connection_id: String,
        /// Client of the rejected attach
        client_id: String,
    },

    /// Target address could not be parsed
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Downstream sender refused a message
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// No handler subscribed to a bus address
    #[error("No handler registered for address {address}")]
    NoHandler {
        /// Bus address that had no subscriber
        address: String,
    },

    /// A request on the bus was not acknowledged in time
    #[error("No acknowledgement from {address} after {timeout_ms}ms")]
    AckTimeout {
        /// Bus address the request was sent to
        address: String,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// Channel closed before the operation completed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Upstream notice could not be encoded or decoded
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Configuration error
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error while loading configuration
    #[error("IO error: {0}")]
    Io(String),
}

impl BridgeError {
    /// Check if this error requires the affected client link to be closed
    pub fn is_terminal_for_link(&self) -> bool {
        matches!(
            self,
            BridgeError::NoDownstreamConnection
                | BridgeError::SenderCreationFailed { .. }
                | BridgeError::SenderCreationTimeout { .. }
                | BridgeError::DownstreamConnectionLost
                | BridgeError::DuplicateLink { .. }
                | BridgeError::InvalidAddress(_)
                | BridgeError::SendFailed(_)
        )
    }

    /// Check if this is a downstream connection related error
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            BridgeError::NoDownstreamConnection | BridgeError::DownstreamConnectionLost
        )
    }

    /// Create a sender creation failed error
    pub fn sender_creation_failed(address: impl Into<String>, reason: impl Into<String>) -> Self {
        BridgeError::SenderCreationFailed {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create an unknown client error
    pub fn unknown_client(client_id: impl Into<String>) -> Self {
        BridgeError::UnknownClient {
            client_id: client_id.into(),
        }
    }

    /// Create an invalid address error
    pub fn invalid_address(msg: impl Into<String>) -> Self {
        BridgeError::InvalidAddress(msg.into())
    }

    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        BridgeError::InvalidConfig(msg.into())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Encoding(err.to_string())
    }
}
