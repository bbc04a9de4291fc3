//! Client Streaming Protocol
//!
//! Transport-agnostic message shapes exchanged with live clients.
//! Every message is a JSON object tagged by `"type"`.
//!
//! Inbound: `subscribe`, `unsubscribe`.
//! Outbound: `subscribed`, `unsubscribed`, `update`, `error`.

use serde::{Deserialize, Serialize};

use crate::domain::indicators::{Indicator, IndicatorValues};
use crate::domain::market::{EpochMillis, Symbol};
use crate::domain::subscription::ClientId;

// =============================================================================
// Inbound
// =============================================================================

/// Message received from a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Subscribe to symbols.
    Subscribe(SubscribeRequest),
    /// Unsubscribe from symbols.
    Unsubscribe(UnsubscribeRequest),
}

impl ClientMessage {
    /// Parse a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] when the frame is not a known
    /// message.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Payload of a `subscribe` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    /// Symbols to subscribe to. Must be present and non-empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbols: Option<Vec<Symbol>>,
    /// Indicators wanted on every update for these symbols.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indicators: Option<Vec<Indicator>>,
    /// Minimum spacing between delivered updates per symbol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle_ms: Option<u64>,
    /// Artificial delay before each send, to model a slow consumer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulate_latency_ms: Option<u64>,
}

/// Payload of an `unsubscribe` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    /// Symbols to drop. Missing or empty drops every symbol.
    #[serde(default)]
    pub symbols: Vec<Symbol>,
}

// =============================================================================
// Outbound
// =============================================================================

/// Message sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Subscription acknowledged.
    Subscribed {
        /// The client's symbols after the subscribe.
        symbols: Vec<Symbol>,
        /// Indicators recorded for the symbols in the request.
        indicators: Vec<Indicator>,
    },
    /// Unsubscription acknowledged.
    Unsubscribed {
        /// Symbols removed.
        symbols: Vec<Symbol>,
    },
    /// Live price update.
    Update(UpdateMessage),
    /// Request rejected.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

impl ServerMessage {
    /// Build an error message from any displayable reason.
    #[must_use]
    pub fn error(reason: impl std::fmt::Display) -> Self {
        Self::Error {
            message: reason.to_string(),
        }
    }

    /// Serialize to a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails (non-string map keys never
    /// occur here, so this is effectively infallible).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// One live update for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateMessage {
    /// Symbol the update belongs to.
    pub symbol: Symbol,
    /// Tick time.
    pub timestamp: EpochMillis,
    /// Current price.
    pub price: f64,
    /// Requested indicators, omitted when none were requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indicators: Option<IndicatorValues>,
}

// =============================================================================
// Errors
// =============================================================================

/// Client-visible protocol errors. They never affect other clients.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Subscribe without a non-empty symbol list.
    #[error("symbols must be a non-empty array")]
    EmptySymbols,
    /// Frame could not be parsed.
    #[error("malformed message: {0}")]
    Malformed(String),
    /// Message from a client that is not connected.
    #[error("unknown client {0}")]
    UnknownClient(ClientId),
}

// =============================================================================
// Tests
// =============================================================================
