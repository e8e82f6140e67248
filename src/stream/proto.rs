//! Realtime (centrifugo) wire frames.
//!
//! Outbound frames are plain serde structs whose field order matches what
//! the service expects. Inbound frames carry no common envelope tag, so
//! [`parse_inbound_frame`] tries each known shape in a fixed priority order
//! and falls back to [`InboundFrame::Unrecognized`].

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::api::string_or_number;

const HANDSHAKE_ID: u64 = 1;
const SUBSCRIBE_ID: u64 = 2;
const SUBSCRIBE_METHOD: u64 = 1;
const DONATION_CHANNEL_PREFIX: &str = "$alerts:donation";

/// One donation delivered on the subscribed channel.
#[derive(Clone, Debug, PartialEq)]
pub struct Donation {
    /// Sender display name; empty for anonymous donations.
    pub from: String,
    /// Message attached to the donation, possibly empty.
    pub message: String,
    /// Amount in `currency` units.
    pub amount: f64,
    /// ISO currency code, e.g. `RUB`.
    pub currency: String,
}

/// Classified inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    /// Reply to the handshake frame, carrying the connection's client id.
    HandshakeAck { client: String },
    /// Publication on the donation channel.
    Donation(Donation),
    /// Any other well-formed frame (subscribe replies, pings, other channels).
    Unrecognized,
}

#[derive(Debug, Error)]
pub enum FrameParseError {
    #[error("frame is not valid json: {0}")]
    Json(#[source] serde_json::Error),

    #[error("donation frame has an invalid payload: {0}")]
    Donation(#[source] serde_json::Error),
}

/// `{"params":{"token":"..."},"id":1}`
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct HandshakeFrame {
    pub params: HandshakeParams,
    pub id: u64,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct HandshakeParams {
    pub token: String,
}

impl HandshakeFrame {
    pub fn new(connection_token: impl Into<String>) -> Self {
        Self {
            params: HandshakeParams {
                token: connection_token.into(),
            },
            id: HANDSHAKE_ID,
        }
    }
}

/// `{"params":{"channel":"...","token":"..."},"method":1,"id":2}`
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SubscribeFrame {
    pub params: SubscribeParams,
    pub method: u64,
    pub id: u64,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SubscribeParams {
    pub channel: String,
    pub token: String,
}

impl SubscribeFrame {
    pub fn new(channel: impl Into<String>, channel_token: impl Into<String>) -> Self {
        Self {
            params: SubscribeParams {
                channel: channel.into(),
                token: channel_token.into(),
            },
            method: SUBSCRIBE_METHOD,
            id: SUBSCRIBE_ID,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HandshakeAckShape {
    id: u64,
    result: HandshakeAckResult,
}

#[derive(Debug, Deserialize)]
struct HandshakeAckResult {
    client: String,
}

#[derive(Debug, Deserialize)]
struct PublicationShape {
    result: PublicationResult,
}

#[derive(Debug, Deserialize)]
struct PublicationResult {
    channel: String,
    data: Value,
}

#[derive(Debug, Deserialize)]
struct DonationEnvelope {
    data: DonationPayload,
}

#[derive(Debug, Deserialize)]
struct DonationPayload {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(deserialize_with = "numeric")]
    amount: f64,
    #[serde(default)]
    currency: Option<String>,
}

impl From<DonationPayload> for Donation {
    fn from(payload: DonationPayload) -> Self {
        Self {
            from: payload.username.unwrap_or_default(),
            message: payload.message.unwrap_or_default(),
            amount: payload.amount,
            currency: payload.currency.unwrap_or_default(),
        }
    }
}

/// Classifies one inbound text frame.
///
/// Priority: handshake ack, then donation publication, then unrecognized.
/// Only invalid JSON and donation publications with an undecodable payload
/// are errors.
pub fn parse_inbound_frame(text: &str) -> Result<InboundFrame, FrameParseError> {
    let value: Value = serde_json::from_str(text).map_err(FrameParseError::Json)?;

    if let Ok(ack) = HandshakeAckShape::deserialize(&value) {
        if ack.id == HANDSHAKE_ID {
            return Ok(InboundFrame::HandshakeAck {
                client: ack.result.client,
            });
        }
    }

    if let Ok(publication) = PublicationShape::deserialize(&value) {
        if publication.result.channel.starts_with(DONATION_CHANNEL_PREFIX) {
            let envelope = DonationEnvelope::deserialize(publication.result.data)
                .map_err(FrameParseError::Donation)?;
            return Ok(InboundFrame::Donation(envelope.data.into()));
        }
    }

    Ok(InboundFrame::Unrecognized)
}

fn numeric<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let text = string_or_number(deserializer)?;
    text.trim().parse().map_err(serde::de::Error::custom)
}
