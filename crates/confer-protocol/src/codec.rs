//! Codec for encoding and decoding Confer messages.
//!
//! Messages travel as JSON text frames over the WebSocket. Inbound text is
//! parsed into `ClientMessage`; outbound `ServerMessage` values are
//! serialized to text.

use thiserror::Error;

use crate::messages::{ClientMessage, ServerMessage};

/// Maximum inbound frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode an inbound client message from a text frame.
///
/// # Errors
///
/// Returns an error if the frame is too large or is not a well-formed
/// tagged message.
pub fn decode_client(text: &str) -> Result<ClientMessage, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

/// Encode an outbound server message to a text frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_server(message: &ServerMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}
