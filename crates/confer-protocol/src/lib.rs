//! # confer-protocol
//!
//! Wire protocol definitions for the Confer meeting signaling backend.
//!
//! This crate defines the JSON messages exchanged between meeting clients
//! and the room coordinator, the transmitted roster artifacts, and the
//! WebSocket close codes the coordinator uses.
//!
//! ## Message Types
//!
//! - `ClientMessage` - client → coordinator (leave, update, mute, heartbeat, ...)
//! - `ServerMessage` - coordinator → client (roster broadcasts, errors, ...)
//! - `RoomState` - the broadcastable snapshot of meeting id + roster
//!
//! ## Example
//!
//! ```rust
//! use confer_protocol::{codec, ClientMessage};
//!
//! let msg = codec::decode_client(r#"{"type":"heartbeat"}"#).unwrap();
//! assert!(matches!(msg, ClientMessage::Heartbeat));
//! ```

pub mod close_codes;
pub mod codec;
pub mod messages;

pub use codec::{decode_client, encode_server, ProtocolError};
pub use messages::{ClientMessage, RoomState, ServerMessage, User, UserTracks};
