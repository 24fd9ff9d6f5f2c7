//! SIP support for the gblink GB28181 gateway.
//!
//! GB/T 28181 profiles RFC 3261 down to a handful of methods (REGISTER,
//! MESSAGE, INVITE, ACK, BYE) over TCP, with one GB extension: the `Subject`
//! header and the SDP `y=` line carry the 10-digit SSRC. This crate provides:
//!
//! - [`SipFramer`]: incremental splitting of a TCP byte stream into raw
//!   messages (`\r\n\r\n` + `Content-Length`).
//! - [`SipMessage`]: the typed view the transaction state machine works on,
//!   plus serialisation of outbound requests and responses.
//! - [`InviteSdp`]: the SDP offer sent with INVITE.
//! - [`token`]: branch/tag/Call-ID generation.
//!
//! It deliberately is not a general RFC 3261 stack; it understands exactly
//! the messages GB devices exchange.

pub mod error;
pub mod message;
pub mod reader;
pub mod sdp;
pub mod token;

pub use error::{Error, Result};
pub use message::{SipMessage, SipMessageKind, SipMethod};
pub use reader::{RawSipMessage, SipFramer};
pub use sdp::InviteSdp;
