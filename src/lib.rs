//! # yawc-server
//! Server-side implementation of the WebSocket protocol (RFC 6455) on top of raw TCP.
//!
//! A [`Server`] listens on one or more addresses, performs the HTTP/1.1 upgrade handshake
//! itself and dispatches each accepted connection to the [`Handler`] registered for the
//! subprotocol the client asked for. Handlers only ever see message payloads: framing,
//! masking and control frames are dealt with by the connection.
//!
//! The engine covers a small part of the protocol:
//!
//! - Fragmented messages are not reassembled and text payloads are not validated as UTF-8.
//!   Every data frame payload is delivered to the handler as one message.
//! - Every message sent by a handler goes out as a single final binary frame.
//! - Close frames carry no status code and no reason.
//! - Ping frames are answered with a pong echoing their payload.
//! - No TLS, no compression extensions and no HTTP routing: the request target is ignored.
//!
//! # Server Example
//! ```rust,no_run
//! use yawc_server::{Inbound, Outbound, Server};
//!
//! #[tokio::main]
//! async fn main() -> yawc_server::Result<()> {
//!     let server = Server::new();
//!
//!     // "" is the subprotocol used by clients that do not send Sec-WebSocket-Protocol
//!     server.register_handler("", |mut inbound: Inbound, outbound: Outbound| async move {
//!         while let Some(message) = inbound.recv().await {
//!             outbound.send(message).await?;
//!         }
//!         Ok::<_, yawc_server::WebSocketError>(())
//!     });
//!
//!     let addr = server.listen("127.0.0.1:9002".parse().unwrap())?;
//!     println!("listening on {addr}");
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Shutdown
//! [`Server::stop`] stops accepting, stops reading from every live connection so that
//! handlers observe the end of their inbound stream, waits for every connection to finish
//! on its own and finally closes whatever is left.
//!
//! # Limits
//! Payloads above [`Options::max_payload_read`] (1 MiB by default) are refused before
//! anything is allocated for them. Queues between the socket and the handler are bounded
//! in both directions, and a handshake request head may not exceed 8 KiB.

pub mod codec;
pub mod frame;
pub mod handshake;

mod connection;
mod gate;
mod handler;
mod mask;
mod options;
mod registry;
mod server;
mod stream;

use thiserror::Error;

pub use frame::{Frame, OpCode};
pub use handler::{BoxError, Handler, Inbound, Outbound};
pub use options::{ListenOptions, Options};
pub use server::Server;

/// Shorthand for results carrying a [`WebSocketError`].
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Everything that can end a connection early.
///
/// None of these reach the peer. A failed connection is closed without a CLOSE
/// frame: only a CLOSE received from the peer, or a handler that stopped reading
/// its inbound stream, is answered with one.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// The opening handshake could not be completed.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The client violated the framing rules of RFC 6455.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Returned by a subprotocol handler.
    #[error("handler failed: {0}")]
    Handler(BoxError),

    /// The connection is already closed.
    #[error("connection closed")]
    ConnectionClosed,

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// Reasons an upgrade request is refused.
///
/// A refused request gets no HTTP response at all: the connection is closed
/// without writing a single byte.
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// The request head is not valid HTTP/1.1.
    #[error("malformed request: {0}")]
    MalformedRequest(#[from] httparse::Error),

    /// The request head parsed but could not be turned into an `http::Request`.
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] http::Error),

    /// The request head did not fit in the handshake buffer.
    #[error("request head too large")]
    RequestTooLarge,

    /// The `Upgrade` header is missing or is not exactly `websocket`.
    #[error("not a websocket upgrade request")]
    NotWebSocket,

    /// No handler is registered for the requested subprotocol.
    #[error("unsupported subprotocol {0:?}")]
    UnsupportedSubprotocol(String),

    /// No `Sec-WebSocket-Key` header.
    #[error("missing Sec-WebSocket-Key")]
    MissingSecWebSocketKey,

    /// `Sec-WebSocket-Version` is absent or not `13`.
    #[error("unsupported Sec-WebSocket-Version")]
    InvalidSecWebSocketVersion,
}

/// Framing violations detected by the [`codec::Decoder`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frames sent by a client must always be masked.
    #[error("client frame is not masked")]
    Unmasked,

    /// RSV1, RSV2 or RSV3 is set. No extension is ever negotiated.
    #[error("reserved bits set")]
    ReservedBitsNotZero,

    #[error("reserved opcode {0:#x}")]
    InvalidOpCode(u8),

    /// The announced payload length is above [`Options::max_payload_read`].
    #[error("frame payload too large")]
    FrameTooLarge,

    /// The peer closed its side of the connection in the middle of a frame.
    #[error("connection closed in the middle of a frame")]
    TruncatedFrame,
}
