//! # Handshake
//!
//! Server side of the opening handshake described in
//! [RFC 6455 Section 4.2](https://datatracker.ietf.org/doc/html/rfc6455#section-4.2).
//!
//! The request head is read with [`RequestDecoder`], checked against the registered
//! subprotocol handlers by [`negotiate`], and answered with the byte-exact
//! `101 Switching Protocols` response built by [`Negotiated::response`].
use std::{collections::HashMap, sync::Arc};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{header, HeaderMap, Request};
use sha1::{Digest, Sha1};
use tokio_util::codec;

use crate::{handler::Handler, HandshakeError, WebSocketError};

/// Magic string appended to the client key, defined by RFC 6455.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Maximum number of headers accepted in an upgrade request.
const MAX_HEADERS: usize = 32;

/// Maximum size of an upgrade request head.
pub const MAX_HEADER_SIZE: usize = 8 * 1024;

/// Computes the `Sec-WebSocket-Accept` value for a client key: `base64(sha1(key + GUID))`.
pub fn accept_key(key: &[u8]) -> String {
    use base64::prelude::*;
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(WS_GUID.as_bytes());
    let result = sha1.finalize();
    BASE64_STANDARD.encode(&result[..])
}

/// Decodes an HTTP/1.1 request head into an [`http::Request`] without a body.
///
/// Bytes following the head are left in the buffer: a client may send its first
/// frames right behind the upgrade request.
#[derive(Debug, Default)]
pub struct RequestDecoder;

impl codec::Decoder for RequestDecoder {
    type Item = Request<()>;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let len = match req.parse(src).map_err(HandshakeError::from)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => {
                if src.len() > MAX_HEADER_SIZE {
                    return Err(HandshakeError::RequestTooLarge.into());
                }
                return Ok(None);
            }
        };
        if len > MAX_HEADER_SIZE {
            return Err(HandshakeError::RequestTooLarge.into());
        }

        let mut builder = Request::builder()
            .method(req.method.unwrap_or("GET"))
            .uri(req.path.unwrap_or("/"))
            .version(http::Version::HTTP_11);
        for h in req.headers.iter() {
            builder = builder.header(h.name, h.value);
        }
        let request = builder.body(()).map_err(HandshakeError::from)?;

        src.advance(len);
        Ok(Some(request))
    }
}

/// Outcome of a successful negotiation: the handler bound to the connection.
pub struct Negotiated {
    /// Requested subprotocol, `""` when the client did not ask for one.
    pub protocol: String,
    pub handler: Arc<dyn Handler>,
    accept: String,
}

impl std::fmt::Debug for Negotiated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiated")
            .field("protocol", &self.protocol)
            .field("accept", &self.accept)
            .finish_non_exhaustive()
    }
}

impl Negotiated {
    /// The computed `Sec-WebSocket-Accept` value.
    pub fn accept(&self) -> &str {
        &self.accept
    }

    /// Builds the upgrade response.
    ///
    /// `Sec-WebSocket-Protocol` is echoed back only for a non-empty subprotocol.
    pub fn response(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);

        buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
        buf.put_slice(b"Upgrade: websocket\r\n");
        buf.put_slice(b"Connection: Upgrade\r\n");
        buf.put_slice(b"Sec-WebSocket-Version: 13\r\n");
        buf.put_slice(b"Sec-WebSocket-Accept: ");
        buf.put_slice(self.accept.as_bytes());

        if !self.protocol.is_empty() {
            buf.put_slice(b"\r\nSec-WebSocket-Protocol: ");
            buf.put_slice(self.protocol.as_bytes());
        }

        buf.put_slice(b"\r\n\r\n");
        buf.freeze()
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Validates an upgrade request and selects the handler for its subprotocol.
///
/// Checks run in order: `Upgrade` must be exactly `websocket`, a handler must be
/// registered for `Sec-WebSocket-Protocol` (empty when absent), `Sec-WebSocket-Key`
/// must be present and `Sec-WebSocket-Version` must be `13`.
pub fn negotiate<B>(
    request: &Request<B>,
    handlers: &HashMap<String, Arc<dyn Handler>>,
) -> Result<Negotiated, HandshakeError> {
    let headers = request.headers();

    if header_str(headers, header::UPGRADE) != Some("websocket") {
        return Err(HandshakeError::NotWebSocket);
    }

    let protocol = header_str(headers, header::SEC_WEBSOCKET_PROTOCOL).unwrap_or_default();
    let handler = handlers
        .get(protocol)
        .cloned()
        .ok_or_else(|| HandshakeError::UnsupportedSubprotocol(protocol.to_owned()))?;

    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or(HandshakeError::MissingSecWebSocketKey)?;

    if headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .map(|v| v.as_bytes())
        != Some(b"13")
    {
        return Err(HandshakeError::InvalidSecWebSocketVersion);
    }

    log::debug!(
        "negotiated subprotocol {:?} for key {:?}",
        protocol,
        String::from_utf8_lossy(key.as_bytes())
    );

    Ok(Negotiated {
        protocol: protocol.to_owned(),
        handler,
        accept: accept_key(key.as_bytes()),
    })
}
