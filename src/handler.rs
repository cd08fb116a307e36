//! Application side of a connection.
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt, Stream};
use tokio::sync::mpsc;

use crate::{Result, WebSocketError};

/// Boxed error returned by handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Serves the connections that negotiated one subprotocol.
///
/// `handle` runs once per connection, concurrently with the frame decoding of that
/// connection. Returning ends the handler's part only: the connection stays open
/// until the peer closes it. Returning an error stops reading from the socket and
/// tears the connection down.
///
/// Any `Fn(Inbound, Outbound) -> impl Future<Output = Result<(), E>>` is a handler.
pub trait Handler: Send + Sync + 'static {
    fn handle(
        &self,
        inbound: Inbound,
        outbound: Outbound,
    ) -> BoxFuture<'static, std::result::Result<(), BoxError>>;
}

impl<F, Fut, E> Handler for F
where
    F: Fn(Inbound, Outbound) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: Into<BoxError>,
{
    fn handle(
        &self,
        inbound: Inbound,
        outbound: Outbound,
    ) -> BoxFuture<'static, std::result::Result<(), BoxError>> {
        self(inbound, outbound).map(|res| res.map_err(Into::into)).boxed()
    }
}

/// Payloads of the data frames received on a connection, in arrival order.
///
/// The stream ends once the connection stops reading: after a close frame, a protocol
/// error, EOF or server shutdown.
#[derive(Debug)]
pub struct Inbound {
    rx: mpsc::Receiver<Bytes>,
}

impl Inbound {
    pub(crate) fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx }
    }

    /// Waits for the next payload. Returns `None` once the connection stopped reading.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Stream for Inbound {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Sends payloads to the peer, each as one binary frame.
///
/// Payloads are queued and written in the order they were sent. Sending waits while
/// the queue is full.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Bytes>,
}

impl Outbound {
    pub(crate) fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }

    /// Queues `payload` for writing.
    ///
    /// Fails with [`WebSocketError::ConnectionClosed`] once the connection is closed.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.tx
            .send(payload.into())
            .await
            .map_err(|_| WebSocketError::ConnectionClosed)
    }

    /// Returns `true` once the connection stopped writing.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_closure_handler() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);

        let handler = |mut inbound: Inbound, outbound: Outbound| async move {
            while let Some(message) = inbound.next().await {
                outbound.send(message).await?;
            }
            Ok::<_, WebSocketError>(())
        };

        in_tx.send(Bytes::from_static(b"one")).await.unwrap();
        in_tx.send(Bytes::from_static(b"two")).await.unwrap();
        drop(in_tx);

        handler
            .handle(Inbound::new(in_rx), Outbound::new(out_tx))
            .await
            .unwrap();

        assert_eq!(out_rx.recv().await.unwrap(), "one");
        assert_eq!(out_rx.recv().await.unwrap(), "two");
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_handler_error_is_boxed() {
        let (_in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, _out_rx) = mpsc::channel(1);

        let handler = |_: Inbound, _: Outbound| async {
            Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
        };
        let err = handler
            .handle(Inbound::new(in_rx), Outbound::new(out_tx))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_send_after_close() {
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let outbound = Outbound::new(out_tx);
        out_rx.close();

        assert!(outbound.is_closed());
        assert!(matches!(
            outbound.send(&b"late"[..]).await,
            Err(WebSocketError::ConnectionClosed)
        ));
    }
}
