//! Buffered consumer over the read half of a socket.
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::{codec, sync::CancellationToken};

use crate::{
    codec::{Consumption, Decoder},
    Result,
};

/// Read side of a connection.
///
/// Bytes read from `io` are handed out in chunks of whatever size the socket
/// produced. Unconsumed bytes are kept and handed out again first, so nothing
/// read ahead of the handshake or of a frame boundary is lost.
///
/// Cancelling `shutdown` behaves like the peer half-closing the connection: any
/// pending or future read reports EOF.
pub(crate) struct InputStream<R> {
    io: R,
    buf: BytesMut,
    shutdown: CancellationToken,
    eof: bool,
    read_buffer_size: usize,
}

impl<R> InputStream<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(io: R, shutdown: CancellationToken, read_buffer_size: usize) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(read_buffer_size),
            shutdown,
            eof: false,
            read_buffer_size,
        }
    }

    /// Returns the next chunk of input, empty on EOF.
    pub async fn next_chunk(&mut self) -> Result<BytesMut> {
        if !self.buf.is_empty() {
            return Ok(self.buf.split());
        }
        if self.eof {
            return Ok(BytesMut::new());
        }

        self.fill().await?;
        Ok(self.buf.split())
    }

    async fn fill(&mut self) -> std::io::Result<usize> {
        self.buf.reserve(self.read_buffer_size);

        let read = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => 0,
            res = self.io.read_buf(&mut self.buf) => res?,
        };

        if read == 0 {
            self.eof = true;
        }
        Ok(read)
    }

    /// Feeds input to `decoder` until it yields a frame or reaches a terminal state.
    ///
    /// Returns `Ok(())` in both cases: the caller inspects the decoder afterwards.
    pub async fn consume(&mut self, decoder: &mut Decoder) -> Result<()> {
        loop {
            let chunk = self.next_chunk().await?;
            match decoder.feed(chunk) {
                Consumption::Continue => {}
                Consumption::Stop(rest) => {
                    self.unread(rest);
                    return Ok(());
                }
            }
        }
    }

    /// Decodes one item with a [`tokio_util`] decoder, reading more as needed.
    ///
    /// Returns `None` when EOF arrives before a complete item.
    pub async fn decode_with<D>(
        &mut self,
        decoder: &mut D,
    ) -> std::result::Result<Option<D::Item>, D::Error>
    where
        D: codec::Decoder,
    {
        loop {
            if let Some(item) = decoder.decode(&mut self.buf)? {
                return Ok(Some(item));
            }
            if self.eof || self.fill().await? == 0 {
                return Ok(None);
            }
        }
    }

    /// Puts back bytes that were handed out but not consumed.
    fn unread(&mut self, mut rest: BytesMut) {
        if rest.is_empty() {
            return;
        }
        if !self.buf.is_empty() {
            rest.unsplit(self.buf.split());
        }
        self.buf = rest;
    }
}
