//! One accepted client, from the opening handshake to the close sequence.
//!
//! A connection runs two loops side by side:
//!
//! - the read loop performs the handshake, then runs the handler together with a
//!   decode loop that feeds socket input to the frame decoder and pushes data
//!   payloads into the inbound queue;
//! - the write loop pops payloads from the outbound queue and writes each one as a
//!   binary frame.
//!
//! Both stop once the connection is `done`, which is set by [`Shared::close`].
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt, SinkExt};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tokio_util::{codec::FramedWrite, sync::CancellationToken};

use crate::{
    codec::{ConnectionState, Decoder, Encoder},
    frame::{Frame, OpCode},
    handler::{Handler, Inbound, Outbound},
    handshake::{self, RequestDecoder},
    registry::{Registration, Registry},
    stream::InputStream,
    Options, Result, WebSocketError,
};

pub(crate) type Handlers = Arc<RwLock<HashMap<String, Arc<dyn Handler>>>>;
pub(crate) type Connections = Arc<Mutex<Registry<Arc<dyn Control>>>>;

/// What the server needs from a live connection to shut it down.
pub(crate) trait Control: Send + Sync {
    /// Runs the close sequence, see [`Shared::close`].
    fn close(&self, send_close: bool) -> BoxFuture<'_, Result<()>>;
}

/// State shared by the two loops of a connection and the server.
pub(crate) struct Shared<W> {
    /// `None` once the write direction is shut down.
    writer: tokio::sync::Mutex<Option<FramedWrite<W, Encoder>>>,
    done: CancellationToken,
    /// Makes the read side see EOF.
    input_shutdown: CancellationToken,
}

impl<W> Shared<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn new(io: W, input_shutdown: CancellationToken) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(Some(FramedWrite::new(io, Encoder))),
            done: CancellationToken::new(),
            input_shutdown,
        }
    }

    fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Writes one frame. A write still pending when the connection is `done` is
    /// abandoned, releasing the writer.
    async fn write_frame(&self, frame: Frame) -> Result<()> {
        let send = async {
            let mut writer = self.writer.lock().await;
            let writer = writer.as_mut().ok_or(WebSocketError::ConnectionClosed)?;
            writer.send(frame).await
        };

        tokio::select! {
            biased;
            _ = self.done.cancelled() => Err(WebSocketError::ConnectionClosed),
            res = send => res,
        }
    }

    /// Writes bytes that are not a frame, bypassing the encoder.
    async fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        let write = async {
            let mut writer = self.writer.lock().await;
            let writer = writer.as_mut().ok_or(WebSocketError::ConnectionClosed)?;
            let io = writer.get_mut();
            io.write_all(bytes).await?;
            io.flush().await?;
            Ok(())
        };

        tokio::select! {
            biased;
            _ = self.done.cancelled() => Err(WebSocketError::ConnectionClosed),
            _ = self.input_shutdown.cancelled() => Err(WebSocketError::ConnectionClosed),
            res = write => res,
        }
    }

    /// Shuts down the write direction of the socket.
    ///
    /// Only called once `done` is set, so no write holds the writer any more.
    /// Bytes the encoder still buffers for an abandoned write are dropped.
    async fn shutdown_output(&self) -> Result<()> {
        let writer = self.writer.lock().await.take();
        if let Some(writer) = writer {
            writer.into_inner().shutdown().await?;
        }
        Ok(())
    }

    /// Closes the connection.
    ///
    /// With `send_close` a close frame is written first, answering a close frame
    /// received from the peer. Then both loops are told to stop, which closes the
    /// inbound and outbound queues, and the write direction of the socket is shut
    /// down. Closing twice is a no-op.
    ///
    /// Once input is shut down a close frame the peer does not drain is given up.
    pub async fn close(&self, send_close: bool) -> Result<()> {
        let sent = if send_close && !self.is_done() {
            tokio::select! {
                biased;
                res = self.write_frame(Frame::close()) => res,
                _ = self.input_shutdown.cancelled() => Err(WebSocketError::ConnectionClosed),
            }
        } else {
            Ok(())
        };

        self.done.cancel();
        self.shutdown_output().await?;
        sent
    }
}

impl<W> Control for Shared<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn close(&self, send_close: bool) -> BoxFuture<'_, Result<()>> {
        Shared::close(self, send_close).boxed()
    }
}

pub(crate) struct Connection<R, W> {
    input: InputStream<R>,
    shared: Arc<Shared<W>>,
    handlers: Handlers,
    options: Options,
    registration: Registration<Arc<dyn Control>>,
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Creates a connection and adds it to `connections` until it is dropped.
    ///
    /// Cancelling `input_shutdown` makes the connection see EOF on its socket.
    pub fn new(
        reader: R,
        writer: W,
        input_shutdown: CancellationToken,
        handlers: Handlers,
        connections: &Connections,
        options: Options,
    ) -> Self {
        let input = InputStream::new(
            reader,
            input_shutdown.clone(),
            options.read_buffer_size.max(1),
        );
        let shared = Arc::new(Shared::new(writer, input_shutdown));
        let control: Arc<dyn Control> = shared.clone();
        let registration = Registration::register(connections, control);

        Self {
            input,
            shared,
            handlers,
            options,
            registration,
        }
    }

    /// Serves the connection until both loops are finished.
    ///
    /// Failures are logged, never returned.
    pub async fn process(self) {
        let Connection {
            mut input,
            shared,
            handlers,
            options,
            registration,
        } = self;
        let key = registration.key();
        let shared = &*shared;

        let (out_tx, out_rx) = mpsc::channel(options.queue_capacity.max(1));
        let (read, write) = tokio::join!(
            read_loop(&mut input, shared, &handlers, &options, out_tx),
            write_loop(shared, out_rx),
        );

        if let Err(err) = read {
            log::debug!("connection {}: read loop failed: {}", key, err);
        }
        if let Err(err) = write {
            log::debug!("connection {}: write loop failed: {}", key, err);
        }
        log::debug!("connection {} finished", key);
    }
}

async fn read_loop<R, W>(
    input: &mut InputStream<R>,
    shared: &Shared<W>,
    handlers: &Handlers,
    options: &Options,
    out_tx: mpsc::Sender<Bytes>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    let res = serve(input, shared, handlers, options, out_tx).await;
    if !shared.is_done() {
        shared.close(false).await?;
    }
    res
}

async fn serve<R, W>(
    input: &mut InputStream<R>,
    shared: &Shared<W>,
    handlers: &Handlers,
    options: &Options,
    out_tx: mpsc::Sender<Bytes>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    let Some(request) = input.decode_with(&mut RequestDecoder).await? else {
        log::debug!("peer left before completing the handshake");
        return Ok(());
    };

    let negotiated = {
        let handlers = handlers.read().unwrap_or_else(PoisonError::into_inner);
        handshake::negotiate(&request, &handlers)?
    };
    shared.write_raw(&negotiated.response()).await?;

    let (in_tx, in_rx) = mpsc::channel(options.queue_capacity.max(1));
    let handler = async {
        let res = negotiated
            .handler
            .handle(Inbound::new(in_rx), Outbound::new(out_tx))
            .await;
        if res.is_err() {
            shared.input_shutdown.cancel();
        }
        res.map_err(WebSocketError::Handler)
    };

    let (handled, decoded) = tokio::join!(
        handler,
        decode_loop(input, shared, in_tx, options.max_payload_read)
    );
    handled?;
    decoded
}

async fn decode_loop<R, W>(
    input: &mut InputStream<R>,
    shared: &Shared<W>,
    in_tx: mpsc::Sender<Bytes>,
    max_payload_read: usize,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    let mut decoder = Decoder::new(max_payload_read);

    while !shared.is_done() {
        tokio::select! {
            biased;
            _ = shared.done.cancelled() => break,
            res = input.consume(&mut decoder) => res?,
        }

        match decoder.connection_state() {
            ConnectionState::Connected => {}
            ConnectionState::Closed => {
                log::debug!("peer closed the socket");
                return shared.close(false).await;
            }
            ConnectionState::Error => {
                shared.close(false).await?;
                return match decoder.violation() {
                    Some(violation) => Err(violation.into()),
                    None => Ok(()),
                };
            }
        }

        let payload = decoder.take_result().freeze();
        match decoder.opcode() {
            Some(OpCode::Continuation | OpCode::Text | OpCode::Binary) => {
                let pushed = tokio::select! {
                    biased;
                    _ = shared.done.cancelled() => break,
                    _ = shared.input_shutdown.cancelled() => return shared.close(false).await,
                    res = in_tx.send(payload) => res,
                };
                if pushed.is_err() {
                    // a failed handler has already shut input down: no close frame then
                    let send_close = !shared.input_shutdown.is_cancelled();
                    log::debug!("handler stopped reading, closing");
                    shared.close(send_close).await?;
                }
            }
            Some(OpCode::Close) => {
                log::debug!("received close frame");
                shared.close(true).await?;
            }
            Some(OpCode::Ping) => {
                log::debug!("received ping frame, {} bytes", payload.len());
                tokio::select! {
                    biased;
                    res = shared.write_frame(Frame::pong(payload)) => res?,
                    _ = shared.input_shutdown.cancelled() => return shared.close(false).await,
                }
            }
            Some(OpCode::Pong) => {
                log::debug!("received pong frame, {} bytes", payload.len());
            }
            None => {}
        }
    }

    Ok(())
}

async fn write_loop<W>(shared: &Shared<W>, mut rx: mpsc::Receiver<Bytes>) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let res = loop {
        let payload = tokio::select! {
            biased;
            _ = shared.done.cancelled() => break Ok(()),
            payload = rx.recv() => payload,
        };

        match payload {
            Some(payload) => match shared.write_frame(Frame::binary(payload)).await {
                Ok(()) => {}
                Err(_) if shared.is_done() => break Ok(()),
                Err(err) => {
                    shared.done.cancel();
                    break Err(err);
                }
            },
            // every sender is gone: nothing more to write until the connection closes
            None => {
                shared.done.cancelled().await;
                break Ok(());
            }
        }
    };

    rx.close();
    shared.shutdown_output().await?;
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::tests::client_frame, handler::BoxError};
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};

    const REQUEST: &[u8] = b"GET / HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    const RESPONSE: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Version: 13\r\n\
        Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";

    fn echo_handlers() -> Handlers {
        let echo: Arc<dyn Handler> =
            Arc::new(|mut inbound: Inbound, outbound: Outbound| async move {
                while let Some(message) = inbound.next().await {
                    outbound.send(message).await?;
                }
                Ok::<_, WebSocketError>(())
            });
        Arc::new(RwLock::new(HashMap::from([(String::new(), echo)])))
    }

    /// Starts a connection over in-memory pipes. Returns the client ends.
    fn start(
        handlers: Handlers,
        connections: &Connections,
    ) -> (DuplexStream, DuplexStream, tokio::task::JoinHandle<()>) {
        start_with(
            handlers,
            connections,
            Options::default(),
            CancellationToken::new(),
            64 * 1024,
        )
    }

    fn start_with(
        handlers: Handlers,
        connections: &Connections,
        options: Options,
        input_shutdown: CancellationToken,
        pipe_size: usize,
    ) -> (DuplexStream, DuplexStream, tokio::task::JoinHandle<()>) {
        let (client_w, server_r) = tokio::io::duplex(pipe_size);
        let (server_w, client_r) = tokio::io::duplex(pipe_size);

        let connection = Connection::new(
            server_r,
            server_w,
            input_shutdown,
            handlers,
            connections,
            options,
        );
        (client_w, client_r, tokio::spawn(connection.process()))
    }

    async fn read_to_end(mut io: DuplexStream) -> Vec<u8> {
        let mut out = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), io.read_to_end(&mut out))
            .await
            .expect("server did not close the connection")
            .unwrap();
        out
    }

    #[tokio::test]
    async fn test_echo_then_close() {
        let connections = Connections::default();
        let (mut client_w, client_r, task) = start(echo_handlers(), &connections);
        assert_eq!(connections.lock().unwrap().len(), 1);

        client_w.write_all(REQUEST).await.unwrap();
        client_w
            .write_all(&client_frame(0x82, b"hello", [1, 2, 3, 4]))
            .await
            .unwrap();
        client_w
            .write_all(&client_frame(0x81, b"world", [5, 6, 7, 8]))
            .await
            .unwrap();

        // give the echo a chance to be written before the close frame is answered
        tokio::time::sleep(Duration::from_millis(50)).await;
        client_w
            .write_all(&client_frame(0x88, b"", [0; 4]))
            .await
            .unwrap();

        let out = read_to_end(client_r).await;
        let mut expected = RESPONSE.to_vec();
        expected.extend_from_slice(b"\x82\x05hello");
        expected.extend_from_slice(b"\x82\x05world");
        expected.extend_from_slice(b"\x88\x00");
        assert_eq!(out, expected);

        task.await.unwrap();
        assert_eq!(connections.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let connections = Connections::default();
        let (mut client_w, client_r, task) = start(echo_handlers(), &connections);

        client_w.write_all(REQUEST).await.unwrap();
        client_w
            .write_all(&client_frame(0x89, b"hb", [9, 9, 9, 9]))
            .await
            .unwrap();
        client_w
            .write_all(&client_frame(0x88, b"", [0; 4]))
            .await
            .unwrap();

        let out = read_to_end(client_r).await;
        assert_eq!(&out[RESPONSE.len()..], b"\x8a\x02hb\x88\x00");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_handshake_writes_nothing() {
        let connections = Connections::default();
        let (mut client_w, client_r, task) = start(echo_handlers(), &connections);

        client_w
            .write_all(
                b"GET / HTTP/1.1\r\n\
                  Upgrade: websocket\r\n\
                  Sec-WebSocket-Protocol: unknown\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\r\n",
            )
            .await
            .unwrap();

        assert!(read_to_end(client_r).await.is_empty());
        task.await.unwrap();
        assert_eq!(connections.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_eof_during_handshake() {
        let connections = Connections::default();
        let (mut client_w, client_r, task) = start(echo_handlers(), &connections);

        client_w.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        drop(client_w);

        assert!(read_to_end(client_r).await.is_empty());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_protocol_error_closes_without_close_frame() {
        let connections = Connections::default();
        let (mut client_w, client_r, task) = start(echo_handlers(), &connections);

        client_w.write_all(REQUEST).await.unwrap();
        // unmasked binary frame
        client_w.write_all(b"\x82\x03abc").await.unwrap();

        let out = read_to_end(client_r).await;
        assert_eq!(out, RESPONSE);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_failure_tears_down() {
        let failing: Arc<dyn Handler> = Arc::new(|_: Inbound, _: Outbound| async {
            Err::<(), BoxError>("handler gave up".into())
        });
        let handlers = Arc::new(RwLock::new(HashMap::from([(String::new(), failing)])));

        let connections = Connections::default();
        let (mut client_w, client_r, task) = start(handlers, &connections);
        client_w.write_all(REQUEST).await.unwrap();

        // the client never closes, the handler error alone ends the connection
        let out = read_to_end(client_r).await;
        assert_eq!(out, RESPONSE);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        drop(client_w);
    }

    #[tokio::test]
    async fn test_finished_handler_then_data_closes() {
        let done: Arc<dyn Handler> =
            Arc::new(|_: Inbound, _: Outbound| async { Ok::<_, BoxError>(()) });
        let handlers = Arc::new(RwLock::new(HashMap::from([(String::new(), done)])));

        let connections = Connections::default();
        let (mut client_w, client_r, task) = start(handlers, &connections);
        client_w.write_all(REQUEST).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client_w
            .write_all(&client_frame(0x82, b"ignored", [3; 4]))
            .await
            .unwrap();

        let out = read_to_end(client_r).await;
        assert_eq!(&out[RESPONSE.len()..], b"\x88\x00");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_from_control() {
        let connections = Connections::default();
        let (mut client_w, client_r, task) = start(echo_handlers(), &connections);
        client_w.write_all(REQUEST).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let live: Vec<Arc<dyn Control>> = connections
            .lock()
            .unwrap()
            .iter()
            .map(|(_, control)| Arc::clone(control))
            .collect();
        assert_eq!(live.len(), 1);
        live[0].close(true).await.unwrap();
        // a second close is a no-op
        live[0].close(true).await.unwrap();

        let out = read_to_end(client_r).await;
        assert_eq!(&out[RESPONSE.len()..], b"\x88\x00");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_failure_with_buffered_frame() {
        let failing: Arc<dyn Handler> = Arc::new(|_: Inbound, _: Outbound| async {
            Err::<(), BoxError>("handler gave up".into())
        });
        let handlers = Arc::new(RwLock::new(HashMap::from([(String::new(), failing)])));

        let connections = Connections::default();
        let (mut client_w, client_r, task) = start(handlers, &connections);

        // the data frame arrives with the request, before the handler fails
        let mut bytes = REQUEST.to_vec();
        bytes.extend_from_slice(&client_frame(0x82, b"pending", [7; 4]));
        client_w.write_all(&bytes).await.unwrap();

        let out = read_to_end(client_r).await;
        assert_eq!(out, RESPONSE);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_input_shutdown_with_write_stuck() {
        let flood: Arc<dyn Handler> = Arc::new(|_: Inbound, outbound: Outbound| async move {
            loop {
                if let Err(err) = outbound.send(vec![0x55u8; 16 * 1024]).await {
                    return Err::<(), _>(err);
                }
            }
        });
        let handlers = Arc::new(RwLock::new(HashMap::from([(String::new(), flood)])));

        let connections = Connections::default();
        let input_shutdown = CancellationToken::new();
        let (mut client_w, client_r, task) = start_with(
            handlers,
            &connections,
            Options::default().with_queue_capacity(2),
            input_shutdown.clone(),
            4096,
        );
        client_w.write_all(REQUEST).await.unwrap();

        // the client never reads, so the writer ends up blocked on a full pipe
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!task.is_finished());

        input_shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("connection did not finish with its writer stuck")
            .unwrap();
        assert_eq!(connections.lock().unwrap().len(), 0);
        drop(client_r);
    }

    #[tokio::test]
    async fn test_full_inbound_queue_stops_reading() {
        let release = Arc::new(tokio::sync::Notify::new());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        let slow: Arc<dyn Handler> = Arc::new({
            let release = Arc::clone(&release);
            move |mut inbound: Inbound, _: Outbound| {
                let release = Arc::clone(&release);
                let seen_tx = seen_tx.clone();
                async move {
                    release.notified().await;
                    while let Some(message) = inbound.recv().await {
                        seen_tx.send(message).ok();
                    }
                    Ok::<_, WebSocketError>(())
                }
            }
        });
        let handlers = Arc::new(RwLock::new(HashMap::from([(String::new(), slow)])));

        let connections = Connections::default();
        let (mut client_w, client_r, task) = start_with(
            handlers,
            &connections,
            Options::default().with_queue_capacity(1),
            CancellationToken::new(),
            4096,
        );
        client_w.write_all(REQUEST).await.unwrap();

        let frames: Vec<Vec<u8>> = (0..64u8).map(|i| vec![i; 1024]).collect();
        let writer = tokio::spawn({
            let frames = frames.clone();
            async move {
                for (i, payload) in frames.iter().enumerate() {
                    let key = [i as u8, 1, 2, 3];
                    client_w
                        .write_all(&client_frame(0x82, payload, key))
                        .await
                        .unwrap();
                }
                client_w
            }
        });

        // one queued payload plus what the pipe and read buffer hold, far below 64 KiB
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!writer.is_finished(), "server kept reading with a full queue");

        release.notify_one();
        let mut client_w = tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .expect("writes did not resume once the handler read")
            .unwrap();
        client_w
            .write_all(&client_frame(0x88, b"", [0; 4]))
            .await
            .unwrap();

        let out = read_to_end(client_r).await;
        assert_eq!(&out[RESPONSE.len()..], b"\x88\x00");
        task.await.unwrap();

        let mut seen = Vec::new();
        while let Ok(message) = seen_rx.try_recv() {
            seen.push(message.to_vec());
        }
        assert_eq!(seen, frames);
    }
}
