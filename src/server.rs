//! # Server
//!
//! Accepts TCP connections and serves each one with the [`Handler`] registered for
//! the subprotocol it negotiates.
//!
//! Every accept loop and every connection task runs under an admission gate.
//! [`Server::stop`] closes that gate and waits for all admitted tasks, which is
//! what makes shutdown complete only after every connection is gone.
use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use futures::future::join_all;
use tokio::net::{TcpListener, TcpSocket};
use tokio_util::sync::CancellationToken;

use crate::{
    connection::{Connection, Connections, Control, Handlers},
    gate::{Gate, GateGuard},
    handler::Handler,
    registry::Registry,
    ListenOptions, Options, Result,
};

/// A WebSocket server.
///
/// `Server` is a cheap handle: clones share the same handlers, listeners and
/// connections.
///
/// # Example
/// ```rust,no_run
/// use yawc_server::{Inbound, Outbound, Server};
///
/// # async fn run() -> yawc_server::Result<()> {
/// let server = Server::new();
/// server.register_handler("chat", |mut inbound: Inbound, outbound: Outbound| async move {
///     while let Some(message) = inbound.recv().await {
///         outbound.send(message).await?;
///     }
///     Ok::<_, yawc_server::WebSocketError>(())
/// });
///
/// server.listen("0.0.0.0:8080".parse().unwrap())?;
/// // ...
/// server.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerState>,
}

struct ServerState {
    options: Options,
    handlers: Handlers,
    connections: Connections,
    gate: Arc<Gate>,
    /// Parent of every connection's input shutdown token.
    input_shutdown: CancellationToken,
    /// One abort token per listener.
    listeners: Mutex<Vec<CancellationToken>>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// Creates a server with default [`Options`].
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> Self {
        Self {
            inner: Arc::new(ServerState {
                options,
                handlers: Arc::new(RwLock::new(HashMap::new())),
                connections: Arc::new(Mutex::new(Registry::new())),
                gate: Gate::new(),
                input_shutdown: CancellationToken::new(),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Registers `handler` for the subprotocol `name`, replacing any previous one.
    ///
    /// `""` registers the handler used by clients that do not request a subprotocol.
    /// Handlers are looked up during each handshake, so they should be registered
    /// before [`listen`](Self::listen).
    pub fn register_handler<H>(&self, name: impl Into<String>, handler: H)
    where
        H: Handler,
    {
        let name = name.into();
        log::debug!("registering handler for subprotocol {:?}", name);
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(handler));
    }

    /// Returns `true` if a handler is registered for the subprotocol `name`.
    pub fn is_handler_registered(&self, name: &str) -> bool {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Number of connections currently alive.
    pub fn connection_count(&self) -> usize {
        self.inner
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Listens on `addr` with default [`ListenOptions`] and returns the bound address.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        self.listen_with_options(addr, ListenOptions::default())
    }

    /// Listens on `addr` and returns the bound address.
    ///
    /// Each call starts one more accept loop. Fails once the server is stopped.
    pub fn listen_with_options(
        &self,
        addr: SocketAddr,
        options: ListenOptions,
    ) -> Result<SocketAddr> {
        let guard = self
            .inner
            .gate
            .enter()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "server is stopped"))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(options.reuse_address)?;
        socket.bind(addr)?;
        let listener = socket.listen(options.backlog)?;
        let local_addr = listener.local_addr()?;

        let abort = CancellationToken::new();
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(abort.clone());

        log::info!("listening on {}", local_addr);
        tokio::spawn(accept_loop(
            Arc::clone(&self.inner),
            listener,
            abort,
            guard,
        ));

        Ok(local_addr)
    }

    /// Stops the server.
    ///
    /// Pending accepts are aborted and every live connection stops reading, so
    /// handlers see the end of their inbound stream. Then the call waits for every
    /// accept loop and connection task to finish, refusing new ones meanwhile, and
    /// finally closes whatever connection is still registered. Errors from those
    /// last closes are ignored.
    pub async fn stop(&self) {
        let listeners = std::mem::take(
            &mut *self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for abort in listeners {
            abort.cancel();
        }

        self.inner.input_shutdown.cancel();

        self.inner.gate.close().await;

        let remaining = self.inner.live_connections();
        if !remaining.is_empty() {
            log::debug!("closing {} remaining connections", remaining.len());
            let results = join_all(remaining.iter().map(|control| control.close(true))).await;
            for err in results.into_iter().filter_map(|res| res.err()) {
                log::debug!("closing connection failed: {}", err);
            }
        }

        log::info!("server stopped");
    }
}

impl ServerState {
    fn live_connections(&self) -> Vec<Arc<dyn Control>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, control)| Arc::clone(control))
            .collect()
    }
}

async fn accept_loop(
    state: Arc<ServerState>,
    listener: TcpListener,
    abort: CancellationToken,
    _guard: GateGuard,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = abort.cancelled() => Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
            res = listener.accept() => res,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(err) if err.kind() == io::ErrorKind::ConnectionAborted && abort.is_cancelled() => {
                break;
            }
            Err(err) => {
                log::error!("accept failed: {}", err);
                break;
            }
        };

        // a connection racing with stop is dropped
        let Ok(guard) = state.gate.enter() else {
            continue;
        };

        if state.options.no_delay {
            if let Err(err) = stream.set_nodelay(true) {
                log::debug!("set_nodelay failed for {}: {}", peer, err);
            }
        }

        let (reader, writer) = stream.into_split();
        let connection = Connection::new(
            reader,
            writer,
            state.input_shutdown.child_token(),
            Arc::clone(&state.handlers),
            &state.connections,
            state.options.clone(),
        );

        log::debug!("accepted connection from {}", peer);
        tokio::spawn(async move {
            connection.process().await;
            drop(guard);
        });
    }

    if let Ok(addr) = listener.local_addr() {
        log::info!("stopped listening on {}", addr);
    }
}
