//! A WebSocket echo server implementation using yawc-server.
//! Clients that request no subprotocol get their messages echoed back; clients that
//! request `reverse` get every message back reversed. Ctrl-C stops the server gracefully.

use futures::StreamExt;
use yawc_server::{Inbound, Options, Outbound, Server, WebSocketError};

/// Echoes every message back to the client.
async fn echo(mut inbound: Inbound, outbound: Outbound) -> yawc_server::Result<()> {
    while let Some(message) = inbound.next().await {
        outbound.send(message).await?;
    }

    log::debug!("Client disconnected");

    Ok(())
}

/// Sends every message back with its bytes reversed.
async fn reverse(mut inbound: Inbound, outbound: Outbound) -> Result<(), WebSocketError> {
    while let Some(message) = inbound.recv().await {
        let mut reversed = message.to_vec();
        reversed.reverse();
        outbound.send(reversed).await?;
    }
    Ok(())
}

/// Main entry point for the WebSocket server.
///
/// Initializes logging and starts listening for WebSocket connections on port 8080.
#[tokio::main]
async fn main() -> yawc_server::Result<()> {
    // Initialize logging
    simple_logger::init_with_level(log::Level::Debug).expect("log");

    let server = Server::with_options(Options::default().with_max_payload_read(16 * 1024 * 1024));
    server.register_handler("", echo);
    server.register_handler("reverse", reverse);

    let addr = server.listen("0.0.0.0:8080".parse().expect("address"))?;
    log::debug!("Listening on {}", addr);

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    server.stop().await;

    Ok(())
}
