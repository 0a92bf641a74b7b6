//! WebSocket transport
//!
//! Minimal WebSocket server that feeds decoded frames to the broker.
//! Responsibilities:
//! - Accept TCP/WebSocket connections
//! - Create a `Client` for each connection, register it with the `Broker`
//!   and send it the accepted frame carrying its id
//! - Run one writer task per client draining its channel into the socket
//! - Decode incoming frames and hand them to `dispatch::handle_frame`
//! - Clean the client up exactly once, whichever side closes first

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::message::{Message, content_types};
use crate::broker::{Broker, codec};
use crate::client::Client;
use crate::transport::Connection;
use crate::transport::dispatch::{FrameAction, handle_frame};
use crate::utils::error::TransportError;

pub async fn start_websocket_server(addr: &str, broker: Arc<Broker>) -> Result<(), TransportError> {
    let listener = TcpListener::bind(addr).await?;
    info!("WebSocket server listening on ws://{addr}");
    serve(listener, broker).await;
    Ok(())
}

/// Accept loop over an already bound listener.
pub async fn serve(listener: TcpListener, broker: Arc<Broker>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "tcp connection accepted");
                let broker = broker.clone();
                spawn(handle_connection(stream, broker));
            }
            Err(e) => {
                warn!("Failed to accept connection: {e}");
                break;
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, broker: Arc<Broker>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake error: {e}");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let client = Arc::new(Client::new(tx));
    let client_id = client.id.clone();
    broker.register_client(client.clone());

    let cleanup_called = Arc::new(AtomicBool::new(false));

    let do_cleanup = {
        let broker = broker.clone();
        let client = client.clone();
        let cleanup_called = cleanup_called.clone();

        move || {
            if !cleanup_called.swap(true, Ordering::SeqCst) {
                client.close();
                broker.cleanup_client(&client.id);
            }
        }
    };

    {
        let client_id = client_id.clone();
        let do_cleanup = do_cleanup.clone();

        spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = msg.is_close();
                if let Err(e) = ws_sender.send(msg).await {
                    debug!("Failed to send message to {client_id}: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }

            do_cleanup();
            debug!("Send loop closed for {client_id}");
        });
    }

    let accepted = Message::server(content_types::ACCEPTED, client_id.clone());
    if let Err(e) = codec::encode(&accepted)
        .map_err(TransportError::from)
        .and_then(|frame| client.send(frame))
    {
        broker
            .errors()
            .report("ACCEPT", &format!("client={client_id}"), &e);
    }
    info!("{client_id} connected");

    while let Some(frame) = ws_receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Read error from {client_id}: {e}");
                break;
            }
        };
        if frame.is_close() {
            break;
        }
        if !frame.is_binary() && !frame.is_text() {
            continue;
        }

        let message = match codec::decode(&frame.into_data()) {
            Ok(message) => message,
            Err(e) => {
                warn!("Invalid frame from {client_id}: {e}");
                continue;
            }
        };
        if handle_frame(&broker, &client, message) == FrameAction::Disconnect {
            break;
        }
    }

    do_cleanup();
    info!("{client_id} disconnected");
}
