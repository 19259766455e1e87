// Inbound peer websocket endpoint.
//
// Peers reach this node at `/api/nodes/ws`. Each accepted socket gets one
// task: it forwards outbound frames queued by handlers and feeds inbound
// frames into the connection manager's queue. A connect before the manager
// has started is turned away with close code 1013 so the caller knows to
// retry.

use crate::cluster::connection::{IncomingChannel, PeerChannel, PeerKind};
use crate::cluster::message::Message;
use crate::cluster::Core;
use axum::extract::ws::{CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

pub async fn node_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(core): State<Arc<Core>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, addr, core))
}

async fn handle_socket(mut socket: WebSocket, addr: SocketAddr, core: Arc<Core>) {
    let connections = core.connections();
    if !connections.is_started() {
        debug!(%addr, "peer connected before the connection manager started");
        let _ = socket
            .send(WsMessage::Close(Some(CloseFrame {
                code: CLOSE_TRY_AGAIN_LATER,
                reason: Utf8Bytes::from_static("try again later"),
            })))
            .await;
        return;
    }

    let endpoint = format!("{}:{}", addr.ip(), addr.port());
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<String>();
    let channel = IncomingChannel::new(frame_tx);
    let peer = match connections
        .register(
            &endpoint,
            PeerChannel::Incoming(channel.clone()),
            PeerKind::Passive,
        )
        .await
    {
        Ok(peer) => peer,
        Err(err) => {
            warn!(endpoint = %endpoint, error = %err, "could not register peer");
            return;
        }
    };
    debug!(endpoint = %endpoint, "peer connected");

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            outbound = frame_rx.recv() => match outbound {
                Some(text) => {
                    if sink.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    // a handler told this peer to go away
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => match Message::decode(text.as_str()) {
                    Ok(msg) => {
                        if connections.enqueue_incoming(Arc::clone(&peer), msg).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(endpoint = %endpoint, error = %err, "malformed frame; dropping peer");
                        break;
                    }
                },
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(endpoint = %endpoint, error = %err, "socket error");
                    break;
                }
            }
        }
    }

    channel.disconnect();
    connections.remove(&endpoint).await;
    debug!(endpoint = %endpoint, "peer disconnected");
}
