//! Device link endpoint
//!
//! The first frame of every connection must be `authenticate`. Anything else, bad
//! credentials or silence past the auth timeout gets an `auth_error` and the socket is closed
//! before any other traffic is exchanged.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, stream::StreamExt};
use tracing::{debug, info, warn};

use crate::{protocol::WireMessage, registry::state::RegistryState};

/// GET /ws
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<RegistryState>) -> Response {
    ws.on_upgrade(|socket| handle_device(socket, state))
}

enum Handshake {
    Accepted(String),
    Rejected {
        site_id: Option<String>,
        reason: &'static str,
    },
    Gone,
}

async fn handshake(socket: &mut WebSocket, state: &RegistryState) -> Handshake {
    let first = tokio::time::timeout(state.auth_timeout(), async {
        while let Some(Ok(msg)) = socket.recv().await {
            match msg {
                Message::Text(text) => return Some(text),
                Message::Close(_) => return None,
                _ => continue,
            }
        }
        None
    })
    .await;

    let text = match first {
        Err(_) => {
            return Handshake::Rejected {
                site_id: None,
                reason: "authentication timed out",
            };
        }
        Ok(None) => return Handshake::Gone,
        Ok(Some(text)) => text,
    };

    match WireMessage::decode(&text) {
        Ok(WireMessage::Authenticate { site_id, api_key }) => {
            if state.validate(&site_id, &api_key).await {
                Handshake::Accepted(site_id)
            } else {
                Handshake::Rejected {
                    site_id: Some(site_id),
                    reason: "invalid credentials",
                }
            }
        }
        Ok(_) | Err(_) => Handshake::Rejected {
            site_id: None,
            reason: "expected authenticate",
        },
    }
}

async fn send(socket: &mut WebSocket, message: &WireMessage) -> bool {
    match message.encode() {
        Ok(text) => socket.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            warn!("failed to encode {}: {e}", message.kind());
            false
        }
    }
}

async fn handle_device(mut socket: WebSocket, state: RegistryState) {
    let site_id = match handshake(&mut socket, &state).await {
        Handshake::Accepted(site_id) => site_id,
        Handshake::Rejected { site_id, reason } => {
            send(
                &mut socket,
                &WireMessage::AuthError {
                    message: reason.to_string(),
                },
            )
            .await;
            let _ = socket.send(Message::Close(None)).await;
            state.reject(site_id, reason);
            return;
        }
        Handshake::Gone => {
            debug!("device left before authenticating");
            return;
        }
    };

    let authenticated = WireMessage::Authenticated {
        message: format!("welcome {site_id}"),
    };
    if !send(&mut socket, &authenticated).await {
        return;
    }

    let registration = state.connect(&site_id).await;
    let connection_id = registration.connection_id;
    let mut outbound = registration.outbound;
    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match message.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!("failed to encode {}: {e}", message.kind());
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                debug!("device send failed, connection closed");
                return;
            }
        }
        // replaced or revoked
        let _ = sender.send(Message::Close(None)).await;
    });

    let recv_state = state.clone();
    let recv_site = site_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match WireMessage::decode(&text) {
                    Ok(message) => recv_state.record(&recv_site, message).await,
                    Err(e) => warn!("malformed frame from {recv_site}: {e}"),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => {
            recv_task.abort();
        }
        _ = (&mut recv_task) => {
            send_task.abort();
        }
    }

    state.disconnect(&site_id, connection_id).await;
    info!("device link for {site_id} closed");
}
