use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tracing::{debug, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tungstenite::http::{HeaderValue, StatusCode};
use tungstenite::protocol::CloseFrame;
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::frame::coding::CloseCode;

use crate::broker::engine::{SharedServer, lock};
use crate::transport::wire::{ChannelWire, WireFrame};
use crate::transport::{ConnectionRegistry, close_connection, connection_info};
use crate::utils::error::TransportError;

pub const PROTOCOL_V41: &str = "v4.1.networktables.first.wpi.edu";
pub const PROTOCOL_V40: &str = "networktables.first.wpi.edu";

/// Frames queued on the socket before the connection reports not-ready.
const MAX_IN_FLIGHT: usize = 8;

/// Result of inspecting an upgrade request.
#[derive(Debug, Clone, PartialEq)]
pub struct Negotiated {
    pub name: String,
    pub protocol: &'static str,
    pub version: u16,
}

/// Accept `/nt/<name>` and pick the newest offered subprotocol.
pub fn negotiate(path: &str, offered: Option<&str>) -> Result<Negotiated, (StatusCode, String)> {
    let Some(name) = path.strip_prefix("/nt/") else {
        return Err((StatusCode::NOT_FOUND, format!("unknown path '{path}'")));
    };
    let offered: Vec<&str> = offered
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .collect();
    let (protocol, version) = if offered.contains(&PROTOCOL_V41) {
        (PROTOCOL_V41, 0x0401)
    } else if offered.contains(&PROTOCOL_V40) {
        (PROTOCOL_V40, 0x0400)
    } else {
        return Err((
            StatusCode::BAD_REQUEST,
            "unsupported websocket subprotocol".to_string(),
        ));
    };
    Ok(Negotiated {
        name: name.to_string(),
        protocol,
        version,
    })
}

/// Bind `addr` and accept NT4 clients forever.
pub async fn start_websocket_server(
    addr: &str,
    server: SharedServer,
    registry: ConnectionRegistry,
) -> Result<(), TransportError> {
    let listener = TcpListener::bind(addr).await?;
    info!("NT4 server listening on ws://{}", listener.local_addr()?);
    serve_websocket(listener, server, registry).await;
    Ok(())
}

/// Accept NT4 clients on an already bound listener.
pub async fn serve_websocket(
    listener: TcpListener,
    server: SharedServer,
    registry: ConnectionRegistry,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("NT4 accept failed: {e}");
                continue;
            }
        };
        tokio::spawn(handle_connection(stream, peer, server.clone(), registry.clone()));
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    server: SharedServer,
    registry: ConnectionRegistry,
) {
    let mut negotiated = None;
    let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        let offered = req
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        match negotiate(req.uri().path(), offered) {
            Ok(n) => {
                resp.headers_mut()
                    .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(n.protocol));
                negotiated = Some(n);
                Ok(resp)
            }
            Err((status, reason)) => {
                let mut err = ErrorResponse::new(Some(reason));
                *err.status_mut() = status;
                Err(err)
            }
        }
    };

    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake error from {peer}: {e}");
            return;
        }
    };
    let Some(negotiated) = negotiated else {
        return;
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Channel the session writes into; drained by the send loop below
    let (tx, mut rx) = mpsc::unbounded_channel::<WireFrame>();
    let wire = ChannelWire::new(tx, MAX_IN_FLIGHT);
    let tracker = wire.tracker();
    let gate = wire.read_gate();

    let conn_info = format!("{}:{}", peer.ip(), peer.port());
    let (client_name, id) = {
        let mut server = lock(&server);
        let (client_name, id) =
            server.add_client(&negotiated.name, &conn_info, false, Box::new(wire));
        registry.add(id, connection_info(&client_name, &peer, negotiated.version));
        registry.publish_if_changed(&mut server);
        (client_name, id)
    };

    let writer_name = client_name.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let msg = match frame {
                WireFrame::Text(text) => WsMessage::text(text),
                WireFrame::Binary(data) => WsMessage::binary(data),
                WireFrame::Close(reason) => {
                    let close = CloseFrame {
                        code: CloseCode::Protocol,
                        reason: reason.into(),
                    };
                    if let Err(e) = ws_sender.send(WsMessage::Close(Some(close))).await {
                        debug!("close to {writer_name} failed: {e}");
                    }
                    break;
                }
            };
            if let Err(e) = ws_sender.send(msg).await {
                warn!("Failed to send message to {writer_name}: {e}");
                break;
            }
            tracker.sent();
        }
        debug!("Send loop closed for {writer_name}");
    });

    loop {
        gate.wait().await;
        let msg = tokio::select! {
            msg = ws_receiver.next() => msg,
            _ = &mut writer => break,
        };
        let msg = match msg {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                debug!("{client_name} read error: {e}");
                break;
            }
            None => break,
        };
        match msg {
            WsMessage::Text(text) => {
                lock(&server).process_incoming_text(id, text.as_str());
            }
            WsMessage::Binary(data) => {
                lock(&server).process_incoming_binary(id, &data);
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    close_connection(&server, &registry, id);
}
