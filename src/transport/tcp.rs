use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::engine::{SharedServer, lock};
use crate::client::nt3::Connected3Fn;
use crate::transport::wire::{ChannelWire, WireFrame};
use crate::transport::{ConnectionRegistry, close_connection, connection_info};
use crate::utils::error::TransportError;

const MAX_IN_FLIGHT: usize = 8;
const READ_BUFFER: usize = 4096;

/// Bind `addr` and accept NT3 clients forever.
pub async fn start_tcp_server(
    addr: &str,
    server: SharedServer,
    registry: ConnectionRegistry,
) -> Result<(), TransportError> {
    let listener = TcpListener::bind(addr).await?;
    info!("NT3 server listening on tcp://{}", listener.local_addr()?);
    serve_tcp(listener, server, registry).await;
    Ok(())
}

/// Accept NT3 clients on an already bound listener.
pub async fn serve_tcp(listener: TcpListener, server: SharedServer, registry: ConnectionRegistry) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("NT3 accept failed: {e}");
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
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed for {peer}: {e}");
    }
    let (mut reader, mut writer_half) = stream.into_split();

    let (tx, mut rx) = mpsc::unbounded_channel::<WireFrame>();
    let wire = ChannelWire::new(tx, MAX_IN_FLIGHT);
    let tracker = wire.tracker();
    let gate = wire.read_gate();

    // runs under the server lock, so it only touches the registry
    let connected: Connected3Fn = {
        let registry = registry.clone();
        Box::new(move |id, name, proto_rev| {
            registry.add(id, connection_info(name, &peer, proto_rev));
        })
    };

    let conn_info = format!("{}:{}", peer.ip(), peer.port());
    let id = lock(&server).add_client3(&conn_info, false, Box::new(wire), Some(connected));

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                WireFrame::Binary(data) => {
                    if let Err(e) = writer_half.write_all(&data).await {
                        warn!("Failed to write to {peer}: {e}");
                        break;
                    }
                    tracker.sent();
                }
                WireFrame::Text(_) => {
                    warn!("dropping text frame on NT3 connection {peer}");
                    tracker.sent();
                }
                WireFrame::Close(reason) => {
                    info!("closing NT3 connection {peer}: {reason}");
                    if let Err(e) = writer_half.shutdown().await {
                        debug!("shutdown of {peer} failed: {e}");
                    }
                    break;
                }
            }
        }
        debug!("Send loop closed for {peer}");
    });

    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        gate.wait().await;
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = &mut writer => break,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                let mut server = lock(&server);
                server.process_incoming_binary(id, &buf[..n]);
                registry.publish_if_changed(&mut server);
            }
            Err(e) => {
                debug!("NT3 read error from {peer}: {e}");
                break;
            }
        }
    }

    close_connection(&server, &registry, id);
}
