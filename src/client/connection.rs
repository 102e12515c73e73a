//! Connection manager
//!
//! Opens the broker transport, runs the handshake through the engine and
//! tears the transport down again.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::{ClientError, ConnectOptions};
use crate::engine::{Handshake, ProtocolEngine};
use crate::protocol::ConnectReturnCode;
use crate::transport::{configure_stream, Transport};

/// Resolve, connect and optionally wrap the stream in TLS
///
/// Socket option failures are logged and ignored.
pub(crate) async fn open(
    options: &ConnectOptions,
    connect_timeout: Duration,
) -> Result<Transport, ClientError> {
    let addr = format!("{}:{}", options.host, options.port);

    let stream = timeout(connect_timeout, TcpStream::connect(addr.as_str()))
        .await
        .map_err(|_| ClientError::Transport(format!("Connecting to {} timed out", addr)))?
        .map_err(|e| ClientError::Transport(format!("Failed to connect to {}: {}", addr, e)))?;

    configure_stream(&stream, options.socket_keepalive.as_ref());
    debug!("TCP connected to {}", addr);

    let Some(tls) = &options.tls else {
        return Ok(Transport::Plain(stream));
    };

    let connector = tls.connector()?;
    let server_name = tls.server_name(&options.host)?;
    let stream = timeout(connect_timeout, connector.connect(server_name, stream))
        .await
        .map_err(|_| ClientError::Transport(format!("TLS handshake with {} timed out", addr)))?
        .map_err(|e| ClientError::Transport(format!("TLS handshake with {} failed: {}", addr, e)))?;

    debug!("TLS established with {}", addr);
    Ok(Transport::Tls(Box::new(stream)))
}

/// Perform the protocol handshake over a freshly opened transport
///
/// A transport-level failure closes the engine's transport before the error
/// is returned.
pub(crate) async fn handshake(
    engine: &dyn ProtocolEngine,
    transport: Transport,
    handshake: &Handshake,
) -> Result<ConnectReturnCode, ClientError> {
    match engine.connect(transport, handshake).await {
        Ok(code) => Ok(code),
        Err(e) => {
            close(engine).await;
            Err(ClientError::Transport(format!("Handshake failed: {}", e)))
        }
    }
}

/// Drop the engine's transport; safe to call on a dead or absent transport
pub(crate) async fn close(engine: &dyn ProtocolEngine) {
    engine.close().await;
}
