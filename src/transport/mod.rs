//! Transport Layer
//!
//! Plain TCP and TLS streams behind one `AsyncRead + AsyncWrite` type, plus
//! best-effort socket tuning.

pub mod tls;

pub use tls::{TlsConfig, TlsError};

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::Deserialize;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::warn;

/// TCP keepalive tuning applied to the broker socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SocketKeepalive {
    /// Idle time before the first probe
    #[serde(with = "humantime_serde")]
    pub idle: Duration,
    /// Interval between probes
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Unanswered probes before the connection is dropped
    pub retries: u32,
}

impl SocketKeepalive {
    pub fn new(idle: Duration, interval: Duration, retries: u32) -> Self {
        Self {
            idle,
            interval,
            retries,
        }
    }
}

/// Apply socket options to a freshly connected stream
///
/// Every option is best-effort: a failure is logged and the stream is used
/// as-is.
pub fn configure_stream(stream: &TcpStream, keepalive: Option<&SocketKeepalive>) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    let Some(keepalive) = keepalive else {
        return;
    };

    let sock = SockRef::from(stream);
    if let Err(e) = sock.set_keepalive(true) {
        warn!("Failed to enable SO_KEEPALIVE: {}", e);
        return;
    }

    if let Err(e) = sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(keepalive.idle)) {
        warn!("Failed to set TCP keepalive idle time: {}", e);
    }
    apply_probe_tuning(&sock, keepalive);
}

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd"
))]
fn apply_probe_tuning(sock: &SockRef<'_>, keepalive: &SocketKeepalive) {
    let params = TcpKeepalive::new()
        .with_time(keepalive.idle)
        .with_interval(keepalive.interval);
    if let Err(e) = sock.set_tcp_keepalive(&params) {
        warn!("Failed to set TCP keepalive interval: {}", e);
    }

    let params = params.with_retries(keepalive.retries);
    if let Err(e) = sock.set_tcp_keepalive(&params) {
        warn!("Failed to set TCP keepalive retries: {}", e);
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd"
)))]
fn apply_probe_tuning(_sock: &SockRef<'_>, keepalive: &SocketKeepalive) {
    warn!(
        "TCP keepalive interval/retries ({:?}/{}) not supported on this platform",
        keepalive.interval, keepalive.retries
    );
}

/// A connected broker stream
#[derive(Debug)]
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Transport {
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
