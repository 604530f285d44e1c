//! Transport socket abstraction.
//!
//! A `StreamSocket` is what the pool stores, hands out, and probes for
//! reusability. Mimics Chromium's `net::StreamSocket`: the pool only needs
//! connectivity and idleness checks on top of async I/O.

use std::fmt;
use std::io::ErrorKind;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// A connected transport-layer socket.
///
/// The pool is single-threaded, so sockets need not be `Send`.
pub trait StreamSocket: AsyncRead + AsyncWrite + Unpin + fmt::Debug {
    /// Returns true if the socket is still connected.
    /// Note: This does a non-blocking check, not a full liveness probe.
    fn is_connected(&self) -> bool;

    /// Returns true if the socket is connected and has no pending data.
    /// Matches Chromium's IsConnectedAndIdle(). A used socket with unread
    /// data cannot be reused: the data would be mistaken for the beginning
    /// of the next response.
    fn is_connected_and_idle(&self) -> bool;

    /// Returns true if the socket has ever carried application data.
    fn was_ever_used(&self) -> bool;

    /// Tear the connection down. Further reads and writes fail.
    fn disconnect(&mut self);
}

/// A plain TCP socket with usage tracking.
#[derive(Debug)]
pub struct TcpClientSocket {
    stream: Option<TcpStream>,
    was_used: bool,
}

impl TcpClientSocket {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream: Some(stream), was_used: false }
    }

    /// Mark the socket as having carried application data. Callers that
    /// perform I/O outside `AsyncRead`/`AsyncWrite` (e.g. vectored writes on
    /// the inner stream) should call this themselves.
    pub fn set_was_used(&mut self) {
        self.was_used = true;
    }

    /// Check if the underlying TCP socket is still connected.
    /// Uses peer_addr() plus a non-blocking peek to catch RST and FIN.
    fn check_connected(stream: &TcpStream) -> bool {
        if stream.peer_addr().is_err() {
            return false;
        }

        let mut buf = [0u8; 1];
        match stream.try_read(&mut buf) {
            Ok(0) => false,                                          // EOF - connection closed
            Ok(_) => true, // Data available, still connected
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => true, // No data, but connected
            Err(_) => false,
        }
    }

    /// Like `check_connected`, but data waiting in the receive buffer also
    /// disqualifies the socket.
    fn check_connected_and_idle(stream: &TcpStream) -> bool {
        if stream.peer_addr().is_err() {
            return false;
        }

        let mut buf = [0u8; 1];
        match stream.try_read(&mut buf) {
            Ok(_) => false, // EOF or unread data
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }
}

impl AsyncRead for TcpClientSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let Some(stream) = this.stream.as_mut() else {
            return Poll::Ready(Err(ErrorKind::NotConnected.into()));
        };
        let result = Pin::new(stream).poll_read(cx, buf);
        if matches!(result, Poll::Ready(Ok(()))) {
            this.was_used = true;
        }
        result
    }
}

impl AsyncWrite for TcpClientSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let Some(stream) = this.stream.as_mut() else {
            return Poll::Ready(Err(ErrorKind::NotConnected.into()));
        };
        let result = Pin::new(stream).poll_write(cx, buf);
        if matches!(result, Poll::Ready(Ok(_))) {
            this.was_used = true;
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Err(ErrorKind::NotConnected.into())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl StreamSocket for TcpClientSocket {
    fn is_connected(&self) -> bool {
        self.stream.as_ref().is_some_and(Self::check_connected)
    }

    fn is_connected_and_idle(&self) -> bool {
        self.stream.as_ref().is_some_and(Self::check_connected_and_idle)
    }

    fn was_ever_used(&self) -> bool {
        self.was_used
    }

    fn disconnect(&mut self) {
        self.stream = None;
    }
}
