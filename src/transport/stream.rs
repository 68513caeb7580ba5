//! One stream type for plain and TLS connections.
//!
//! The connection driver only needs `AsyncRead + AsyncWrite`; wrapping both
//! transports in an enum keeps the driver free of generics.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsStream;

/// Plain TCP or TLS over TCP
pub enum WireStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl WireStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, WireStream::Tls(_))
    }
}

impl std::fmt::Debug for WireStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireStream::Plain(_) => f.write_str("WireStream::Plain"),
            WireStream::Tls(_) => f.write_str("WireStream::Tls"),
        }
    }
}

impl From<TcpStream> for WireStream {
    fn from(stream: TcpStream) -> Self {
        WireStream::Plain(stream)
    }
}

impl From<tokio_rustls::client::TlsStream<TcpStream>> for WireStream {
    fn from(stream: tokio_rustls::client::TlsStream<TcpStream>) -> Self {
        WireStream::Tls(Box::new(TlsStream::Client(stream)))
    }
}

impl From<tokio_rustls::server::TlsStream<TcpStream>> for WireStream {
    fn from(stream: tokio_rustls::server::TlsStream<TcpStream>) -> Self {
        WireStream::Tls(Box::new(TlsStream::Server(stream)))
    }
}

impl AsyncRead for WireStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WireStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            WireStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for WireStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            WireStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            WireStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WireStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            WireStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WireStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            WireStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
