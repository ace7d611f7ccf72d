//! Link stream abstraction for TCP and in-memory transports.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

/// Any byte transport a controller link can run over.
pub trait LinkIo: AsyncRead + AsyncWrite + Send {}

impl<T: AsyncRead + AsyncWrite + Send> LinkIo for T {}

pin_project! {
    /// A controller link: TCP, an in-process pipe, or any boxed transport.
    #[project = ClientStreamProj]
    pub enum ClientStream {
        Tcp { #[pin] stream: TcpStream },
        Duplex { #[pin] stream: DuplexStream },
        Boxed { stream: Pin<Box<dyn LinkIo>> },
    }
}

impl ClientStream {
    pub fn boxed(stream: impl LinkIo + 'static) -> Self {
        ClientStream::Boxed {
            stream: Box::pin(stream),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientStream::Tcp { .. } => "tcp",
            ClientStream::Duplex { .. } => "duplex",
            ClientStream::Boxed { .. } => "boxed",
        }
    }
}

impl From<TcpStream> for ClientStream {
    fn from(stream: TcpStream) -> Self {
        ClientStream::Tcp { stream }
    }
}

impl From<DuplexStream> for ClientStream {
    fn from(stream: DuplexStream) -> Self {
        ClientStream::Duplex { stream }
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Tcp { stream } => stream.poll_read(cx, buf),
            ClientStreamProj::Duplex { stream } => stream.poll_read(cx, buf),
            ClientStreamProj::Boxed { stream } => stream.as_mut().poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ClientStreamProj::Tcp { stream } => stream.poll_write(cx, buf),
            ClientStreamProj::Duplex { stream } => stream.poll_write(cx, buf),
            ClientStreamProj::Boxed { stream } => stream.as_mut().poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Tcp { stream } => stream.poll_flush(cx),
            ClientStreamProj::Duplex { stream } => stream.poll_flush(cx),
            ClientStreamProj::Boxed { stream } => stream.as_mut().poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Tcp { stream } => stream.poll_shutdown(cx),
            ClientStreamProj::Duplex { stream } => stream.poll_shutdown(cx),
            ClientStreamProj::Boxed { stream } => stream.as_mut().poll_shutdown(cx),
        }
    }
}
