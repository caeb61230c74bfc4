// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The byte stream handed back after a successful CONNECT.

use bytes::{Buf, Bytes};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::client::TlsStream;

/// Connection to the proxy, plain or TLS protected.
pub enum ProxyStream<S> {
    Plain(S),
    Tls(Box<TlsStream<S>>),
}

impl<S> ProxyStream<S> {
    pub fn is_tls(&self) -> bool {
        matches!(self, ProxyStream::Tls(_))
    }

    /// The underlying transport stream.
    pub fn get_ref(&self) -> &S {
        match self {
            ProxyStream::Plain(stream) => stream,
            ProxyStream::Tls(stream) => stream.get_ref().0,
        }
    }
}

impl<S: fmt::Debug> fmt::Debug for ProxyStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProxyStream::Plain(stream) => f.debug_tuple("Plain").field(stream).finish(),
            ProxyStream::Tls(stream) => f.debug_tuple("Tls").field(stream.get_ref().0).finish(),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for ProxyStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            ProxyStream::Tls(stream) => Pin::new(&mut **stream).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for ProxyStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ProxyStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            ProxyStream::Tls(stream) => Pin::new(&mut **stream).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ProxyStream::Plain(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
            ProxyStream::Tls(stream) => Pin::new(&mut **stream).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            ProxyStream::Plain(stream) => stream.is_write_vectored(),
            ProxyStream::Tls(stream) => stream.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            ProxyStream::Tls(stream) => Pin::new(&mut **stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            ProxyStream::Tls(stream) => Pin::new(&mut **stream).poll_shutdown(cx),
        }
    }
}

/// An established tunnel through the proxy.
///
/// Reads first return any bytes the proxy sent after its response head,
/// then continue from the stream itself. Dropping the tunnel closes the
/// connection.
#[derive(Debug)]
pub struct TunnelConnection<S> {
    stream: ProxyStream<S>,
    buffered: Bytes,
}

impl<S> TunnelConnection<S> {
    pub(crate) fn new(stream: ProxyStream<S>, buffered: Bytes) -> Self {
        TunnelConnection { stream, buffered }
    }

    /// Whether the proxy leg is TLS protected.
    pub fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    pub fn get_ref(&self) -> &ProxyStream<S> {
        &self.stream
    }

    /// Tunnel bytes already read from the proxy but not yet returned.
    pub fn buffered(&self) -> &[u8] {
        &self.buffered
    }

    pub fn into_parts(self) -> (ProxyStream<S>, Bytes) {
        (self.stream, self.buffered)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for TunnelConnection<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.buffered.is_empty() {
            let n = this.buffered.len().min(buf.remaining());
            buf.put_slice(&this.buffered[..n]);
            this.buffered.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for TunnelConnection<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
