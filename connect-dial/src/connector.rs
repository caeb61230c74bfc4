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

use crate::auth::{authorization_header, BasicAuth, ProxyAuth};
use crate::connection::{ProxyStream, TunnelConnection};
use crate::error::{Error, Phase, Result};
use crate::target::ProxyTarget;
use crate::transport::{TcpTransport, Transport};
use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use rustls::pki_types::ServerName;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsConnector;

/// The only network [`Dialer::dial`] accepts.
pub const NETWORK_TCP: &str = "tcp";

const HTTP_VERSION: &str = "1.1";
const MAX_RESPONSE_HEADERS: usize = 64;
const MAX_RESPONSE_HEAD_LEN: usize = 8 * 1024;
const CLOSE_TIMEOUT: Duration = Duration::from_millis(100);

/// Dialer configuration.
#[derive(Clone, Debug, Default)]
pub struct DialerConfig {
    /// Proxy address, see [`ProxyTarget::parse`].
    pub connection_string: String,
    /// Credentials. Takes precedence over any embedded in the connection string.
    pub auth: Option<Arc<dyn ProxyAuth>>,
    /// When set, the connection to the proxy itself is TLS protected.
    pub tls: Option<Arc<rustls::ClientConfig>>,
    /// Deadline for writing the CONNECT request and reading the response.
    pub response_timeout: Option<Duration>,
}

impl DialerConfig {
    pub fn new(connection_string: impl Into<String>) -> Self {
        DialerConfig { connection_string: connection_string.into(), ..Default::default() }
    }

    pub fn with_auth(mut self, auth: impl ProxyAuth + 'static) -> Self {
        self.auth = Some(Arc::new(auth));
        self
    }

    pub fn with_tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }
}

/// Establishes TCP tunnels to target addresses through an HTTP proxy.
///
/// Each dial opens a fresh connection to the proxy (optionally over
/// TLS), performs the CONNECT request handshake, including optional
/// authentication, and returns the connection. The dialer is immutable
/// after construction and may be shared between tasks.
#[derive(Clone)]
pub struct Dialer<T = TcpTransport> {
    target: ProxyTarget,
    auth: Option<Arc<dyn ProxyAuth>>,
    tls: Option<TlsConnector>,
    response_timeout: Option<Duration>,
    transport: T,
}

impl<T: fmt::Debug> fmt::Debug for Dialer<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Dialer")
            .field("target", &self.target)
            .field("auth", &self.auth)
            .field("tls", &self.tls.is_some())
            .field("response_timeout", &self.response_timeout)
            .field("transport", &self.transport)
            .finish()
    }
}

/// Parsed CONNECT response head.
struct ProxyResponse {
    status: u16,
    /// Bytes received after the head.
    buffered: Bytes,
}

impl Dialer {
    /// Creates a dialer connecting to the proxy over TCP.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConnectionString`] if the connection string
    /// is empty or invalid.
    pub fn new(config: DialerConfig) -> Result<Self> {
        Self::with_transport(config, TcpTransport)
    }
}

impl<T: Transport> Dialer<T> {
    /// Creates a dialer opening proxy connections with `transport`.
    pub fn with_transport(config: DialerConfig, transport: T) -> Result<Self> {
        let target = ProxyTarget::parse(&config.connection_string)?.ok_or_else(|| {
            Error::invalid_connection_string(&config.connection_string, "no proxy address given")
        })?;

        let auth = config.auth.or_else(|| {
            let user_info = target.user_info()?;
            Some(Arc::new(BasicAuth::from(user_info)) as Arc<dyn ProxyAuth>)
        });

        debug!(
            "dialer for proxy {} (tls: {}, auth: {})",
            target,
            config.tls.is_some(),
            auth.as_ref().map_or("none", |auth| auth.auth_type())
        );

        Ok(Dialer {
            target,
            auth,
            tls: config.tls.map(TlsConnector::from),
            response_timeout: config.response_timeout,
            transport,
        })
    }

    pub fn target(&self) -> &ProxyTarget {
        &self.target
    }

    /// Opens a tunnel to `addr` (`host:port`) through the proxy.
    ///
    /// `network` must be [`NETWORK_TCP`]. `addr` is sent verbatim in the
    /// request line and the `Host` header.
    pub async fn dial(&self, network: &str, addr: &str) -> Result<TunnelConnection<T::Stream>> {
        self.dial_until(std::future::pending(), network, addr).await
    }

    /// Like [`Dialer::dial`], aborting the connection to the proxy once
    /// `cancel` completes.
    ///
    /// Only opening the proxy connection (including the proxy TLS
    /// handshake) is cancellable. Use
    /// [`DialerConfig::response_timeout`] to bound the exchange.
    pub async fn dial_with_cancellation<C>(
        &self,
        cancel: C,
        network: &str,
        addr: &str,
    ) -> Result<TunnelConnection<T::Stream>>
    where
        C: Future<Output = ()>,
    {
        let cancel = async {
            cancel.await;
            io::Error::new(io::ErrorKind::Interrupted, "dial cancelled")
        };
        self.dial_until(cancel, network, addr).await
    }

    /// Like [`Dialer::dial`], failing if the proxy connection is not
    /// established within `timeout`.
    pub async fn dial_timeout(
        &self,
        timeout: Duration,
        network: &str,
        addr: &str,
    ) -> Result<TunnelConnection<T::Stream>> {
        let expired = async {
            tokio::time::sleep(timeout).await;
            io::Error::new(io::ErrorKind::TimedOut, "timed out connecting to proxy")
        };
        self.dial_until(expired, network, addr).await
    }

    async fn dial_until<C>(
        &self,
        abort: C,
        network: &str,
        addr: &str,
    ) -> Result<TunnelConnection<T::Stream>>
    where
        C: Future<Output = io::Error>,
    {
        if network != NETWORK_TCP {
            return Err(Error::UnsupportedDialNetwork(network.to_owned()));
        }
        debug!("dialing {} through proxy {}", addr, self.target);

        let connected = tokio::select! {
            result = self.connect_proxy() => result,
            err = abort => Err(err),
        };
        let mut stream =
            connected.map_err(|source| self.connection_failed(Phase::ProxyConnect, source))?;

        let exchange = self.exchange(&mut stream, addr);
        let result = match self.response_timeout {
            Some(timeout) => tokio::time::timeout(timeout, exchange).await.unwrap_or_else(|_| {
                Err(io::Error::new(io::ErrorKind::TimedOut, "timed out waiting for proxy response"))
            }),
            None => exchange.await,
        };

        match result {
            Ok(ProxyResponse { status: 200, buffered }) => {
                debug!("tunnel to {} established through proxy {}", addr, self.target);
                Ok(TunnelConnection::new(stream, buffered))
            }
            Ok(ProxyResponse { status, .. }) => {
                close(stream).await;
                Err(Error::AuthenticationFailed { proxy: self.target.authority(), status })
            }
            Err(source) if source.kind() == io::ErrorKind::TimedOut => {
                // Shutting down would have to flush the stalled request first.
                drop(stream);
                Err(self.connection_failed(Phase::ProxyResponse, source))
            }
            Err(source) => {
                close(stream).await;
                Err(self.connection_failed(Phase::ProxyResponse, source))
            }
        }
    }

    async fn connect_proxy(&self) -> io::Result<ProxyStream<T::Stream>> {
        let stream = self.transport.connect(self.target.host(), self.target.port()).await?;
        let Some(connector) = &self.tls else {
            return Ok(ProxyStream::Plain(stream));
        };

        let server_name = ServerName::try_from(self.target.host().to_owned())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let stream = connector.connect(server_name, stream).await?;
        debug!("tls established with proxy {}", self.target);
        Ok(ProxyStream::Tls(Box::new(stream)))
    }

    /// Writes the CONNECT request and reads the response head.
    async fn exchange<S>(&self, stream: &mut S, addr: &str) -> io::Result<ProxyResponse>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = self.connect_request(addr);
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;
        read_response(stream).await
    }

    fn connect_request(&self, addr: &str) -> String {
        let mut request = format!("CONNECT {} HTTP/{}\r\nHost: {}\r\n", addr, HTTP_VERSION, addr);
        if let Some(auth) = &self.auth {
            request.push_str(&format!(
                "Proxy-Authorization: {}\r\n",
                authorization_header(auth.as_ref())
            ));
        }
        request.push_str("\r\n");
        request
    }

    fn connection_failed(&self, phase: Phase, source: io::Error) -> Error {
        Error::ConnectionFailed { proxy: self.target.authority(), phase, source }
    }
}

/// Reads exactly one response head.
async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<ProxyResponse> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if buf.len() >= MAX_RESPONSE_HEAD_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "proxy response head too large"));
        }
        buf.reserve(1024);
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed the connection before responding",
            ));
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        let status =
            response.parse(&buf).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        if let httparse::Status::Complete(len) = status {
            let status = response
                .code
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing status code"))?;
            trace!("proxy responded {} {}", status, response.reason.unwrap_or_default());
            let buffered = buf.split_off(len).freeze();
            return Ok(ProxyResponse { status, buffered });
        }
    }
}

/// Shuts the stream down, then drops it. A peer that stops reading only
/// delays this by `CLOSE_TIMEOUT`.
async fn close<S: AsyncWrite + Unpin>(mut stream: S) {
    match tokio::time::timeout(CLOSE_TIMEOUT, stream.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => trace!("shutdown after failed handshake: {}", err),
        Err(_) => trace!("shutdown after failed handshake timed out"),
    }
}
