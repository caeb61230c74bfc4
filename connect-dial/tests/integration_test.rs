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

use connect_dial::{BasicAuth, Dialer, DialerConfig, Error, Phase, Transport, NETWORK_TCP};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

const HELLO_WORLD: &str = "Hello World!";

/// Self-signed certificate valid for `localhost` and `127.0.0.1`.
struct TestCert {
    cert: CertificateDer<'static>,
    key: PrivatePkcs8KeyDer<'static>,
}

impl TestCert {
    fn generate() -> anyhow::Result<Self> {
        let key_pair = rcgen::KeyPair::generate()?;
        let params =
            rcgen::CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])?;
        let cert = params.self_signed(&key_pair)?;
        Ok(TestCert {
            cert: cert.der().clone(),
            key: PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
        })
    }

    fn acceptor(&self) -> anyhow::Result<TlsAcceptor> {
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![self.cert.clone()], PrivateKeyDer::Pkcs8(self.key.clone_key()))?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    fn client_config(&self) -> anyhow::Result<Arc<rustls::ClientConfig>> {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(self.cert.clone())?;
        Ok(Arc::new(
            rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth(),
        ))
    }
}

/// Reads until the end of an HTTP head. Peers never send more before
/// they get an answer.
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<Vec<u8>> {
    let mut head = Vec::new();
    let mut buf = [0; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        head.extend_from_slice(&buf[..n]);
    }
    Ok(head)
}

async fn serve_hello<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S) -> std::io::Result<()> {
    read_head(&mut stream).await?;
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        HELLO_WORLD.len(),
        HELLO_WORLD
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// Starts a backend answering every request with "Hello World!".
async fn start_hello_server(tls: Option<TlsAcceptor>) -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let tls = tls.clone();
            tokio::spawn(async move {
                let _ = match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => serve_hello(stream).await,
                        Err(err) => Err(err),
                    },
                    None => serve_hello(stream).await,
                };
            });
        }
    });
    Ok(addr)
}

/// Answers one CONNECT request and relays bytes once the tunnel is up.
async fn serve_proxy<S>(mut client: S, required_auth: Option<String>) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head = read_head(&mut client).await?;
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut request = httparse::Request::new(&mut headers);
    request.parse(&head).map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;

    if request.method != Some("CONNECT") {
        client.write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n").await?;
        return client.shutdown().await;
    }
    if let Some(expected) = required_auth {
        let authorized = request.headers.iter().any(|header| {
            header.name.eq_ignore_ascii_case("Proxy-Authorization")
                && header.value == expected.as_bytes()
        });
        if !authorized {
            let response =
                b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic\r\n\r\n";
            client.write_all(response).await?;
            return client.shutdown().await;
        }
    }

    let target = request.path.unwrap_or_default().to_owned();
    let mut upstream = match TcpStream::connect(target.as_str()).await {
        Ok(upstream) => upstream,
        Err(_) => {
            client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
            return client.shutdown().await;
        }
    };
    client.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").await?;
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

/// Starts a CONNECT proxy, optionally behind TLS and requiring the given
/// `Proxy-Authorization` value.
async fn start_proxy(
    tls: Option<TlsAcceptor>,
    required_auth: Option<&str>,
) -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let required_auth = required_auth.map(str::to_owned);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let tls = tls.clone();
            let required_auth = required_auth.clone();
            tokio::spawn(async move {
                let _ = match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => serve_proxy(stream, required_auth).await,
                        Err(err) => Err(err),
                    },
                    None => serve_proxy(stream, required_auth).await,
                };
            });
        }
    });
    Ok(addr)
}

/// Sends a GET over `stream` and checks for the hello world answer.
async fn expect_hello_world<S>(mut stream: S, host: &str) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!("GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", host);
    stream.write_all(request.as_bytes()).await?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;

    let mut headers = [httparse::EMPTY_HEADER; 16];
    let mut response = httparse::Response::new(&mut headers);
    let httparse::Status::Complete(len) = response.parse(&raw)? else {
        anyhow::bail!("incomplete response: {:?}", String::from_utf8_lossy(&raw));
    };
    assert_eq!(response.code, Some(200));
    assert_eq!(String::from_utf8_lossy(&raw[len..]), HELLO_WORLD);
    Ok(())
}

async fn run_scenario(proxy_tls: bool, backend_tls: bool) -> anyhow::Result<()> {
    let proxy_cert = TestCert::generate()?;
    let backend_cert = TestCert::generate()?;

    let backend_addr =
        start_hello_server(if backend_tls { Some(backend_cert.acceptor()?) } else { None }).await?;
    let proxy_addr =
        start_proxy(if proxy_tls { Some(proxy_cert.acceptor()?) } else { None }, None).await?;

    let mut config = DialerConfig::new(if proxy_tls {
        format!("https://{}", proxy_addr)
    } else {
        proxy_addr.to_string()
    });
    if proxy_tls {
        config = config.with_tls(proxy_cert.client_config()?);
    }
    let dialer = Dialer::new(config)?;

    let backend = backend_addr.to_string();
    let tunnel = dialer.dial(NETWORK_TCP, &backend).await?;
    assert_eq!(tunnel.is_tls(), proxy_tls);

    if backend_tls {
        let connector = TlsConnector::from(backend_cert.client_config()?);
        let server_name = ServerName::try_from("127.0.0.1")?;
        let stream = connector.connect(server_name, tunnel).await?;
        expect_hello_world(stream, &backend).await
    } else {
        expect_hello_world(tunnel, &backend).await
    }
}

#[tokio::test]
async fn no_auth_or_tls() -> anyhow::Result<()> {
    run_scenario(false, false).await
}

#[tokio::test]
async fn no_auth_with_backend_tls() -> anyhow::Result<()> {
    run_scenario(false, true).await
}

#[tokio::test]
async fn no_auth_with_proxy_tls() -> anyhow::Result<()> {
    run_scenario(true, false).await
}

#[tokio::test]
async fn no_auth_with_proxy_and_backend_tls() -> anyhow::Result<()> {
    run_scenario(true, true).await
}

#[tokio::test]
async fn proxy_requires_credentials() -> anyhow::Result<()> {
    let backend_addr = start_hello_server(None).await?;
    let backend = backend_addr.to_string();
    // base64("user:pass")
    let proxy_addr = start_proxy(None, Some("Basic dXNlcjpwYXNz")).await?;

    let dialer = Dialer::new(DialerConfig::new(format!("http://user:pass@{}", proxy_addr)))?;
    let tunnel = dialer.dial(NETWORK_TCP, &backend).await?;
    expect_hello_world(tunnel, &backend).await?;

    let config =
        DialerConfig::new(proxy_addr.to_string()).with_auth(BasicAuth::new("user", "pass"));
    let tunnel = Dialer::new(config)?.dial(NETWORK_TCP, &backend).await?;
    expect_hello_world(tunnel, &backend).await?;

    let err = Dialer::new(DialerConfig::new(proxy_addr.to_string()))?
        .dial(NETWORK_TCP, &backend)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(407));

    let config = DialerConfig::new(format!("http://user:pass@{}", proxy_addr))
        .with_auth(BasicAuth::new("user", "wrong"));
    let err = Dialer::new(config)?.dial(NETWORK_TCP, &backend).await.unwrap_err();
    assert!(matches!(err, Error::AuthenticationFailed { status: 407, .. }), "{}", err);
    Ok(())
}

#[tokio::test]
async fn unreachable_destination_is_rejected() -> anyhow::Result<()> {
    let closed = TcpListener::bind("127.0.0.1:0").await?;
    let destination = closed.local_addr()?.to_string();
    drop(closed);

    let proxy_addr = start_proxy(None, None).await?;
    let dialer = Dialer::new(DialerConfig::new(proxy_addr.to_string()))?;
    let err = dialer.dial(NETWORK_TCP, &destination).await.unwrap_err();
    assert!(matches!(err, Error::AuthenticationFailed { status: 502, .. }), "{}", err);
    Ok(())
}

#[tokio::test]
async fn untrusted_proxy_certificate() -> anyhow::Result<()> {
    let proxy_cert = TestCert::generate()?;
    let other_cert = TestCert::generate()?;
    let proxy_addr = start_proxy(Some(proxy_cert.acceptor()?), None).await?;

    let config = DialerConfig::new(format!("https://{}", proxy_addr))
        .with_tls(other_cert.client_config()?);
    let err = Dialer::new(config)?.dial(NETWORK_TCP, "example.com:443").await.unwrap_err();
    assert_eq!(err.phase(), Some(Phase::ProxyConnect), "{}", err);
    Ok(())
}

/// In-memory transport to a TLS peer that completes the handshake and
/// then stops reading.
struct DeafTlsTransport {
    acceptor: TlsAcceptor,
}

impl Transport for DeafTlsTransport {
    type Stream = DuplexStream;

    async fn connect(&self, _host: &str, _port: u16) -> std::io::Result<DuplexStream> {
        let (client, server) = tokio::io::duplex(4096);
        let acceptor = self.acceptor.clone();
        tokio::spawn(async move {
            let _stream = acceptor.accept(server).await;
            std::future::pending::<()>().await;
        });
        Ok(client)
    }
}

#[tokio::test]
async fn response_timeout_with_deaf_tls_proxy() -> anyhow::Result<()> {
    let proxy_cert = TestCert::generate()?;
    let transport = DeafTlsTransport { acceptor: proxy_cert.acceptor()? };
    let config = DialerConfig::new("https://127.0.0.1:3128")
        .with_tls(proxy_cert.client_config()?)
        .with_response_timeout(Duration::from_millis(200));
    let dialer = Dialer::with_transport(config, transport)?;

    // Far larger than the duplex buffer, so the request write stalls.
    let addr = format!("{}.example.com:443", "a".repeat(256 * 1024));
    let result = tokio::time::timeout(Duration::from_secs(3), dialer.dial(NETWORK_TCP, &addr))
        .await
        .map_err(|_| anyhow::anyhow!("dial still pending after the response timeout"))?;
    match result {
        Err(Error::ConnectionFailed { phase: Phase::ProxyResponse, source, .. }) => {
            assert_eq!(source.kind(), std::io::ErrorKind::TimedOut)
        }
        other => panic!("unexpected result {:?}", other.map(drop)),
    }
    Ok(())
}
