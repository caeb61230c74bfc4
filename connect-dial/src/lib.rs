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

//! # CONNECT dialer
//!
//! This crate establishes TCP tunnels to target addresses through an
//! HTTP forward proxy using the CONNECT method.
//!
//! The main component of this crate is the `Dialer` struct, which
//! connects to the proxy, optionally over TLS, performs the CONNECT
//! request handshake, including optional Basic authentication, and
//! hands back the open connection as a raw byte stream. Callers
//! typically layer TLS to the destination on top of it.
//!
//! ## Example
//!
//! ```
//! use connect_dial::{Dialer, DialerConfig, NETWORK_TCP};
//! use tokio::io::AsyncWriteExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dialer = Dialer::new(DialerConfig::new("user:pass@127.0.0.1:8888"))?;
//!
//!     let mut tunnel = dialer.dial(NETWORK_TCP, "example.com:80").await?;
//!     tunnel.write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Limitations
//!
//! * Only HTTP CONNECT proxies are supported.
//! * Only single-shot credentials are sent; challenge based schemes
//!   (Digest, NTLM) are not.

mod auth;
mod connection;
mod connector;
mod error;
mod target;
mod transport;

pub use auth::{BasicAuth, ProxyAuth};
pub use connection::{ProxyStream, TunnelConnection};
pub use connector::*;
pub use error::{Error, Phase, Result};
pub use target::{ProxyTarget, Scheme, UserInfo};
pub use transport::{TcpTransport, Transport};
