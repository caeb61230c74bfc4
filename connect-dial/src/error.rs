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

//! This module defines the dialer error types.

use std::fmt;
use std::io;

pub type Result<T> = core::result::Result<T, Error>;

/// The stage of a dial in which a [`Error::ConnectionFailed`] occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Opening the transport to the proxy, including the proxy TLS handshake.
    ProxyConnect,
    /// Writing the CONNECT request or reading the proxy's response.
    ProxyResponse,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Phase::ProxyConnect => write!(f, "connect"),
            Phase::ProxyResponse => write!(f, "response"),
        }
    }
}

/// An enumeration of possible errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid proxy connection string {input:?}: {reason}")]
    InvalidConnectionString { input: String, reason: String },

    #[error("unsupported dialing protocol {0:?} was passed: only tcp is supported")]
    UnsupportedDialNetwork(String),

    #[error("could not connect to proxy {proxy} ({phase}): {source}")]
    ConnectionFailed {
        proxy: String,
        phase: Phase,
        #[source]
        source: io::Error,
    },

    /// Any non-200 answer to CONNECT, whatever the proxy's reason.
    #[error("authentication failed for proxy {proxy}: got status code {status}")]
    AuthenticationFailed { proxy: String, status: u16 },
}

impl Error {
    pub(crate) fn invalid_connection_string(input: &str, reason: impl fmt::Display) -> Self {
        Error::InvalidConnectionString { input: input.to_owned(), reason: reason.to_string() }
    }

    /// Status code returned by the proxy, if it answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::AuthenticationFailed { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn phase(&self) -> Option<Phase> {
        match self {
            Error::ConnectionFailed { phase, .. } => Some(*phase),
            Error::AuthenticationFailed { .. } => Some(Phase::ProxyResponse),
            _ => None,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::InvalidConnectionString { .. } => io::ErrorKind::InvalidInput,
            Error::UnsupportedDialNetwork(_) => io::ErrorKind::Unsupported,
            Error::ConnectionFailed { source, .. } => source.kind(),
            Error::AuthenticationFailed { .. } => io::ErrorKind::PermissionDenied,
        };
        io::Error::new(kind, err)
    }
}
