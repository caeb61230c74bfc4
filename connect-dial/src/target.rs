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

// # Proxy connection strings
//
// This module parses a user supplied proxy address into a
// `ProxyTarget`. Accepted forms:
//
//   host
//   host:port
//   [user[:password]@]host[:port]
//   scheme://[user[:password]@]host[:port]
//
// where `scheme` is `http` or `https`. Without a scheme the address is
// treated as `http`. Without a port the scheme default (80 or 443) is
// used. IPv6 hosts must be enclosed in square brackets.

use crate::error::{Error, Result};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::string::FromUtf8Error;
use url::{Host, Url};

/// Protocol spoken on the proxy leg.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn from_url(url: &Url) -> Option<Scheme> {
        match url.scheme() {
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials embedded in a connection string.
///
/// A password is either absent (`user@host`) or present, possibly empty
/// (`user:@host`). The two are kept apart.
#[derive(Clone, PartialEq, Eq)]
pub struct UserInfo {
    username: String,
    password: Option<String>,
}

impl UserInfo {
    pub fn new(username: impl Into<String>) -> Self {
        UserInfo { username: username.into(), password: None }
    }

    pub fn with_password(username: impl Into<String>, password: impl Into<String>) -> Self {
        UserInfo { username: username.into(), password: Some(password.into()) }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Splits a raw `user[:password]` segment at the first colon and
    /// percent-decodes both halves.
    fn decode(raw: &str) -> core::result::Result<UserInfo, FromUtf8Error> {
        let (username, password) = match raw.split_once(':') {
            Some((username, password)) => (username, Some(password)),
            None => (raw, None),
        };
        Ok(UserInfo {
            username: urlencoding::decode(username)?.into_owned(),
            password: password.map(urlencoding::decode).transpose()?.map(Cow::into_owned),
        })
    }
}

impl fmt::Debug for UserInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UserInfo")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A normalized proxy address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyTarget {
    scheme: Scheme,
    host: String,
    port: u16,
    user_info: Option<UserInfo>,
}

impl ProxyTarget {
    /// Parses a proxy connection string.
    ///
    /// Returns `Ok(None)` for an empty string, meaning no proxy is
    /// configured.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConnectionString`] if the string is not a
    /// valid proxy address even after assuming an `http://` prefix.
    pub fn parse(input: &str) -> Result<Option<ProxyTarget>> {
        if input.is_empty() {
            return Ok(None);
        }

        let (url, raw) = match Url::parse(input) {
            Ok(url) if Scheme::from_url(&url).is_some() => (url, Cow::Borrowed(input)),
            _ => {
                let prefixed = format!("http://{}", input);
                let url = Url::parse(&prefixed)
                    .map_err(|err| Error::invalid_connection_string(input, err))?;
                (url, Cow::Owned(prefixed))
            }
        };

        let scheme = Scheme::from_url(&url).ok_or_else(|| {
            Error::invalid_connection_string(input, "port is not specified")
        })?;

        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_owned(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(Error::invalid_connection_string(input, "missing host")),
        };

        // A proxy address names a server, not a resource on it.
        if !matches!(url.path(), "" | "/") || url.query().is_some() || url.fragment().is_some() {
            return Err(Error::invalid_connection_string(
                input,
                "unexpected path, query or fragment",
            ));
        }

        // `Url::port` hides a port equal to the scheme default.
        let port = url.port().unwrap_or_else(|| scheme.default_port());

        // The serialized URL drops an empty password, so prefer the raw text
        // and only fall back for forms like `http:user@host`.
        let user_info = raw_user_info(&raw)
            .or_else(|| raw_user_info(url.as_str()))
            .map(UserInfo::decode)
            .transpose()
            .map_err(|err| Error::invalid_connection_string(input, err))?;

        Ok(Some(ProxyTarget { scheme, host, port, user_info }))
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Host name or IP address, without IPv6 brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user_info(&self) -> Option<&UserInfo> {
        self.user_info.as_ref()
    }

    /// `host:port`, with IPv6 hosts enclosed in brackets.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Credentials are never displayed.
impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

impl FromStr for ProxyTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ProxyTarget::parse(s)?
            .ok_or_else(|| Error::invalid_connection_string(s, "no proxy address given"))
    }
}

/// Returns the raw text before the last `@` of the authority, if any.
fn raw_user_info(url: &str) -> Option<&str> {
    let rest = &url[url.find("://")? + 3..];
    let authority = rest.split(&['/', '?', '#'][..]).next().unwrap_or(rest);
    authority.rfind('@').map(|at| &authority[..at])
}
