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

//! Proxy credentials.
//!
//! A [`ProxyAuth`] produces the value of the `Proxy-Authorization`
//! header sent with the CONNECT request as `"<auth_type> <credentials>"`.

use crate::target::UserInfo;
use base64::{engine::general_purpose, Engine as _};
use std::fmt;

/// Credential provider for proxy authorization.
pub trait ProxyAuth: fmt::Debug + Send + Sync {
    /// Authorization scheme name, e.g. `Basic`.
    fn auth_type(&self) -> &str;

    /// Scheme-specific encoded credentials.
    fn credentials(&self) -> String;
}

/// HTTP Basic credentials (RFC 7617).
///
/// The password segment, including the `:` separator, is only encoded
/// when a password was supplied. An empty password still yields
/// `user:`.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    user: String,
    password: Option<String>,
}

impl BasicAuth {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        BasicAuth { user: user.into(), password: Some(password.into()) }
    }

    pub fn without_password(user: impl Into<String>) -> Self {
        BasicAuth { user: user.into(), password: None }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }
}

impl From<&UserInfo> for BasicAuth {
    fn from(user_info: &UserInfo) -> Self {
        BasicAuth {
            user: user_info.username().to_owned(),
            password: user_info.password().map(str::to_owned),
        }
    }
}

impl ProxyAuth for BasicAuth {
    fn auth_type(&self) -> &str {
        "Basic"
    }

    fn credentials(&self) -> String {
        let mut plain = self.user.clone();
        if let Some(password) = &self.password {
            plain.push(':');
            plain.push_str(password);
        }
        base64_encode(plain.as_bytes())
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Value of the `Proxy-Authorization` header for `auth`.
pub(crate) fn authorization_header(auth: &dyn ProxyAuth) -> String {
    let (auth_type, credentials) = (auth.auth_type(), auth.credentials());
    let mut header = String::with_capacity(auth_type.len() + 1 + credentials.len());
    header.push_str(auth_type);
    header.push(' ');
    header.push_str(&credentials);
    header
}

fn base64_encode(src: &[u8]) -> String {
    general_purpose::STANDARD.encode(src)
}
