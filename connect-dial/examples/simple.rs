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

//! Fetches a page through an HTTP proxy.
//!
//! ```
//! RUST_LOG=debug cargo run --example simple -- --proxy 127.0.0.1:8888 example.com:80
//! ```

use anyhow::Context;
use clap::Parser;
use connect_dial::{BasicAuth, Dialer, DialerConfig, NETWORK_TCP};
use env_logger::{Builder, Env};
use log::info;
use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Parser)]
struct SimpleArgs {
    /// Proxy connection string, [scheme://][user[:password]@]host[:port]
    #[arg(short, long, env = "CONNECT_DIAL_PROXY")]
    proxy: String,

    /// Proxy user, overrides credentials in the connection string
    #[arg(short, long, env = "CONNECT_DIAL_USER")]
    user: Option<String>,

    /// Proxy password
    #[arg(long, env = "CONNECT_DIAL_PASSWORD", requires = "user")]
    password: Option<String>,

    /// Seconds to wait for the proxy connection
    #[arg(long, default_value = "10")]
    timeout: u64,

    /// Destination host:port
    #[arg(default_value = "example.com:80")]
    target: String,
}

fn init_logger() {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    builder.format(|buf, record| writeln!(buf, "{} {}", record.level(), record.args()));
    builder.init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();
    let args = SimpleArgs::parse();

    let mut config = DialerConfig::new(args.proxy.as_str());
    if let Some(user) = args.user {
        config = match args.password {
            Some(password) => config.with_auth(BasicAuth::new(user, password)),
            None => config.with_auth(BasicAuth::without_password(user)),
        };
    }
    let dialer = Dialer::new(config)?;

    let mut tunnel = dialer
        .dial_timeout(Duration::from_secs(args.timeout), NETWORK_TCP, &args.target)
        .await
        .with_context(|| format!("dialing {} through {}", args.target, dialer.target()))?;
    info!("tunnel to {} established", args.target);

    let host = args.target.rsplit_once(':').map_or(args.target.as_str(), |(host, _)| host);
    let request = format!("GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", host);
    tunnel.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    tunnel.read_to_end(&mut response).await?;
    let response = String::from_utf8_lossy(&response);
    println!("{}", response.lines().next().unwrap_or_default());
    Ok(())
}
