// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! TCP connector, plain or TLS-on-connect.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use futures::future::BoxFuture;
use futures::FutureExt;
use log::debug;

use crate::config::{SessionOptions, SocketType};
use crate::error::{Error, TransportError};
use crate::transport::{dns::DnsConfig, tls, Connector, Transport};

/// Connect to an XMPP server over TCP.
///
/// With [`SocketType::Tls`] in the options the TLS handshake runs
/// before the first stream byte (the legacy port 5223 deployment);
/// otherwise the connection starts in plaintext and STARTTLS may
/// upgrade it later.
#[derive(Debug, Clone)]
pub struct TcpConnector(pub DnsConfig);

impl From<DnsConfig> for TcpConnector {
    fn from(dns_config: DnsConfig) -> TcpConnector {
        Self(dns_config)
    }
}

impl TcpConnector {
    async fn open(&self, domain: &str, options: &SessionOptions) -> Result<Transport, Error> {
        let local = local_addr(options);
        debug!("connecting to {} (local bind: {:?})", self.0, local);
        let stream = self.0.resolve(local).await?;

        match options.socket_type {
            SocketType::Plain => Ok(Transport::plain(stream)),
            SocketType::Tls => {
                let tls_stream = tls::upgrade(stream, domain)
                    .await
                    .map_err(|e| TransportError::CannotEncrypt(e.to_string()))?;
                Ok(Transport::direct_tls(tls_stream))
            }
        }
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(
        &'a self,
        domain: &'a str,
        options: &'a SessionOptions,
    ) -> BoxFuture<'a, Result<Transport, Error>> {
        self.open(domain, options).boxed()
    }
}

fn local_addr(options: &SessionOptions) -> Option<SocketAddr> {
    match (options.local_ip, options.local_port) {
        (None, None) => None,
        (ip, port) => Some(SocketAddr::new(
            ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            port.unwrap_or(0),
        )),
    }
}
