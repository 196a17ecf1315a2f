// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Transports for the session core.
//!
//! A [`Transport`] is the established byte channel plus the two
//! in-place upgrades the protocol can ask for: a TLS handshake after
//! `<proceed/>` and a zlib wrap after `<compressed/>`. New connections
//! are produced by a [`Connector`]; the crate ships TCP (plain and
//! TLS-on-connect), and anything else, BOSH in particular, attaches
//! by implementing the trait.

use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::io;
use std::net::SocketAddr;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::config::SessionOptions;
use crate::error::{Error, TransportError};

pub mod compress;
pub mod dns;
pub mod tcp;
pub(crate) mod tls;

pub use dns::DnsConfig;
pub use tcp::TcpConnector;

use compress::ZlibStream;

/// Object-safe bound for the boxed byte streams carried by custom
/// transports.
pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadAndWrite for T {}

/// What kind of channel a [`Transport`] runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Plain or upgraded TCP
    Tcp,
    /// TLS, either on-connect or via STARTTLS
    Tls,
    /// Externally provided transport (BOSH bindings and the like)
    Custom(&'static str),
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransportKind::Tcp => f.write_str("tcp"),
            TransportKind::Tls => f.write_str("tls"),
            TransportKind::Custom(name) => f.write_str(name),
        }
    }
}

/// Value of a transport property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Bool(bool),
    Text(String),
}

enum TransportStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Zlib(Box<ZlibStream<Box<dyn AsyncReadAndWrite>>>),
    Custom(Box<dyn AsyncReadAndWrite>),
}

/// An established byte channel with its upgrade state.
pub struct Transport {
    stream: TransportStream,
    kind: TransportKind,
    encrypted: bool,
    compressed: bool,
    whitespace_ping: bool,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

impl Transport {
    /// Wrap a plain TCP connection.
    pub fn plain(stream: TcpStream) -> Transport {
        let peer_addr = stream.peer_addr().ok();
        let local_addr = stream.local_addr().ok();
        Transport {
            stream: TransportStream::Tcp(stream),
            kind: TransportKind::Tcp,
            encrypted: false,
            compressed: false,
            whitespace_ping: true,
            peer_addr,
            local_addr,
        }
    }

    /// Wrap a TLS-on-connect connection.
    pub fn direct_tls(stream: TlsStream<TcpStream>) -> Transport {
        let (tcp, _) = stream.get_ref();
        let peer_addr = tcp.peer_addr().ok();
        let local_addr = tcp.local_addr().ok();
        Transport {
            stream: TransportStream::Tls(Box::new(stream)),
            kind: TransportKind::Tls,
            encrypted: true,
            compressed: false,
            whitespace_ping: true,
            peer_addr,
            local_addr,
        }
    }

    /// Wrap an externally established channel.
    ///
    /// `whitespace_ping` should be `false` for transports where a
    /// stray space byte carries no meaning (BOSH).
    pub fn custom(
        stream: Box<dyn AsyncReadAndWrite>,
        kind: &'static str,
        encrypted: bool,
        whitespace_ping: bool,
    ) -> Transport {
        Transport {
            stream: TransportStream::Custom(stream),
            kind: TransportKind::Custom(kind),
            encrypted,
            compressed: false,
            whitespace_ping,
            peer_addr: None,
            local_addr: None,
        }
    }

    /// Has TLS been engaged on this channel? Monotonic.
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Has zlib compression been engaged? Monotonic.
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Perform the in-place TLS handshake after `<proceed/>`.
    pub async fn starttls(mut self, domain: &str) -> Result<Transport, Error> {
        match self.stream {
            TransportStream::Tcp(stream) => {
                let tls_stream = tls::upgrade(stream, domain)
                    .await
                    .map_err(|e| TransportError::CannotEncrypt(e.to_string()))?;
                self.stream = TransportStream::Tls(Box::new(tls_stream));
                self.kind = TransportKind::Tls;
                self.encrypted = true;
                Ok(self)
            }
            _ => Err(TransportError::CannotEncrypt(
                "transport cannot be upgraded to TLS".to_owned(),
            )
            .into()),
        }
    }

    /// Engage zlib compression after `<compressed/>`.
    pub fn compress(self) -> Result<Transport, Error> {
        if self.compressed {
            return Err(
                TransportError::CannotCompress("stream is already compressed".to_owned()).into(),
            );
        }
        let kind = self.kind;
        let encrypted = self.encrypted;
        let whitespace_ping = self.whitespace_ping;
        let peer_addr = self.peer_addr;
        let local_addr = self.local_addr;
        let inner: Box<dyn AsyncReadAndWrite> = match self.stream {
            TransportStream::Tcp(stream) => Box::new(stream),
            TransportStream::Tls(stream) => stream,
            TransportStream::Custom(stream) => stream,
            TransportStream::Zlib(_) => unreachable!("compressed flag was false"),
        };
        Ok(Transport {
            stream: TransportStream::Zlib(Box::new(ZlibStream::new(inner))),
            kind,
            encrypted,
            compressed: true,
            whitespace_ping,
            peer_addr,
            local_addr,
        })
    }

    /// Query a named transport property.
    pub fn get_property(&self, name: &str) -> Result<PropertyValue, Error> {
        match name {
            "encrypted" => Ok(PropertyValue::Bool(self.encrypted)),
            "compressed" => Ok(PropertyValue::Bool(self.compressed)),
            "kind" => Ok(PropertyValue::Text(self.kind.to_string())),
            "peer_addr" => self
                .peer_addr
                .map(|a| PropertyValue::Text(a.to_string()))
                .ok_or_else(|| TransportError::UnknownProperty(name.to_owned()).into()),
            "local_addr" => self
                .local_addr
                .map(|a| PropertyValue::Text(a.to_string()))
                .ok_or_else(|| TransportError::UnknownProperty(name.to_owned()).into()),
            other => Err(TransportError::UnknownProperty(other.to_owned()).into()),
        }
    }

    /// The keepalive payload, or `None` if pings are meaningless on
    /// this transport.
    pub fn whitespace_ping_payload(&self) -> Option<&'static str> {
        if self.whitespace_ping {
            Some(" ")
        } else {
            None
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Transport")
            .field("kind", &self.kind)
            .field("encrypted", &self.encrypted)
            .field("compressed", &self.compressed)
            .finish()
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            TransportStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            TransportStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            TransportStream::Zlib(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            TransportStream::Custom(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().stream {
            TransportStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            TransportStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            TransportStream::Zlib(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            TransportStream::Custom(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            TransportStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            TransportStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            TransportStream::Zlib(s) => Pin::new(s.as_mut()).poll_flush(cx),
            TransportStream::Custom(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            TransportStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            TransportStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            TransportStream::Zlib(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            TransportStream::Custom(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Trait called to establish a [`Transport`] towards an XMPP server.
///
/// `domain` is the XMPP domain the stream will be addressed to; the
/// connector is free to resolve it, ignore it, or pin an endpoint of
/// its own.
pub trait Connector: fmt::Debug + Send + Sync {
    /// Open the byte channel, ready for the stream header.
    fn connect<'a>(
        &'a self,
        domain: &'a str,
        options: &'a SessionOptions,
    ) -> BoxFuture<'a, Result<Transport, Error>>;
}
