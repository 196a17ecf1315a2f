// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Session credentials and recognized configuration options.

use core::time::Duration;
use std::net::IpAddr;

use crate::jid::Jid;

/// Authentication method selected for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMethod {
    /// Legacy jabber:iq:auth with the password sent in clear
    Password,
    /// Legacy jabber:iq:auth with a SHA-1 digest over the stream id
    Digest,
    /// SASL PLAIN
    Plain,
    /// SASL ANONYMOUS
    Anonymous,
    /// SASL DIGEST-MD5
    DigestMd5,
    /// Nothing selected yet; login commands are refused
    #[default]
    Unset,
}

impl AuthMethod {
    /// Whether this method goes through SASL negotiation rather than
    /// the legacy jabber:iq:auth exchange.
    pub fn is_sasl(self) -> bool {
        matches!(
            self,
            AuthMethod::Plain | AuthMethod::Anonymous | AuthMethod::DigestMd5
        )
    }

    /// The SASL mechanism name for SASL methods.
    pub fn mechanism_name(self) -> Option<&'static str> {
        match self {
            AuthMethod::Plain => Some("PLAIN"),
            AuthMethod::Anonymous => Some("ANONYMOUS"),
            AuthMethod::DigestMd5 => Some("DIGEST-MD5"),
            _ => None,
        }
    }
}

/// Version announced in the outgoing stream header.
///
/// `(1,0)` is required for SASL, STARTTLS and stream compression;
/// `(0,0)` selects the pre-RFC legacy dialect where the server answers
/// the header directly and authentication goes through jabber:iq:auth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamVersion {
    /// Legacy streams without feature negotiation
    V0_0,
    /// RFC 6120 streams
    #[default]
    V1_0,
}

/// Account credentials.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Jabber-Id; the node part doubles as the username
    pub jid: Jid,
    /// Password in clear
    pub password: String,
}

/// Whether a negotiable stream facility should be used when offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UsePolicy {
    /// Negotiate when the server offers it
    #[default]
    Enabled,
    /// Never negotiate, even if the server marks it required
    Disabled,
}

impl UsePolicy {
    pub(crate) fn enabled(self) -> bool {
        self == UsePolicy::Enabled
    }
}

/// Socket flavour for the initial connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketType {
    /// Plain TCP (STARTTLS may upgrade it later)
    #[default]
    Plain,
    /// TLS from the first byte (legacy port 5223 style)
    Tls,
}

/// Recognized session options.
///
/// The defaults match what a client wants against a modern server:
/// STARTTLS and compression negotiated when offered, no whitespace
/// keepalive, five second connect timeout.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// STARTTLS negotiation policy
    pub starttls: UsePolicy,
    /// XEP-0138 zlib compression policy
    pub compression: UsePolicy,
    /// Idle interval after which a single space byte is written in
    /// `LoggedIn`; `None` disables the keepalive
    pub whitespace_ping: Option<Duration>,
    /// Timeout for the connect phase and the default for blocking
    /// commands
    pub timeout: Duration,
    /// Override for the XMPP domain (stream `to=`), independent of the
    /// transport endpoint
    pub domain: Option<String>,
    /// Source address to bind before connecting
    pub local_ip: Option<IpAddr>,
    /// Source port to bind before connecting
    pub local_port: Option<u16>,
    /// Plain TCP or TLS-on-connect
    pub socket_type: SocketType,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            starttls: UsePolicy::Enabled,
            compression: UsePolicy::Enabled,
            whitespace_ping: None,
            timeout: Duration::from_secs(5),
            domain: None,
            local_ip: None,
            local_port: None,
            socket_type: SocketType::Plain,
        }
    }
}
