// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The owner-facing session surface.
//!
//! [`Session::start`] spawns the session actor and hands back a
//! command handle plus the notification channel. Commands are async
//! methods that resolve when the state machine answers; stanzas and
//! stream-level notifications arrive on [`SessionEvents`] whenever the
//! server feels like it.

use core::time::Duration;

use minidom::Element;
use rand::{rngs::StdRng, SeedableRng};
use tokio::sync::{mpsc, oneshot};

use crate::config::{AuthMethod, SessionOptions, SocketType, StreamVersion};
use crate::error::{ConfigError, Error};
use crate::event::SessionEvent;
use crate::features::StreamFeatures;
use crate::jid::Jid;
use crate::transport::{Connector, DnsConfig, PropertyValue, TcpConnector};

pub(crate) mod dispatch;
pub(crate) mod driver;
pub(crate) mod fsm;

use fsm::{Answer, Command, Responder};

/// Default timeout for blocking commands (connect phase, login,
/// registration).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the owner notification channel.
const EVENT_QUEUE_DEPTH: usize = 64;

/// What a successful connect reports back.
#[derive(Debug, Clone)]
pub struct Connected {
    /// The server-assigned stream id (needed by legacy digest
    /// authentication); empty when the server did not assign one.
    pub stream_id: String,
    /// The negotiated stream features; `None` on legacy `(0,0)`
    /// streams.
    pub features: Option<StreamFeatures>,
}

/// Command handle to a running session.
///
/// Cloning is cheap; all clones talk to the same session actor. The
/// session terminates when [`Session::stop`] is called or every handle
/// is dropped.
#[derive(Clone)]
pub struct Session {
    tx: mpsc::Sender<Command>,
}

/// Receiving side of the owner notifications.
pub struct SessionEvents {
    rx: mpsc::Receiver<SessionEvent>,
}

impl SessionEvents {
    /// Wait for the next notification; `None` once the session is
    /// gone.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }
}

impl Session {
    /// Spawn a new session speaking the given stream dialect.
    pub fn start(version: StreamVersion) -> (Session, SessionEvents) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let fsm = fsm::Fsm::new(version, StdRng::from_entropy());
        tokio::spawn(driver::Driver::new(fsm, cmd_rx, event_tx).run());
        (
            Session { tx: cmd_tx },
            SessionEvents { rx: event_rx },
        )
    }

    async fn request(
        &self,
        make: impl FnOnce(Responder) -> Command,
    ) -> Result<Answer, Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| Error::Disconnected)?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Store credentials; valid in `Setup` and `StreamOpened`.
    pub async fn set_credentials(&self, jid: &str, password: &str) -> Result<(), Error> {
        let jid = parse_jid(jid)?;
        let password = password.to_owned();
        self.request(move |reply| Command::SetCredentials {
            jid,
            password,
            reply,
        })
        .await
        .map(drop)
    }

    /// Select the authentication method; valid in `Setup` and
    /// `StreamOpened`.
    pub async fn set_auth_method(&self, method: AuthMethod) -> Result<(), Error> {
        self.request(move |reply| Command::SetAuthMethod { method, reply })
            .await
            .map(drop)
    }

    /// Store credentials and method in one go.
    pub async fn set_auth(
        &self,
        method: AuthMethod,
        jid: &str,
        password: &str,
    ) -> Result<(), Error> {
        self.set_credentials(jid, password).await?;
        self.set_auth_method(method).await
    }

    /// Open a stream over TCP.
    ///
    /// `host` is looked up through `_xmpp-client._tcp` SRV records
    /// first, falling back to a direct connection on `port`. The
    /// stream `to=` domain comes from `options.domain` or, when unset,
    /// from the credentials.
    pub async fn connect_tcp(
        &self,
        host: &str,
        port: u16,
        options: SessionOptions,
    ) -> Result<Connected, Error> {
        let connector = TcpConnector::from(DnsConfig::srv(host, "_xmpp-client._tcp", port));
        self.connect_with(Box::new(connector), options).await
    }

    /// Open a stream over TLS-on-connect (legacy port 5223 style).
    pub async fn connect_tls(
        &self,
        host: &str,
        port: u16,
        mut options: SessionOptions,
    ) -> Result<Connected, Error> {
        options.socket_type = SocketType::Tls;
        self.connect_tcp(host, port, options).await
    }

    /// Open a stream over an externally provided transport; this is
    /// the attach point for BOSH bindings and other custom channels.
    pub async fn connect_with(
        &self,
        connector: Box<dyn Connector>,
        options: SessionOptions,
    ) -> Result<Connected, Error> {
        match self
            .request(move |reply| Command::Connect {
                connector,
                options,
                reply,
            })
            .await?
        {
            Answer::Connected(connected) => Ok(connected),
            _ => Err(Error::InvalidState),
        }
    }

    /// Authenticate with the configured method and a default timeout.
    pub async fn login(&self) -> Result<Jid, Error> {
        self.login_with(None, DEFAULT_TIMEOUT).await
    }

    /// Authenticate with an explicit mechanism (`"PLAIN"`,
    /// `"ANONYMOUS"`, `"DIGEST-MD5"`, or `"password"`/`"digest"` for
    /// the legacy exchange) and timeout.
    pub async fn login_with(
        &self,
        mechanism: Option<&str>,
        timeout: Duration,
    ) -> Result<Jid, Error> {
        let mechanism = mechanism.map(str::to_owned);
        match self
            .request(move |reply| Command::Login {
                mechanism,
                timeout,
                reply,
            })
            .await?
        {
            Answer::Jid(jid) => Ok(jid),
            _ => Err(Error::InvalidState),
        }
    }

    /// Register an account in-band (XEP-0077), using the node of the
    /// configured JID as username.
    pub async fn register_account(&self, password: &str) -> Result<(), Error> {
        self.register(None, password).await
    }

    /// Register an account in-band with an explicit username.
    pub async fn register_account_as(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(), Error> {
        self.register(Some(username.to_owned()), password).await
    }

    async fn register(&self, username: Option<String>, password: &str) -> Result<(), Error> {
        let password = password.to_owned();
        self.request(move |reply| Command::Register {
            username,
            password,
            reply,
        })
        .await
        .map(drop)
    }

    /// Send a stanza; assigns an id when none is present and returns
    /// the id in effect.
    pub async fn send_packet(&self, stanza: Element) -> Result<String, Error> {
        match self
            .request(move |reply| Command::Send { stanza, reply })
            .await?
        {
            Answer::PacketId(id) => Ok(id),
            _ => Err(Error::InvalidState),
        }
    }

    /// Query a transport property (`encrypted`, `compressed`, `kind`,
    /// `peer_addr`, `local_addr`).
    pub async fn get_connection_property(&self, name: &str) -> Result<PropertyValue, Error> {
        let name = name.to_owned();
        match self
            .request(move |reply| Command::GetProperty { name, reply })
            .await?
        {
            Answer::Property(value) => Ok(value),
            _ => Err(Error::InvalidState),
        }
    }

    /// Redirect stanza notifications to another channel.
    pub async fn set_controlling_process(
        &self,
        owner: mpsc::Sender<SessionEvent>,
    ) -> Result<(), Error> {
        self.request(move |reply| Command::SetOwner { owner, reply })
            .await
            .map(drop)
    }

    /// Terminate the session. Idempotent: stopping a session that is
    /// already gone succeeds.
    pub async fn stop(&self) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Command::Stop {
                reply: Some(reply),
            })
            .await
            .is_err()
        {
            return Ok(());
        }
        match rx.await {
            Ok(result) => result.map(drop),
            Err(_) => Ok(()),
        }
    }
}

fn parse_jid(jid: &str) -> Result<Jid, Error> {
    Jid::new(jid).map_err(|_| ConfigError::IncorrectJid.into())
}
