// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The session state machine.
//!
//! [`Fsm::handle`] is the single transition function: it consumes one
//! [`Input`] (owner command, parsed packet, transport notification or
//! timer) and returns the [`Action`]s the driver must perform, in
//! order. The function does no IO itself, which keeps every transition
//! unit-testable without sockets.

use core::time::Duration;
use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::{debug, trace, warn};
use minidom::Element;
use rand::{rngs::StdRng, Rng};
use sha1::{Digest, Sha1};
use tokio::sync::{mpsc, oneshot};
use xmpp_parsers::bind::{BindQuery, BindResponse};

use crate::codec::Packet;
use crate::config::{AuthMethod, Credentials, SessionOptions, StreamVersion};
use crate::error::{
    CommandError, ConfigError, Error, ProtocolError, StreamErrorCondition, TransportError,
};
use crate::event::SessionEvent;
use crate::features::StreamFeatures;
use crate::jid::Jid;
use crate::ns;
use crate::sasl::{mechanism_for, Mechanism};
use crate::session::dispatch;
use crate::session::Connected;
use crate::transport::{Connector, PropertyValue};

/// Prefix of generated stanza and stream ids.
const ID_PREFIX: &str = "session";

/// Session states. Terminal are `StreamClosed` and `StreamError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Setup,
    WaitForStream,
    WaitForStreamFeatures,
    WaitForStarttlsResult,
    WaitForCompressionResult,
    WaitForBindResponse,
    WaitForSessionResponse,
    StreamOpened,
    WaitForLegacyAuthMethod,
    WaitForAuthResult,
    WaitForSaslResponse,
    WaitForRegisterResult,
    LoggedIn,
    StreamError,
    StreamClosed,
}

/// Value carried by a successful command reply.
#[derive(Debug)]
pub(crate) enum Answer {
    Unit,
    Connected(Connected),
    Jid(Jid),
    PacketId(String),
    Property(PropertyValue),
}

pub(crate) type Responder = oneshot::Sender<Result<Answer, Error>>;

/// Owner commands, one per [`crate::Session`] method.
#[derive(Debug)]
pub(crate) enum Command {
    SetCredentials {
        jid: Jid,
        password: String,
        reply: Responder,
    },
    SetAuthMethod {
        method: AuthMethod,
        reply: Responder,
    },
    Connect {
        connector: Box<dyn Connector>,
        options: SessionOptions,
        reply: Responder,
    },
    Login {
        mechanism: Option<String>,
        timeout: Duration,
        reply: Responder,
    },
    Register {
        username: Option<String>,
        password: String,
        reply: Responder,
    },
    Send {
        stanza: Element,
        reply: Responder,
    },
    GetProperty {
        name: String,
        reply: Responder,
    },
    SetOwner {
        owner: mpsc::Sender<SessionEvent>,
        reply: Responder,
    },
    Stop {
        reply: Option<Responder>,
    },
}

/// Transport upgrades the driver can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Upgrade {
    Tls,
    Compression,
}

/// Everything that can drive the state machine.
#[derive(Debug)]
pub(crate) enum Input {
    Cmd(Command),
    /// The connector produced a transport
    Connected { encrypted: bool },
    /// The connector failed or timed out
    ConnectFailed(Error),
    /// A transport upgrade finished
    UpgradeDone(Upgrade),
    /// A transport upgrade failed
    UpgradeFailed(Upgrade, Error),
    /// One parsed unit from the wire
    Parsed(Packet),
    /// The stream could not be tokenized
    ParseError(Error),
    /// Hard IO error on the transport
    Io(std::io::Error),
    /// Transport EOF without a stream footer
    Eof,
    /// No input arrived within the whitespace-ping interval
    IdleTimeout,
    /// The blocked caller's timeout expired
    PendingTimeout,
}

/// IO the driver performs on behalf of a transition.
#[derive(Debug)]
pub(crate) enum Action {
    /// Establish a transport via the connector
    Connect {
        connector: Box<dyn Connector>,
        domain: String,
        options: SessionOptions,
    },
    /// Send a stream header on the (fresh) framed transport
    OpenStream { to: String, version: StreamVersion },
    /// Discard parser state, then send a stream header
    RestartStream { to: String, version: StreamVersion },
    /// Upgrade the transport to TLS, resetting the parser
    StartTls { domain: String },
    /// Wrap the transport in zlib, resetting the parser
    StartCompression,
    /// Write one packet
    Send(Packet),
    /// Emit the keepalive byte, if the transport has one
    WhitespacePing,
    /// Resolve a caller
    Reply {
        reply: Responder,
        result: Result<Answer, Error>,
    },
    /// Ask the transport for a property and resolve the caller
    QueryProperty { name: String, reply: Responder },
    /// Push a notification to the owner
    Dispatch(SessionEvent),
    /// Redirect owner notifications
    SetOwner(mpsc::Sender<SessionEvent>),
    /// (Re-)arm the pending-command timer
    ArmPendingTimer(Duration),
    /// Tear the session down; optionally send the stream footer first
    Close { send_footer: bool },
}

struct Pending {
    reply: Responder,
}

/// The session core: one instance per session.
pub(crate) struct Fsm {
    state: State,
    stream_version: StreamVersion,
    credentials: Option<Credentials>,
    auth_method: AuthMethod,
    options: SessionOptions,
    domain: Option<String>,
    authenticated: bool,
    encrypted: bool,
    compressed: bool,
    stream_id: Option<String>,
    features: Option<StreamFeatures>,
    pending: Option<Pending>,
    sasl: Option<Box<dyn Mechanism + Send>>,
    /// id of the in-flight internally generated iq
    expected_iq: Option<String>,
    /// resource used for legacy authentication
    auth_resource: Option<String>,
    bound_jid: Option<Jid>,
    last_stream_error: Option<StreamErrorCondition>,
    rng: StdRng,
}

impl Fsm {
    pub(crate) fn new(stream_version: StreamVersion, rng: StdRng) -> Fsm {
        Fsm {
            state: State::Setup,
            stream_version,
            credentials: None,
            auth_method: AuthMethod::Unset,
            options: SessionOptions::default(),
            domain: None,
            authenticated: false,
            encrypted: false,
            compressed: false,
            stream_id: None,
            features: None,
            pending: None,
            sasl: None,
            expected_iq: None,
            auth_resource: None,
            bound_jid: None,
            last_stream_error: None,
            rng,
        }
    }

    pub(crate) fn state(&self) -> State {
        self.state
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// The whitespace-ping interval, when the timer should be armed.
    pub(crate) fn idle_interval(&self) -> Option<Duration> {
        if self.state == State::LoggedIn {
            self.options.whitespace_ping
        } else {
            None
        }
    }

    pub(crate) fn last_stream_error(&self) -> Option<&StreamErrorCondition> {
        self.last_stream_error.as_ref()
    }

    /// The single transition function.
    pub(crate) fn handle(&mut self, input: Input) -> Vec<Action> {
        match input {
            Input::Cmd(cmd) => self.on_command(cmd),
            Input::Connected { encrypted } => self.on_connected(encrypted),
            Input::ConnectFailed(error) => self.on_connect_failed(error),
            Input::UpgradeDone(upgrade) => self.on_upgrade_done(upgrade),
            Input::UpgradeFailed(upgrade, error) => self.on_upgrade_failed(upgrade, error),
            Input::Parsed(Packet::StreamStart(attrs)) => self.on_stream_start(attrs),
            Input::Parsed(Packet::Stanza(element)) => self.on_element(element),
            Input::Parsed(Packet::Text(_)) => Vec::new(),
            Input::Parsed(Packet::StreamEnd) => self.on_stream_end(),
            Input::ParseError(error) => self.on_parse_error(error),
            Input::Io(error) => self.on_io_error(error),
            Input::Eof => self.on_eof(),
            Input::IdleTimeout => self.on_idle_timeout(),
            Input::PendingTimeout => self.on_pending_timeout(),
        }
    }

    fn make_id(&mut self) -> String {
        format!("{}-{}", ID_PREFIX, self.rng.gen::<u64>())
    }

    fn reply_pending(&mut self, result: Result<Answer, Error>) -> Vec<Action> {
        match self.pending.take() {
            Some(pending) => vec![Action::Reply {
                reply: pending.reply,
                result,
            }],
            None => Vec::new(),
        }
    }

    // ---- owner commands -------------------------------------------------

    fn on_command(&mut self, cmd: Command) -> Vec<Action> {
        match cmd {
            Command::SetCredentials {
                jid,
                password,
                reply,
            } => {
                if !matches!(self.state, State::Setup | State::StreamOpened) {
                    return refuse(reply, CommandError::Unallowed);
                }
                self.credentials = Some(Credentials { jid, password });
                vec![ok(reply)]
            }
            Command::SetAuthMethod { method, reply } => {
                if !matches!(self.state, State::Setup | State::StreamOpened) {
                    return refuse(reply, CommandError::Unallowed);
                }
                self.auth_method = method;
                vec![ok(reply)]
            }
            Command::Connect {
                connector,
                options,
                reply,
            } => self.on_connect_cmd(connector, options, reply),
            Command::Login {
                mechanism,
                timeout,
                reply,
            } => self.on_login_cmd(mechanism, timeout, reply),
            Command::Register {
                username,
                password,
                reply,
            } => self.on_register_cmd(username, password, reply),
            Command::Send { stanza, reply } => self.on_send_cmd(stanza, reply),
            Command::GetProperty { name, reply } => vec![Action::QueryProperty { name, reply }],
            Command::SetOwner { owner, reply } => vec![Action::SetOwner(owner), ok(reply)],
            Command::Stop { reply } => self.on_stop_cmd(reply),
        }
    }

    fn on_connect_cmd(
        &mut self,
        connector: Box<dyn Connector>,
        options: SessionOptions,
        reply: Responder,
    ) -> Vec<Action> {
        if self.state != State::Setup {
            return refuse(reply, CommandError::Unallowed);
        }
        if self.pending.is_some() {
            return refuse(reply, CommandError::BusyConnectingToServer);
        }
        let domain = options
            .domain
            .clone()
            .or_else(|| self.credentials.as_ref().map(|c| c.jid.domain().to_string()));
        let domain = match domain {
            Some(domain) => domain,
            None => {
                return vec![Action::Reply {
                    reply,
                    result: Err(ConfigError::AuthenticationOrDomainUndefined.into()),
                }]
            }
        };
        debug!("connecting to {}", domain);
        self.options = options.clone();
        self.domain = Some(domain.clone());
        self.pending = Some(Pending { reply });
        vec![Action::Connect {
            connector,
            domain,
            options,
        }]
    }

    fn on_connected(&mut self, encrypted: bool) -> Vec<Action> {
        // TLS-on-connect transports arrive already encrypted.
        self.encrypted |= encrypted;
        self.state = State::WaitForStream;
        vec![
            Action::OpenStream {
                to: self.domain.clone().unwrap_or_default(),
                version: self.stream_version,
            },
            Action::ArmPendingTimer(self.options.timeout),
        ]
    }

    fn on_connect_failed(&mut self, error: Error) -> Vec<Action> {
        debug!("connect failed: {}", error);
        self.state = State::Setup;
        self.domain = None;
        self.reply_pending(Err(error))
    }

    fn on_login_cmd(
        &mut self,
        mechanism: Option<String>,
        timeout: Duration,
        reply: Responder,
    ) -> Vec<Action> {
        match self.state {
            State::StreamOpened => (),
            State::Setup | State::StreamError | State::StreamClosed => {
                return refuse(reply, CommandError::NotConnected)
            }
            State::LoggedIn => return refuse(reply, CommandError::Unallowed),
            _ => {
                return if self.pending.is_some() {
                    refuse(reply, CommandError::BusyConnectingToServer)
                } else {
                    refuse(reply, CommandError::Unallowed)
                }
            }
        }
        if self.pending.is_some() {
            return refuse(reply, CommandError::BusyConnectingToServer);
        }

        enum Path {
            Sasl(String),
            Legacy { digest: bool },
        }

        let path = match mechanism.as_deref() {
            Some("PLAIN") => Path::Sasl("PLAIN".to_owned()),
            Some("ANONYMOUS") => Path::Sasl("ANONYMOUS".to_owned()),
            Some("DIGEST-MD5") => Path::Sasl("DIGEST-MD5".to_owned()),
            Some("digest") => Path::Legacy { digest: true },
            Some("password") | Some("basic") => Path::Legacy {
                digest: self.auth_method == AuthMethod::Digest,
            },
            Some(other) => {
                warn!("unknown login mechanism requested: {}", other);
                return vec![Action::Reply {
                    reply,
                    result: Err(ProtocolError::NoSupportedAuthMethod.into()),
                }];
            }
            None => match self.auth_method {
                AuthMethod::Unset => {
                    return vec![Action::Reply {
                        reply,
                        result: Err(ConfigError::AuthMethodUndefined.into()),
                    }]
                }
                AuthMethod::Password => Path::Legacy { digest: false },
                AuthMethod::Digest => Path::Legacy { digest: true },
                method => Path::Sasl(
                    method
                        .mechanism_name()
                        .expect("sasl methods have a mechanism name")
                        .to_owned(),
                ),
            },
        };

        match path {
            Path::Sasl(name) => self.start_sasl(name, timeout, reply),
            Path::Legacy { digest } => self.start_legacy_auth(digest, timeout, reply),
        }
    }

    fn start_sasl(&mut self, name: String, timeout: Duration, reply: Responder) -> Vec<Action> {
        // SASL runs on 1.0 streams only; a legacy stream never showed
        // us any features.
        let offered = match (&self.features, self.stream_version) {
            (Some(features), StreamVersion::V1_0) => features.has_mechanism(&name),
            _ => false,
        };
        if !offered {
            return vec![Action::Reply {
                reply,
                result: Err(ProtocolError::NoSupportedAuthMethod.into()),
            }];
        }
        if name != "ANONYMOUS" && self.credentials.is_none() {
            return vec![Action::Reply {
                reply,
                result: Err(ConfigError::AuthInfoUndefined.into()),
            }];
        }

        let cnonce: u128 = self.rng.gen();
        let domain = self.domain.clone().unwrap_or_default();
        let mut mech = match mechanism_for(
            &name,
            self.credentials.as_ref(),
            &domain,
            format!("{:032x}", cnonce),
        ) {
            Ok(mech) => mech,
            Err(error) => {
                return vec![Action::Reply {
                    reply,
                    result: Err(error),
                }]
            }
        };

        debug!("starting SASL authentication with {}", name);
        let initial = mech.initial();
        let auth = sasl_element("auth", &initial).attr("mechanism", &*name);
        self.sasl = Some(mech);
        self.pending = Some(Pending { reply });
        self.state = State::WaitForSaslResponse;
        vec![
            Action::Send(Packet::Stanza(auth.build())),
            Action::ArmPendingTimer(timeout),
        ]
    }

    fn start_legacy_auth(
        &mut self,
        digest: bool,
        timeout: Duration,
        reply: Responder,
    ) -> Vec<Action> {
        let username = match self
            .credentials
            .as_ref()
            .and_then(|c| c.jid.node().map(|n| n.to_string()))
        {
            Some(username) => username,
            None => {
                return vec![Action::Reply {
                    reply,
                    result: Err(ConfigError::AuthInfoUndefined.into()),
                }]
            }
        };
        if digest && self.auth_method != AuthMethod::Digest {
            // Explicit request overrides the configured method.
            self.auth_method = AuthMethod::Digest;
        } else if !digest && self.auth_method != AuthMethod::Password {
            self.auth_method = AuthMethod::Password;
        }

        debug!(
            "querying legacy auth fields for {} ({})",
            username,
            if digest { "digest" } else { "password" }
        );
        let id = self.make_id();
        let query = Element::builder("query", ns::LEGACY_AUTH)
            .append(Element::builder("username", ns::LEGACY_AUTH).append(username));
        let iq = iq_wrapper("get", &id).append(query).build();
        self.expected_iq = Some(id);
        self.pending = Some(Pending { reply });
        self.state = State::WaitForLegacyAuthMethod;
        vec![
            Action::Send(Packet::Stanza(iq)),
            Action::ArmPendingTimer(timeout),
        ]
    }

    fn on_register_cmd(
        &mut self,
        username: Option<String>,
        password: String,
        reply: Responder,
    ) -> Vec<Action> {
        if self.state != State::StreamOpened {
            return refuse(reply, CommandError::NotConnected);
        }
        if self.pending.is_some() {
            return refuse(reply, CommandError::BusyConnectingToServer);
        }
        let username = username.or_else(|| {
            self.credentials
                .as_ref()
                .and_then(|c| c.jid.node().map(|n| n.to_string()))
        });
        let username = match username {
            Some(username) => username,
            None => {
                return vec![Action::Reply {
                    reply,
                    result: Err(ConfigError::AuthInfoUndefined.into()),
                }]
            }
        };

        let id = self.make_id();
        let query = Element::builder("query", ns::REGISTER)
            .append(Element::builder("username", ns::REGISTER).append(username))
            .append(Element::builder("password", ns::REGISTER).append(password));
        let iq = iq_wrapper("set", &id).append(query).build();
        self.expected_iq = Some(id);
        self.pending = Some(Pending { reply });
        self.state = State::WaitForRegisterResult;
        vec![
            Action::Send(Packet::Stanza(iq)),
            Action::ArmPendingTimer(self.options.timeout),
        ]
    }

    fn on_send_cmd(&mut self, mut stanza: Element, reply: Responder) -> Vec<Action> {
        match self.state {
            State::StreamOpened | State::LoggedIn => (),
            State::Setup | State::StreamError | State::StreamClosed => {
                return refuse(reply, CommandError::NotConnected)
            }
            _ => return refuse(reply, CommandError::Unallowed),
        }
        let id = match stanza.attr("id") {
            Some(id) if !id.is_empty() => id.to_owned(),
            _ => {
                let id = self.make_id();
                stanza.set_attr("id", id.clone());
                id
            }
        };
        trace!("sending packet {}", id);
        vec![
            Action::Send(Packet::Stanza(stanza)),
            Action::Reply {
                reply,
                result: Ok(Answer::PacketId(id)),
            },
        ]
    }

    fn on_stop_cmd(&mut self, reply: Option<Responder>) -> Vec<Action> {
        debug!("session stop requested");
        if self.is_terminal() {
            // Already torn down; stop stays idempotent.
            let mut actions = vec![Action::Close { send_footer: false }];
            if let Some(reply) = reply {
                actions.push(ok(reply));
            }
            return actions;
        }
        let mut actions = self.reply_pending(Err(Error::Disconnected));
        self.state = State::StreamClosed;
        actions.push(Action::Dispatch(SessionEvent::Closed { reason: None }));
        actions.push(Action::Close { send_footer: true });
        if let Some(reply) = reply {
            actions.push(ok(reply));
        }
        actions
    }

    // ---- transport notifications ---------------------------------------

    fn on_upgrade_done(&mut self, upgrade: Upgrade) -> Vec<Action> {
        match upgrade {
            Upgrade::Tls => {
                debug!("TLS established, restarting stream");
                self.encrypted = true;
            }
            Upgrade::Compression => {
                debug!("zlib compression engaged, restarting stream");
                self.compressed = true;
            }
        }
        self.state = State::WaitForStream;
        // The upgrade already discarded the parser state; only the
        // fresh header is needed here.
        vec![Action::OpenStream {
            to: self.domain.clone().unwrap_or_default(),
            version: self.stream_version,
        }]
    }

    fn on_upgrade_failed(&mut self, upgrade: Upgrade, error: Error) -> Vec<Action> {
        warn!("transport upgrade failed: {}", error);
        let mut actions = self.reply_pending(Err(error));
        self.state = State::StreamClosed;
        actions.push(Action::Dispatch(SessionEvent::Closed {
            reason: Some(match upgrade {
                Upgrade::Tls => "could not encrypt stream".to_owned(),
                Upgrade::Compression => "could not compress stream".to_owned(),
            }),
        }));
        actions.push(Action::Close { send_footer: false });
        actions
    }

    // ---- parsed packets -------------------------------------------------

    fn on_stream_start(&mut self, attrs: HashMap<String, String>) -> Vec<Action> {
        if self.state != State::WaitForStream {
            return self.protocol_fatal(ProtocolError::InvalidStreamStart);
        }
        if let Some(id) = attrs.get("id") {
            self.stream_id = Some(id.clone());
        }
        let modern = attrs
            .get("version")
            .map(|v| v.starts_with("1."))
            .unwrap_or(false);
        if modern {
            self.state = State::WaitForStreamFeatures;
            return Vec::new();
        }

        // Legacy dialect: the stream is usable as soon as the header
        // arrives.
        debug!("legacy stream opened, id {:?}", self.stream_id);
        self.state = State::StreamOpened;
        let connected = Connected {
            stream_id: self.stream_id.clone().unwrap_or_default(),
            features: None,
        };
        self.reply_pending(Ok(Answer::Connected(connected)))
    }

    fn on_element(&mut self, element: Element) -> Vec<Action> {
        if element.is("error", ns::STREAM) {
            return self.on_stream_error(&element);
        }
        match self.state {
            State::WaitForStreamFeatures => {
                if element.is("features", ns::STREAM) {
                    self.on_features(&element)
                } else {
                    Vec::new()
                }
            }
            State::WaitForStarttlsResult => self.on_starttls_result(&element),
            State::WaitForCompressionResult => self.on_compression_result(&element),
            State::WaitForSaslResponse => self.on_sasl_element(&element),
            State::WaitForLegacyAuthMethod => self.on_legacy_fields(element),
            State::WaitForAuthResult => self.on_legacy_auth_result(element),
            State::WaitForBindResponse => self.on_bind_response(element),
            State::WaitForSessionResponse => self.on_session_response(element),
            State::WaitForRegisterResult => self.on_register_result(element),
            State::StreamOpened | State::LoggedIn => {
                vec![Action::Dispatch(dispatch::classify(element))]
            }
            State::WaitForStream => self.protocol_fatal(ProtocolError::InvalidStreamStart),
            State::Setup | State::StreamError | State::StreamClosed => Vec::new(),
        }
    }

    fn on_features(&mut self, element: &Element) -> Vec<Action> {
        let features = StreamFeatures::parse(element);
        trace!("stream features: {:?}", features);

        // TLS always comes before compression when both are offered.
        if !self.encrypted && features.can_starttls() && self.options.starttls.enabled() {
            self.features = Some(features);
            self.state = State::WaitForStarttlsResult;
            return vec![Action::Send(Packet::Stanza(
                Element::builder("starttls", ns::TLS).build(),
            ))];
        }
        if !self.encrypted && features.tls_required() && !self.options.starttls.enabled() {
            // The server insists, the configuration forbids: give up
            // before any authentication is attempted.
            warn!("server requires STARTTLS but it is disabled");
            let condition = StreamErrorCondition::PolicyViolation;
            self.last_stream_error = Some(condition.clone());
            self.features = Some(features);
            let mut actions =
                self.reply_pending(Err(ProtocolError::Stream(condition.clone()).into()));
            self.state = State::StreamError;
            actions.push(Action::Dispatch(SessionEvent::StreamError {
                condition,
                text: None,
            }));
            actions.push(Action::Close { send_footer: true });
            return actions;
        }
        if !self.compressed && features.offers_zlib() && self.options.compression.enabled() {
            self.features = Some(features);
            self.state = State::WaitForCompressionResult;
            let compress = Element::builder("compress", ns::COMPRESS)
                .append(Element::builder("method", ns::COMPRESS).append("zlib"));
            return vec![Action::Send(Packet::Stanza(compress.build()))];
        }

        if self.authenticated {
            if features.can_bind() {
                let id = self.make_id();
                let resource = self
                    .credentials
                    .as_ref()
                    .and_then(|c| c.jid.resource().map(|r| r.to_string()));
                let bind = Element::from(BindQuery::new(resource));
                let iq = iq_wrapper("set", &id).append(bind).build();
                self.expected_iq = Some(id);
                self.features = Some(features);
                self.state = State::WaitForBindResponse;
                return vec![Action::Send(Packet::Stanza(iq))];
            }
            // Nothing left to negotiate; unusual, but complete the
            // login with the identity we have.
            let jid = self.account_jid();
            self.features = Some(features);
            self.state = State::LoggedIn;
            return self.reply_pending(Ok(Answer::Jid(jid)));
        }

        let connected = Connected {
            stream_id: self.stream_id.clone().unwrap_or_default(),
            features: Some(features.clone()),
        };
        self.features = Some(features);
        self.state = State::StreamOpened;
        self.reply_pending(Ok(Answer::Connected(connected)))
    }

    fn on_starttls_result(&mut self, element: &Element) -> Vec<Action> {
        if element.is("proceed", ns::TLS) {
            return vec![Action::StartTls {
                domain: self.domain.clone().unwrap_or_default(),
            }];
        }
        if element.is("failure", ns::TLS) {
            return self.transport_fatal(
                TransportError::CannotEncrypt("server refused STARTTLS".to_owned()),
                "could not encrypt stream",
            );
        }
        Vec::new()
    }

    fn on_compression_result(&mut self, element: &Element) -> Vec<Action> {
        if element.is("compressed", ns::COMPRESS) {
            return vec![Action::StartCompression];
        }
        if element.is("failure", ns::COMPRESS) {
            let condition = element
                .children()
                .next()
                .map(|child| child.name().to_owned())
                .unwrap_or_else(|| "failure".to_owned());
            return self.transport_fatal(
                TransportError::CannotCompress(condition),
                "could not compress stream",
            );
        }
        Vec::new()
    }

    fn on_sasl_element(&mut self, element: &Element) -> Vec<Action> {
        if element.is("challenge", ns::SASL) {
            let data = match decode_b64(&element.text()) {
                Ok(data) => data,
                // The proper SASL condition for garbage base64.
                Err(_) => {
                    return self.sasl_failed(crate::error::AuthError::Fail(
                        "incorrect-encoding".to_owned(),
                    ))
                }
            };
            let response = match self.sasl.as_mut() {
                Some(mech) => mech.response(&data),
                None => {
                    return self.sasl_failed(crate::error::AuthError::Fail(
                        "temporary-auth-failure".to_owned(),
                    ))
                }
            };
            return match response {
                Ok(bytes) => vec![Action::Send(Packet::Stanza(
                    sasl_element("response", &bytes).build(),
                ))],
                Err(e) => self.sasl_failed(crate::error::AuthError::Sasl(e)),
            };
        }

        if element.is("success", ns::SASL) {
            let data = decode_b64(&element.text()).unwrap_or_default();
            if let Some(mech) = self.sasl.as_mut() {
                if let Err(e) = mech.success(&data) {
                    return self.sasl_failed(crate::error::AuthError::Sasl(e));
                }
            }
            debug!("SASL authentication succeeded, restarting stream");
            self.sasl = None;
            self.authenticated = true;
            self.state = State::WaitForStream;
            return vec![Action::RestartStream {
                to: self.domain.clone().unwrap_or_default(),
                version: self.stream_version,
            }];
        }

        if element.is("failure", ns::SASL) {
            let condition = element
                .children()
                .map(|child| child.name())
                .find(|name| *name != "text")
                .unwrap_or("undefined-condition")
                .to_owned();
            return self.sasl_failed(crate::error::AuthError::Fail(condition));
        }

        Vec::new()
    }

    fn sasl_failed(&mut self, error: crate::error::AuthError) -> Vec<Action> {
        debug!("SASL authentication failed, session stays open");
        self.sasl = None;
        // Recoverable: the caller may retry with another mechanism.
        self.state = State::StreamOpened;
        self.reply_pending(Err(error.into()))
    }

    fn on_legacy_fields(&mut self, element: Element) -> Vec<Action> {
        let iq = match self.match_expected_iq(element) {
            IqMatch::Matched(iq) => iq,
            IqMatch::Other(actions) => return actions,
        };
        match iq.attr("type") {
            Some("result") => (),
            Some("error") => {
                let condition = iq_error_condition(&iq);
                return self.auth_recoverable(crate::error::AuthError::Legacy(condition));
            }
            _ => {
                return self.auth_recoverable_protocol(ProtocolError::NotAuthMethodResult);
            }
        }
        let query = match iq.get_child("query", ns::LEGACY_AUTH) {
            Some(query) => query,
            None => return self.auth_recoverable_protocol(ProtocolError::NotAuthMethodResult),
        };

        let creds = match self.credentials.clone() {
            Some(creds) => creds,
            None => return self.auth_recoverable_protocol(ProtocolError::NoSupportedAuthMethod),
        };
        let username = match creds.jid.node() {
            Some(node) => node.to_string(),
            None => return self.auth_recoverable_protocol(ProtocolError::NoSupportedAuthMethod),
        };
        let resource = creds
            .jid
            .resource()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "xmpp-session".to_owned());

        let secret = if self.auth_method == AuthMethod::Digest {
            if !query.has_child("digest", ns::LEGACY_AUTH) {
                return self.auth_recoverable_protocol(ProtocolError::NoSupportedAuthMethod);
            }
            let stream_id = match self.stream_id.as_deref() {
                Some(id) if !id.is_empty() => id.to_owned(),
                _ => {
                    return self
                        .auth_recoverable_protocol(ProtocolError::NoStreamIdForDigestAuth)
                }
            };
            let digest = sha1_hex(&(stream_id + &creds.password));
            Element::builder("digest", ns::LEGACY_AUTH).append(digest)
        } else {
            if !query.has_child("password", ns::LEGACY_AUTH) {
                return self.auth_recoverable_protocol(ProtocolError::NoSupportedAuthMethod);
            }
            Element::builder("password", ns::LEGACY_AUTH).append(creds.password.clone())
        };

        debug!("submitting legacy credentials for {}", username);
        let id = self.make_id();
        let query = Element::builder("query", ns::LEGACY_AUTH)
            .append(Element::builder("username", ns::LEGACY_AUTH).append(username))
            .append(secret)
            .append(Element::builder("resource", ns::LEGACY_AUTH).append(resource.clone()));
        let iq = iq_wrapper("set", &id).append(query).build();
        self.expected_iq = Some(id);
        self.auth_resource = Some(resource);
        self.state = State::WaitForAuthResult;
        vec![Action::Send(Packet::Stanza(iq))]
    }

    fn on_legacy_auth_result(&mut self, element: Element) -> Vec<Action> {
        let iq = match self.match_expected_iq(element) {
            IqMatch::Matched(iq) => iq,
            IqMatch::Other(actions) => return actions,
        };
        match iq.attr("type") {
            Some("result") => {
                self.authenticated = true;
                let jid = self.account_jid();
                debug!("legacy authentication succeeded as {}", jid);
                self.state = State::LoggedIn;
                self.reply_pending(Ok(Answer::Jid(jid)))
            }
            _ => {
                let condition = iq_error_condition(&iq);
                self.auth_recoverable(crate::error::AuthError::Legacy(condition))
            }
        }
    }

    fn on_bind_response(&mut self, element: Element) -> Vec<Action> {
        let iq = match self.match_expected_iq(element) {
            IqMatch::Matched(iq) => iq,
            IqMatch::Other(actions) => return actions,
        };
        match iq.attr("type") {
            Some("result") => {
                let bound = iq
                    .get_child("bind", ns::BIND)
                    .cloned()
                    .and_then(|bind| BindResponse::try_from(bind).ok());
                let jid: Jid = match bound {
                    Some(response) => response.into(),
                    None => return self.protocol_fatal(ProtocolError::InvalidBindResponse),
                };
                debug!("bound as {}", jid);
                self.bound_jid = Some(jid);
                let id = self.make_id();
                let session = Element::builder("session", ns::SESSION);
                let iq = iq_wrapper("set", &id).append(session).build();
                self.expected_iq = Some(id);
                self.state = State::WaitForSessionResponse;
                vec![Action::Send(Packet::Stanza(iq))]
            }
            _ => {
                let condition = iq_error_condition(&iq);
                self.protocol_fatal(ProtocolError::BindFailed(condition))
            }
        }
    }

    fn on_session_response(&mut self, element: Element) -> Vec<Action> {
        let iq = match self.match_expected_iq(element) {
            IqMatch::Matched(iq) => iq,
            IqMatch::Other(actions) => return actions,
        };
        match iq.attr("type") {
            Some("result") => {
                let jid = self
                    .bound_jid
                    .clone()
                    .unwrap_or_else(|| self.account_jid());
                debug!("session established for {}", jid);
                self.state = State::LoggedIn;
                self.reply_pending(Ok(Answer::Jid(jid)))
            }
            _ => {
                let condition = iq_error_condition(&iq);
                self.protocol_fatal(ProtocolError::SessionFailed(condition))
            }
        }
    }

    fn on_register_result(&mut self, element: Element) -> Vec<Action> {
        let iq = match self.match_expected_iq(element) {
            IqMatch::Matched(iq) => iq,
            IqMatch::Other(actions) => return actions,
        };
        self.state = State::StreamOpened;
        match iq.attr("type") {
            Some("result") => {
                debug!("account registration succeeded");
                self.reply_pending(Ok(Answer::Unit))
            }
            _ => {
                let condition = iq_error_condition(&iq);
                self.reply_pending(Err(crate::error::AuthError::Register(condition).into()))
            }
        }
    }

    // ---- stream-level events -------------------------------------------

    fn on_stream_error(&mut self, element: &Element) -> Vec<Action> {
        let condition = element
            .children()
            .map(|child| child.name())
            .find(|name| *name != "text")
            .map(StreamErrorCondition::from_name)
            .unwrap_or(StreamErrorCondition::UndefinedCondition);
        let text = element
            .children()
            .find(|child| child.name() == "text")
            .map(|child| child.text());
        warn!("stream error from peer: {}", condition);

        self.last_stream_error = Some(condition.clone());
        let mut actions =
            self.reply_pending(Err(ProtocolError::Stream(condition.clone()).into()));
        self.state = State::StreamError;
        actions.push(Action::Dispatch(SessionEvent::StreamError {
            condition,
            text,
        }));
        actions.push(Action::Close { send_footer: true });
        actions
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state, State::StreamError | State::StreamClosed)
    }

    fn on_stream_end(&mut self) -> Vec<Action> {
        if self.is_terminal() {
            return Vec::new();
        }
        debug!("peer closed the stream");
        let mut actions = self.reply_pending(Err(TransportError::Closed.into()));
        self.state = State::StreamClosed;
        actions.push(Action::Dispatch(SessionEvent::Closed {
            reason: Some("stream closed by peer".to_owned()),
        }));
        actions.push(Action::Close { send_footer: true });
        actions
    }

    fn on_parse_error(&mut self, error: Error) -> Vec<Action> {
        if self.is_terminal() {
            return Vec::new();
        }
        warn!("cannot parse incoming stream: {}", error);
        let mut actions = self.reply_pending(Err(error));
        self.state = State::StreamError;
        // Tell the peer why we are leaving before closing the stream.
        let condition =
            Element::builder("not-well-formed", "urn:ietf:params:xml:ns:xmpp-streams");
        let stream_error = Element::builder("error", ns::STREAM)
            .append(condition)
            .build();
        actions.push(Action::Send(Packet::Stanza(stream_error)));
        actions.push(Action::Dispatch(SessionEvent::Closed {
            reason: Some("received malformed XML".to_owned()),
        }));
        actions.push(Action::Close { send_footer: true });
        actions
    }

    fn on_io_error(&mut self, error: std::io::Error) -> Vec<Action> {
        if self.is_terminal() {
            return Vec::new();
        }
        debug!("transport error: {}", error);
        let mut actions = self.reply_pending(Err(error.into()));
        self.state = State::StreamClosed;
        actions.push(Action::Dispatch(SessionEvent::Closed {
            reason: Some("transport error".to_owned()),
        }));
        actions.push(Action::Close { send_footer: false });
        actions
    }

    fn on_eof(&mut self) -> Vec<Action> {
        if self.is_terminal() {
            return Vec::new();
        }
        debug!("transport closed by peer");
        let mut actions = self.reply_pending(Err(TransportError::Closed.into()));
        self.state = State::StreamClosed;
        actions.push(Action::Dispatch(SessionEvent::Closed {
            reason: Some("tcp closed".to_owned()),
        }));
        actions.push(Action::Close { send_footer: false });
        actions
    }

    fn on_idle_timeout(&mut self) -> Vec<Action> {
        if self.state == State::LoggedIn {
            trace!("idle, sending whitespace ping");
            vec![Action::WhitespacePing]
        } else {
            Vec::new()
        }
    }

    fn on_pending_timeout(&mut self) -> Vec<Action> {
        warn!("blocked command timed out");
        let mut actions = self.reply_pending(Err(Error::Timeout));
        self.state = State::StreamError;
        actions.push(Action::Dispatch(SessionEvent::Closed {
            reason: Some("negotiation timeout".to_owned()),
        }));
        actions.push(Action::Close { send_footer: true });
        actions
    }

    // ---- helpers --------------------------------------------------------

    /// The best identity we can report without a server-assigned JID.
    fn account_jid(&self) -> Jid {
        if let Some(jid) = &self.bound_jid {
            return jid.clone();
        }
        if let Some(creds) = &self.credentials {
            if let Some(resource) = &self.auth_resource {
                if let Ok(jid) = Jid::new(&format!("{}/{}", creds.jid.to_bare(), resource)) {
                    return jid;
                }
            }
            return creds.jid.clone();
        }
        // ANONYMOUS sessions without a bound JID: the domain is all we
        // know.
        Jid::new(self.domain.as_deref().unwrap_or("invalid"))
            .unwrap_or_else(|_| Jid::new("invalid.invalid").expect("static jid"))
    }

    fn match_expected_iq(&mut self, element: Element) -> IqMatch {
        let matches = element.name() == "iq"
            && match (self.expected_iq.as_deref(), element.attr("id")) {
                (Some(expected), Some(id)) => expected == id,
                _ => false,
            };
        if matches {
            self.expected_iq = None;
            IqMatch::Matched(element)
        } else {
            // The stream is live; pushes may interleave with our
            // request/response pairs.
            IqMatch::Other(vec![Action::Dispatch(dispatch::classify(element))])
        }
    }

    fn auth_recoverable(&mut self, error: crate::error::AuthError) -> Vec<Action> {
        self.expected_iq = None;
        self.state = State::StreamOpened;
        self.reply_pending(Err(error.into()))
    }

    fn auth_recoverable_protocol(&mut self, error: ProtocolError) -> Vec<Action> {
        self.expected_iq = None;
        self.state = State::StreamOpened;
        self.reply_pending(Err(error.into()))
    }

    fn protocol_fatal(&mut self, error: ProtocolError) -> Vec<Action> {
        warn!("fatal protocol error: {}", error);
        let mut actions = self.reply_pending(Err(error.into()));
        self.state = State::StreamError;
        actions.push(Action::Dispatch(SessionEvent::Closed {
            reason: Some("protocol error".to_owned()),
        }));
        actions.push(Action::Close { send_footer: true });
        actions
    }

    fn transport_fatal(&mut self, error: TransportError, reason: &str) -> Vec<Action> {
        let mut actions = self.reply_pending(Err(error.into()));
        self.state = State::StreamClosed;
        actions.push(Action::Dispatch(SessionEvent::Closed {
            reason: Some(reason.to_owned()),
        }));
        actions.push(Action::Close { send_footer: true });
        actions
    }
}

enum IqMatch {
    Matched(Element),
    Other(Vec<Action>),
}

fn ok(reply: Responder) -> Action {
    Action::Reply {
        reply,
        result: Ok(Answer::Unit),
    }
}

fn refuse(reply: Responder, error: CommandError) -> Vec<Action> {
    vec![Action::Reply {
        reply,
        result: Err(error.into()),
    }]
}

/// `<iq type='{type}' id='{id}'>` shell for internally generated
/// requests.
fn iq_wrapper(iq_type: &str, id: &str) -> minidom::ElementBuilder {
    Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", iq_type)
        .attr("id", id)
}

/// A SASL nonza with base64-encoded payload; empty payloads produce an
/// empty element.
fn sasl_element(name: &str, payload: &[u8]) -> minidom::ElementBuilder {
    let builder = Element::builder(name, ns::SASL);
    if payload.is_empty() {
        builder
    } else {
        builder.append(BASE64.encode(payload))
    }
}

/// Base64-decode, tolerating the line breaks some servers insert.
fn decode_b64(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    BASE64.decode(compact)
}

/// Lowercase hex SHA-1, as XEP-0078 wants it.
fn sha1_hex(input: &str) -> String {
    let digest = Sha1::digest(input.as_bytes());
    let mut hex = String::with_capacity(40);
    for byte in digest {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

/// Condition of an iq error, by child name; `undefined-condition` when
/// the error element is missing or empty.
fn iq_error_condition(iq: &Element) -> String {
    iq.children()
        .find(|child| child.name() == "error")
        .and_then(|error| {
            error
                .children()
                .map(|child| child.name())
                .find(|name| *name != "text")
        })
        .unwrap_or("undefined-condition")
        .to_owned()
}
