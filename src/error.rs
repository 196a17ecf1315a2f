use hickory_resolver::{
    error::ResolveError as DnsResolveError, proto::error::ProtoError as DnsProtoError,
};
use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IoError;
use std::net::AddrParseError;

use crate::jid;
use crate::sasl::MechanismError;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(IoError),
    /// Error parsing Jabber-Id
    JidParse(jid::Error),
    /// Invalid session configuration
    Config(ConfigError),
    /// Protocol-level error
    Protocol(ProtocolError),
    /// Authentication error
    Auth(AuthError),
    /// Transport-level error
    Transport(TransportError),
    /// Command refused in the current state
    Command(CommandError),
    /// A blocking command did not complete within its timeout
    Timeout,
    /// Connection closed
    Disconnected,
    /// Should never happen
    InvalidState,
    /// DNS protocol error
    Dns(DnsProtoError),
    /// DNS resolution error
    Resolve(DnsResolveError),
    /// DNS label conversion error, no details available from module
    /// `idna`
    Idna,
    /// Invalid IP/Port address
    Addr(AddrParseError),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(fmt, "IO error: {}", e),
            Error::JidParse(e) => write!(fmt, "jid parse error: {}", e),
            Error::Config(e) => write!(fmt, "configuration error: {}", e),
            Error::Protocol(e) => write!(fmt, "protocol error: {}", e),
            Error::Auth(e) => write!(fmt, "authentication error: {}", e),
            Error::Transport(e) => write!(fmt, "transport error: {}", e),
            Error::Command(e) => write!(fmt, "{}", e),
            Error::Timeout => write!(fmt, "timeout"),
            Error::Disconnected => write!(fmt, "disconnected"),
            Error::InvalidState => write!(fmt, "invalid state"),
            Error::Dns(e) => write!(fmt, "{:?}", e),
            Error::Resolve(e) => write!(fmt, "{:?}", e),
            Error::Idna => write!(fmt, "IDNA error"),
            Error::Addr(e) => write!(fmt, "wrong network address: {e}"),
        }
    }
}

impl StdError for Error {}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<jid::Error> for Error {
    fn from(e: jid::Error) -> Self {
        Error::JidParse(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Error::Auth(e)
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}

impl From<CommandError> for Error {
    fn from(e: CommandError) -> Self {
        Error::Command(e)
    }
}

impl From<MechanismError> for Error {
    fn from(e: MechanismError) -> Self {
        Error::Auth(AuthError::Sasl(e))
    }
}

impl From<idna::Errors> for Error {
    fn from(_e: idna::Errors) -> Self {
        Error::Idna
    }
}

impl From<DnsResolveError> for Error {
    fn from(e: DnsResolveError) -> Error {
        Error::Resolve(e)
    }
}

impl From<DnsProtoError> for Error {
    fn from(e: DnsProtoError) -> Error {
        Error::Dns(e)
    }
}

impl From<AddrParseError> for Error {
    fn from(e: AddrParseError) -> Error {
        Error::Addr(e)
    }
}

/// Session configuration error, raised synchronously before any state
/// change happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The supplied JID could not be parsed
    IncorrectJid,
    /// No authentication method has been selected
    AuthMethodUndefined,
    /// No credentials are available for the selected method
    AuthInfoUndefined,
    /// Neither credentials nor an explicit domain were configured
    AuthenticationOrDomainUndefined,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IncorrectJid => write!(fmt, "incorrect jid"),
            ConfigError::AuthMethodUndefined => write!(fmt, "authentication method undefined"),
            ConfigError::AuthInfoUndefined => write!(fmt, "authentication information undefined"),
            ConfigError::AuthenticationOrDomainUndefined => {
                write!(fmt, "authentication or domain undefined")
            }
        }
    }
}

impl StdError for ConfigError {}

/// XMPP protocol-level error
#[derive(Debug)]
pub enum ProtocolError {
    /// XML stream could not be tokenized
    MalformedXml(String),
    /// Error parsing a complete element into a DOM
    Parser(minidom::Error),
    /// The peer closed the stream with a `<stream:error/>`
    Stream(StreamErrorCondition),
    /// Unexpected `<stream:stream>` (shouldn't occur)
    InvalidStreamStart,
    /// No id attribute in `<stream:stream>`
    NoStreamId,
    /// Invalid response to resource binding
    InvalidBindResponse,
    /// Resource binding was refused by the server
    BindFailed(String),
    /// Session establishment was refused by the server
    SessionFailed(String),
    /// The legacy auth fields query returned something else than an
    /// iq result
    NotAuthMethodResult,
    /// None of the offered authentication methods is usable
    NoSupportedAuthMethod,
    /// Digest authentication requires a stream id, but the server did
    /// not assign one
    NoStreamIdForDigestAuth,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::MalformedXml(e) => write!(fmt, "malformed XML: {}", e),
            ProtocolError::Parser(e) => write!(fmt, "XML parser error: {}", e),
            ProtocolError::Stream(c) => write!(fmt, "stream error: {}", c),
            ProtocolError::InvalidStreamStart => write!(fmt, "unexpected <stream:stream>"),
            ProtocolError::NoStreamId => write!(fmt, "no id attribute in <stream:stream>"),
            ProtocolError::InvalidBindResponse => {
                write!(fmt, "invalid response to resource binding")
            }
            ProtocolError::BindFailed(c) => write!(fmt, "resource binding failed: {}", c),
            ProtocolError::SessionFailed(c) => write!(fmt, "session establishment failed: {}", c),
            ProtocolError::NotAuthMethodResult => {
                write!(fmt, "reply to the auth fields query was not an iq result")
            }
            ProtocolError::NoSupportedAuthMethod => {
                write!(fmt, "no supported authentication method")
            }
            ProtocolError::NoStreamIdForDigestAuth => {
                write!(fmt, "no stream id available for digest authentication")
            }
        }
    }
}

impl StdError for ProtocolError {}

impl From<minidom::Error> for ProtocolError {
    fn from(e: minidom::Error) -> Self {
        ProtocolError::Parser(e)
    }
}

impl From<minidom::Error> for Error {
    fn from(e: minidom::Error) -> Self {
        ProtocolError::Parser(e).into()
    }
}

/// Authentication error
#[derive(Debug)]
pub enum AuthError {
    /// Local SASL mechanism error
    Sasl(MechanismError),
    /// SASL failure from the server, with the defined condition
    Fail(String),
    /// Legacy (jabber:iq:auth) failure from the server
    Legacy(String),
    /// In-band registration failure from the server
    Register(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthError::Sasl(e) => write!(fmt, "local SASL implementation error: {}", e),
            AuthError::Fail(c) => write!(fmt, "failure from the server: {}", c),
            AuthError::Legacy(c) => write!(fmt, "legacy authentication failed: {}", c),
            AuthError::Register(c) => write!(fmt, "registration failed: {}", c),
        }
    }
}

impl StdError for AuthError {}

/// Transport-level error; these are all terminal for the session.
#[derive(Debug)]
pub enum TransportError {
    /// The underlying connection was closed
    Closed,
    /// The TLS upgrade could not be completed
    CannotEncrypt(String),
    /// Stream compression could not be engaged
    CannotCompress(String),
    /// The transport does not expose the requested property
    UnknownProperty(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransportError::Closed => write!(fmt, "connection closed by peer"),
            TransportError::CannotEncrypt(e) => write!(fmt, "could not encrypt stream: {}", e),
            TransportError::CannotCompress(e) => write!(fmt, "could not compress stream: {}", e),
            TransportError::UnknownProperty(name) => {
                write!(fmt, "transport property not supported: {}", name)
            }
        }
    }
}

impl StdError for TransportError {}

/// A command was refused without touching the session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Another caller is already blocked on the session
    BusyConnectingToServer,
    /// The session has no established stream yet
    NotConnected,
    /// The command requires a logged-in session
    NotLoggedIn,
    /// The command is not allowed in the current state
    Unallowed,
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CommandError::BusyConnectingToServer => write!(fmt, "busy connecting to server"),
            CommandError::NotConnected => write!(fmt, "not connected"),
            CommandError::NotLoggedIn => write!(fmt, "not logged in"),
            CommandError::Unallowed => write!(fmt, "unallowed command"),
        }
    }
}

impl StdError for CommandError {}

/// Stream error conditions defined in RFC 6120 §4.9.3.
///
/// Conditions the engine does not know by name are preserved in
/// [`StreamErrorCondition::Other`] rather than dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamErrorCondition {
    BadFormat,
    BadNamespacePrefix,
    Conflict,
    ConnectionTimeout,
    HostGone,
    HostUnknown,
    ImproperAddressing,
    InternalServerError,
    InvalidFrom,
    InvalidNamespace,
    InvalidXml,
    NotAuthorized,
    NotWellFormed,
    PolicyViolation,
    RemoteConnectionFailed,
    Reset,
    ResourceConstraint,
    RestrictedXml,
    SeeOtherHost,
    SystemShutdown,
    UndefinedCondition,
    UnsupportedEncoding,
    UnsupportedStanzaType,
    UnsupportedVersion,
    /// Condition outside the RFC 6120 set, kept verbatim
    Other(String),
}

impl StreamErrorCondition {
    /// Map an element local name to a condition.
    pub fn from_name(name: &str) -> StreamErrorCondition {
        use StreamErrorCondition::*;
        match name {
            "bad-format" => BadFormat,
            "bad-namespace-prefix" => BadNamespacePrefix,
            "conflict" => Conflict,
            "connection-timeout" => ConnectionTimeout,
            "host-gone" => HostGone,
            "host-unknown" => HostUnknown,
            "improper-addressing" => ImproperAddressing,
            "internal-server-error" => InternalServerError,
            "invalid-from" => InvalidFrom,
            "invalid-namespace" => InvalidNamespace,
            "invalid-xml" => InvalidXml,
            "not-authorized" => NotAuthorized,
            "not-well-formed" => NotWellFormed,
            "policy-violation" => PolicyViolation,
            "remote-connection-failed" => RemoteConnectionFailed,
            "reset" => Reset,
            "resource-constraint" => ResourceConstraint,
            "restricted-xml" => RestrictedXml,
            "see-other-host" => SeeOtherHost,
            "system-shutdown" => SystemShutdown,
            "undefined-condition" => UndefinedCondition,
            "unsupported-encoding" => UnsupportedEncoding,
            "unsupported-stanza-type" => UnsupportedStanzaType,
            "unsupported-version" => UnsupportedVersion,
            other => Other(other.to_owned()),
        }
    }
}

impl fmt::Display for StreamErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use StreamErrorCondition::*;
        let s = match self {
            BadFormat => "bad-format",
            BadNamespacePrefix => "bad-namespace-prefix",
            Conflict => "conflict",
            ConnectionTimeout => "connection-timeout",
            HostGone => "host-gone",
            HostUnknown => "host-unknown",
            ImproperAddressing => "improper-addressing",
            InternalServerError => "internal-server-error",
            InvalidFrom => "invalid-from",
            InvalidNamespace => "invalid-namespace",
            InvalidXml => "invalid-xml",
            NotAuthorized => "not-authorized",
            NotWellFormed => "not-well-formed",
            PolicyViolation => "policy-violation",
            RemoteConnectionFailed => "remote-connection-failed",
            Reset => "reset",
            ResourceConstraint => "resource-constraint",
            RestrictedXml => "restricted-xml",
            SeeOtherHost => "see-other-host",
            SystemShutdown => "system-shutdown",
            UndefinedCondition => "undefined-condition",
            UnsupportedEncoding => "unsupported-encoding",
            UnsupportedStanzaType => "unsupported-stanza-type",
            UnsupportedVersion => "unsupported-version",
            Other(name) => return f.write_str(name),
        };
        f.write_str(s)
    }
}
