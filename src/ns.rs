//! Namespace constants used by the session core.
//!
//! The RFC 6120 namespaces come from `xmpp-parsers`; the XEPs the
//! parsers crate does not model are declared here.

pub use xmpp_parsers::ns::{BIND, JABBER_CLIENT, SASL, STREAM, TLS};

/// XEP-0138 stream feature (`<compression/>`)
pub const COMPRESS_FEATURE: &str = "http://jabber.org/features/compress";

/// XEP-0138 negotiation elements (`<compress/>`, `<compressed/>`, ...)
pub const COMPRESS: &str = "http://jabber.org/protocol/compress";

/// RFC 3921 session establishment
pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";

/// XEP-0078 legacy authentication
pub const LEGACY_AUTH: &str = "jabber:iq:auth";

/// XEP-0077 in-band registration
pub const REGISTER: &str = "jabber:iq:register";
