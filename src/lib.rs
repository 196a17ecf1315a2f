//! Client-side [XMPP](https://xmpp.org/) session engine with asynchronous I/O using [tokio](https://tokio.rs/).
//!
//! This crate drives one client connection from raw transport through
//! stream negotiation, STARTTLS, optional zlib compression (XEP-0138),
//! authentication (SASL PLAIN/ANONYMOUS/DIGEST-MD5 or the legacy
//! XEP-0078 exchange), resource binding and session establishment, and
//! then steady-state stanza exchange.
//!
//! # Getting started
//!
//! Start a [`Session`], point it at a server, log in, and read events:
//!
//! ```no_run
//! use xmpp_session::{AuthMethod, Session, SessionOptions, StreamVersion};
//!
//! # async fn run() -> Result<(), xmpp_session::Error> {
//! let (session, mut events) = Session::start(StreamVersion::V1_0);
//! session
//!     .set_auth(AuthMethod::Plain, "alice@example.org", "hunter2")
//!     .await?;
//! session
//!     .connect_tcp("example.org", 5222, SessionOptions::default())
//!     .await?;
//! let jid = session.login().await?;
//! println!("logged in as {}", jid);
//! while let Some(event) = events.recv().await {
//!     println!("event: {:?}", event);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Scope
//!
//! Supported here:
//! - [x] Plaintext and STARTTLS TCP, TLS-on-connect (port 5223 style)
//! - [x] Stream compression (XEP-0138, zlib)
//! - [x] SASL PLAIN, ANONYMOUS and DIGEST-MD5
//! - [x] Legacy jabber:iq:auth (XEP-0078), plaintext and digest
//! - [x] In-band registration (XEP-0077)
//! - [x] Custom transports through the [`Connector`] trait (BOSH
//!   bindings attach here)
//!
//! Not here: server-side logic, roster handling, automatic
//! reconnection, stream management (XEP-0198).

#![deny(unsafe_code, bare_trait_objects)]

pub use xmpp_parsers::jid;

mod codec;
mod config;
/// Detailed error types
pub mod error;
mod event;
mod features;
pub mod ns;
pub mod sasl;
mod session;
pub mod transport;

pub use codec::{Packet, XmppCodec};
pub use config::{
    AuthMethod, Credentials, SessionOptions, SocketType, StreamVersion, UsePolicy,
};
#[doc(inline)]
pub use error::Error;
pub use event::{SessionEvent, StanzaEvent, StanzaKind};
pub use features::{StartTls, StreamFeatures};
pub use session::{Connected, Session, SessionEvents, DEFAULT_TIMEOUT};
pub use transport::{Connector, DnsConfig, PropertyValue, TcpConnector, Transport, TransportKind};

#[cfg(test)]
mod tests {
    #[test]
    fn reexports() {
        #[allow(unused_imports)]
        use crate::jid;
        #[allow(unused_imports)]
        use crate::{Packet, Session, SessionOptions};
    }
}
