// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! SASL mechanism driver.
//!
//! The session core talks to every mechanism through [`Mechanism`]:
//! ask for the initial response, feed it decoded challenges, and let it
//! verify whatever the server attaches to `<success/>`. Base64 framing
//! is not handled here; the nonza layer decodes challenges before they
//! reach a mechanism.

use core::fmt;
use std::error::Error as StdError;

pub mod mechanisms;

use crate::config::Credentials;
use crate::error::{ConfigError, Error};
use mechanisms::{Anonymous, DigestMd5, Plain};

/// A client-side SASL mechanism.
pub trait Mechanism {
    /// The mechanism name as announced in `<mechanisms/>`.
    fn name(&self) -> &'static str;

    /// The initial response; empty for server-first mechanisms.
    fn initial(&mut self) -> Vec<u8>;

    /// Consume a decoded challenge, produce the next response.
    ///
    /// A final server round (such as DIGEST-MD5 `rspauth`) yields an
    /// empty response.
    fn response(&mut self, challenge: &[u8]) -> Result<Vec<u8>, MechanismError>;

    /// Verify additional data the server sent with `<success/>`.
    fn success(&mut self, data: &[u8]) -> Result<(), MechanismError>;
}

/// Local mechanism failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MechanismError {
    /// The mechanism is single-step but the server sent a challenge
    UnexpectedChallenge,
    /// The challenge could not be parsed
    InvalidChallenge(String),
    /// The server requested a quality of protection we do not offer
    UnsupportedQop(String),
    /// The mutual-authentication proof from the server was wrong
    InvalidServerProof,
}

impl fmt::Display for MechanismError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MechanismError::UnexpectedChallenge => {
                write!(fmt, "unexpected challenge for a single-step mechanism")
            }
            MechanismError::InvalidChallenge(e) => write!(fmt, "invalid challenge: {}", e),
            MechanismError::UnsupportedQop(qop) => {
                write!(fmt, "unsupported quality of protection: {}", qop)
            }
            MechanismError::InvalidServerProof => {
                write!(fmt, "server sent an invalid rspauth proof")
            }
        }
    }
}

impl StdError for MechanismError {}

/// Instantiate the named mechanism from the session credentials.
///
/// `domain` is the XMPP domain (used for the DIGEST-MD5 digest-uri);
/// `cnonce` is caller-provided entropy so the session's RNG stays the
/// single source of randomness.
pub fn mechanism_for(
    name: &str,
    credentials: Option<&Credentials>,
    domain: &str,
    cnonce: String,
) -> Result<Box<dyn Mechanism + Send>, Error> {
    match name {
        "ANONYMOUS" => Ok(Box::new(Anonymous::new())),
        "PLAIN" => {
            let creds = credentials.ok_or(ConfigError::AuthInfoUndefined)?;
            let username = creds
                .jid
                .node()
                .ok_or(ConfigError::AuthInfoUndefined)?
                .to_string();
            Ok(Box::new(Plain::new(username, creds.password.clone())))
        }
        "DIGEST-MD5" => {
            let creds = credentials.ok_or(ConfigError::AuthInfoUndefined)?;
            let username = creds
                .jid
                .node()
                .ok_or(ConfigError::AuthInfoUndefined)?
                .to_string();
            Ok(Box::new(DigestMd5::new(
                username,
                creds.password.clone(),
                domain.to_owned(),
                cnonce,
            )))
        }
        _ => Err(crate::error::ProtocolError::NoSupportedAuthMethod.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jid::Jid;

    #[test]
    fn unknown_mechanism_is_refused() {
        assert!(mechanism_for("SCRAM-SHA-1", None, "example.org", String::new()).is_err());
    }

    #[test]
    fn anonymous_needs_no_credentials() {
        let mut mech = mechanism_for("ANONYMOUS", None, "example.org", String::new()).unwrap();
        assert_eq!(mech.name(), "ANONYMOUS");
        assert!(mech.initial().is_empty());
    }

    #[test]
    fn plain_requires_credentials() {
        assert!(mechanism_for("PLAIN", None, "example.org", String::new()).is_err());
        let creds = Credentials {
            jid: Jid::new("alice@example.org").unwrap(),
            password: "pw".to_owned(),
        };
        let mut mech =
            mechanism_for("PLAIN", Some(&creds), "example.org", String::new()).unwrap();
        assert_eq!(mech.initial(), b"\0alice\0pw");
    }
}
