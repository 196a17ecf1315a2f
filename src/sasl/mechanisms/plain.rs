//! The PLAIN mechanism (RFC 4616).

use crate::sasl::{Mechanism, MechanismError};

/// Single-step mechanism sending the password in clear; only sensible
/// over an encrypted transport.
pub struct Plain {
    username: String,
    password: String,
}

impl Plain {
    pub fn new(username: String, password: String) -> Plain {
        Plain { username, password }
    }
}

impl Mechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn initial(&mut self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.username.len() + self.password.len() + 2);
        data.push(0);
        data.extend_from_slice(self.username.as_bytes());
        data.push(0);
        data.extend_from_slice(self.password.as_bytes());
        data
    }

    fn response(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, MechanismError> {
        Err(MechanismError::UnexpectedChallenge)
    }

    fn success(&mut self, _data: &[u8]) -> Result<(), MechanismError> {
        Ok(())
    }
}
