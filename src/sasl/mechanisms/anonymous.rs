//! The ANONYMOUS mechanism (RFC 4505).

use crate::sasl::{Mechanism, MechanismError};

/// Logs in without credentials; the server assigns a throwaway
/// identity that vanishes on disconnect.
pub struct Anonymous;

impl Anonymous {
    pub fn new() -> Anonymous {
        Anonymous
    }
}

impl Mechanism for Anonymous {
    fn name(&self) -> &'static str {
        "ANONYMOUS"
    }

    fn initial(&mut self) -> Vec<u8> {
        Vec::new()
    }

    fn response(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, MechanismError> {
        Err(MechanismError::UnexpectedChallenge)
    }

    fn success(&mut self, _data: &[u8]) -> Result<(), MechanismError> {
        Ok(())
    }
}
