//! The DIGEST-MD5 mechanism (RFC 2831), client side.
//!
//! Two server rounds: the initial challenge yields the digest
//! response, the second round carries the `rspauth` mutual
//! authentication proof. Some deployments put `rspauth` into the
//! `<success/>` payload instead; both spellings are accepted.

use std::collections::HashMap;

use md5::{Digest, Md5};

use crate::sasl::{Mechanism, MechanismError};

enum Step {
    Initial,
    /// Response sent; the proof we expect the server to present.
    Responded { rspauth: String },
    Done,
}

/// RFC 2831 client state.
pub struct DigestMd5 {
    username: String,
    password: String,
    digest_uri: String,
    cnonce: String,
    step: Step,
}

impl DigestMd5 {
    /// `domain` is the XMPP domain; the digest-uri becomes
    /// `xmpp/<domain>`. `cnonce` is caller-provided entropy.
    pub fn new(username: String, password: String, domain: String, cnonce: String) -> DigestMd5 {
        DigestMd5 {
            username,
            password,
            digest_uri: format!("xmpp/{}", domain),
            cnonce,
            step: Step::Initial,
        }
    }

    fn verify_rspauth(&mut self, pairs: &HashMap<String, String>) -> Result<(), MechanismError> {
        let proof = match pairs.get("rspauth") {
            Some(proof) => proof,
            None => {
                return Err(MechanismError::InvalidChallenge(
                    "expected rspauth".to_owned(),
                ))
            }
        };
        match &self.step {
            Step::Responded { rspauth } if rspauth.eq_ignore_ascii_case(proof) => {
                self.step = Step::Done;
                Ok(())
            }
            Step::Responded { .. } => Err(MechanismError::InvalidServerProof),
            _ => Err(MechanismError::InvalidChallenge(
                "rspauth before response".to_owned(),
            )),
        }
    }
}

impl Mechanism for DigestMd5 {
    fn name(&self) -> &'static str {
        "DIGEST-MD5"
    }

    fn initial(&mut self) -> Vec<u8> {
        // Server-first mechanism.
        Vec::new()
    }

    fn response(&mut self, challenge: &[u8]) -> Result<Vec<u8>, MechanismError> {
        let text = core::str::from_utf8(challenge)
            .map_err(|e| MechanismError::InvalidChallenge(e.to_string()))?;
        let pairs = parse_pairs(text)?;

        if pairs.contains_key("rspauth") {
            self.verify_rspauth(&pairs)?;
            return Ok(Vec::new());
        }

        let nonce = pairs
            .get("nonce")
            .ok_or_else(|| MechanismError::InvalidChallenge("missing nonce".to_owned()))?;
        if let Some(qop) = pairs.get("qop") {
            if !qop.split(',').any(|token| token.trim() == "auth") {
                return Err(MechanismError::UnsupportedQop(qop.clone()));
            }
        }
        let empty = String::new();
        let realm = pairs.get("realm").unwrap_or(&empty);

        let response_value = compute_response(
            &self.username,
            realm,
            &self.password,
            nonce,
            &self.cnonce,
            NC,
            &self.digest_uri,
            "AUTHENTICATE",
        );
        let rspauth = compute_response(
            &self.username,
            realm,
            &self.password,
            nonce,
            &self.cnonce,
            NC,
            &self.digest_uri,
            "",
        );
        let response = format!(
            "username=\"{}\",realm=\"{}\",nonce=\"{}\",cnonce=\"{}\",nc={},\
             qop=auth,digest-uri=\"{}\",response={},charset=utf-8",
            quote(&self.username),
            quote(realm),
            quote(nonce),
            quote(&self.cnonce),
            NC,
            quote(&self.digest_uri),
            response_value,
        );
        self.step = Step::Responded { rspauth };
        Ok(response.into_bytes())
    }

    fn success(&mut self, data: &[u8]) -> Result<(), MechanismError> {
        if data.is_empty() {
            // The proof already came in the final challenge round, or
            // the server chose not to prove itself at all.
            return Ok(());
        }
        if matches!(self.step, Step::Done) {
            return Ok(());
        }
        let text = core::str::from_utf8(data)
            .map_err(|e| MechanismError::InvalidChallenge(e.to_string()))?;
        let pairs = parse_pairs(text)?;
        self.verify_rspauth(&pairs)
    }
}

/// We never reuse a nonce within a session, so the count is constant.
const NC: &str = "00000001";

fn md5_hex(data: &[u8]) -> String {
    let digest = Md5::digest(data);
    let mut hex = String::with_capacity(32);
    for byte in digest {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

/// The HTTP-digest style computation of RFC 2831 §2.1.2.1, md5-sess
/// flavour. `a2_prefix` is `"AUTHENTICATE"` for the client response
/// and `""` for the server's rspauth.
#[allow(clippy::too_many_arguments)]
fn compute_response(
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    cnonce: &str,
    nc: &str,
    digest_uri: &str,
    a2_prefix: &str,
) -> String {
    let inner = Md5::digest(format!("{}:{}:{}", username, realm, password).as_bytes());
    let mut a1 = inner.to_vec();
    a1.extend_from_slice(format!(":{}:{}", nonce, cnonce).as_bytes());
    let ha1 = md5_hex(&a1);
    let ha2 = md5_hex(format!("{}:{}", a2_prefix, digest_uri).as_bytes());
    md5_hex(format!("{}:{}:{}:{}:auth:{}", ha1, nonce, nc, cnonce, ha2).as_bytes())
}

fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted
}

/// Parse the comma-separated `key=value` directives of a challenge.
/// Values may be quoted and contain escaped characters.
fn parse_pairs(input: &str) -> Result<HashMap<String, String>, MechanismError> {
    let mut pairs = HashMap::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .ok_or_else(|| MechanismError::InvalidChallenge(format!("not a directive: {rest}")))?;
        let key = rest[..eq].trim().to_ascii_lowercase();
        rest = rest[eq + 1..].trim_start();

        let value;
        if let Some(quoted) = rest.strip_prefix('"') {
            let mut unescaped = String::new();
            let mut chars = quoted.char_indices();
            let mut end = None;
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some((_, escaped)) => unescaped.push(escaped),
                        None => {
                            return Err(MechanismError::InvalidChallenge(
                                "dangling escape".to_owned(),
                            ))
                        }
                    },
                    '"' => {
                        end = Some(i);
                        break;
                    }
                    c => unescaped.push(c),
                }
            }
            let end = end.ok_or_else(|| {
                MechanismError::InvalidChallenge("unterminated quoted value".to_owned())
            })?;
            value = unescaped;
            rest = quoted[end + 1..].trim_start();
            rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
        } else {
            let (raw, remainder) = match rest.find(',') {
                Some(comma) => (&rest[..comma], rest[comma + 1..].trim_start()),
                None => (rest, ""),
            };
            value = raw.trim().to_owned();
            rest = remainder;
        }
        pairs.insert(key, value);
    }
    Ok(pairs)
}
