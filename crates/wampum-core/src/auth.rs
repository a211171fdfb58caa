//! Challenge/response authentication support.
//!
//! The session core knows nothing about authentication algorithms. When the
//! router interposes a CHALLENGE during join, the session hands a
//! [`Challenge`] to the registered handler and sends back whatever
//! [`ChallengeResponse`] it produces. The WAMP-CRA helpers below are enough
//! to implement the common shared-secret scheme inside such a handler.

use std::future::Future;
use std::pin::Pin;

use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::WampError;
use crate::value::{Dict, Value};

/// A CHALLENGE issued by the router during join.
#[derive(Debug, Clone, PartialEq)]
pub struct Challenge {
    /// The authentication method the router selected (e.g. "wampcra").
    pub method: String,
    /// The challenge string to sign.
    pub challenge: String,
    /// Salt parameters, present when the router stores a derived key.
    pub salt: Option<String>,
    pub iterations: Option<u32>,
    pub keylen: Option<u32>,
}

impl Challenge {
    /// Builds a challenge from the CHALLENGE message's method and extra dict.
    pub fn from_extra(method: &str, extra: &Dict) -> Self {
        let str_field = |key: &str| {
            extra.get(key).and_then(|v| v.as_str().ok().map(str::to_owned))
        };
        let int_field = |key: &str| {
            extra
                .get(key)
                .and_then(|v| v.as_u64().ok())
                .and_then(|v| u32::try_from(v).ok())
        };
        Self {
            method: method.to_owned(),
            challenge: str_field("challenge").unwrap_or_default(),
            salt: str_field("salt"),
            iterations: int_field("iterations"),
            keylen: int_field("keylen"),
        }
    }
}

/// The signed reply carried in an AUTHENTICATE message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChallengeResponse {
    pub signature: String,
    pub extra: Dict,
}

impl ChallengeResponse {
    pub fn new(signature: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            extra: Dict::new(),
        }
    }
}

pub type ChallengeFuture =
    Pin<Box<dyn Future<Output = Result<ChallengeResponse, WampError>> + Send>>;

/// The session's authentication hook.
pub type ChallengeHandler = Box<dyn Fn(Challenge) -> ChallengeFuture + Send + Sync>;

/// Options for the HELLO message's authentication announcement.
#[derive(Debug, Clone, Default)]
pub struct JoinOptions {
    pub authmethods: Vec<String>,
    pub authid: Option<String>,
    pub authextra: Option<Dict>,
}

impl JoinOptions {
    /// Folds the announcement into the HELLO details dict.
    pub fn apply_to(&self, details: &mut Dict) {
        if !self.authmethods.is_empty() {
            details.insert(
                "authmethods".into(),
                Value::Array(
                    self.authmethods
                        .iter()
                        .map(|m| Value::String(m.clone()))
                        .collect(),
                ),
            );
        }
        if let Some(authid) = &self.authid {
            details.insert("authid".into(), Value::String(authid.clone()));
        }
        if let Some(extra) = &self.authextra {
            details.insert("authextra".into(), Value::Map(extra.clone()));
        }
    }
}

/// Derives a WAMP-CRA key from a secret via PBKDF2-SHA256, base64-encoded.
///
/// Matches what routers expect when the shared secret is stored salted.
pub fn derive_key(secret: &str, salt: &str, iterations: u32, keylen: usize) -> String {
    let mut key = vec![0u8; keylen];
    // pbkdf2 only errors on an invalid key length for the PRF, which HMAC
    // does not have.
    let _ = pbkdf2::pbkdf2::<Hmac<Sha256>>(
        secret.as_bytes(),
        salt.as_bytes(),
        iterations,
        &mut key,
    );
    base64::engine::general_purpose::STANDARD.encode(key)
}

/// Signs a challenge string with HMAC-SHA256, base64-encoded.
pub fn compute_wcs(key: &str, challenge: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(challenge.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Signs a WAMP-CRA challenge, deriving the key first when the router sent
/// salt parameters.
pub fn sign_wampcra(secret: &str, challenge: &Challenge) -> ChallengeResponse {
    let signature = match &challenge.salt {
        Some(salt) => {
            let iterations = challenge.iterations.unwrap_or(1000);
            let keylen = challenge.keylen.unwrap_or(32) as usize;
            let key = derive_key(secret, salt, iterations, keylen);
            compute_wcs(&key, &challenge.challenge)
        }
        None => compute_wcs(secret, &challenge.challenge),
    };
    ChallengeResponse::new(signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_parses_extra_dict() {
        let mut extra = Dict::new();
        extra.insert("challenge".into(), Value::String("abc".into()));
        extra.insert("salt".into(), Value::String("pepper".into()));
        extra.insert("iterations".into(), Value::Integer(500));
        extra.insert("keylen".into(), Value::Integer(32));

        let challenge = Challenge::from_extra("wampcra", &extra);
        assert_eq!(challenge.method, "wampcra");
        assert_eq!(challenge.challenge, "abc");
        assert_eq!(challenge.salt.as_deref(), Some("pepper"));
        assert_eq!(challenge.iterations, Some(500));
        assert_eq!(challenge.keylen, Some(32));
    }

    #[test]
    fn wcs_signature_is_stable() {
        // HMAC-SHA256("secret", "challenge"), base64.
        let sig = compute_wcs("secret", "challenge");
        assert_eq!(sig, compute_wcs("secret", "challenge"));
        assert_ne!(sig, compute_wcs("secret2", "challenge"));
        assert_ne!(sig, compute_wcs("secret", "challenge2"));
    }

    #[test]
    fn salted_challenge_derives_first() {
        let challenge = Challenge {
            method: "wampcra".into(),
            challenge: "abc".into(),
            salt: Some("salt".into()),
            iterations: Some(100),
            keylen: Some(32),
        };
        let salted = sign_wampcra("secret", &challenge);
        let unsalted = sign_wampcra(
            "secret",
            &Challenge {
                salt: None,
                ..challenge
            },
        );
        assert_ne!(salted, unsalted);
    }
}
