//! One-time authorization tokens.
//!
//! A token is a 256-bit random value handed to a client exactly once. The
//! store keeps only its SHA-256 digest together with what it authorizes.
//!
//! Two flows use the same primitive:
//! - **login redirect**: the subject is the post-login destination
//! - **release authorization**: the subject is the contributor identity and
//!   payout wallet a release may be made to

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Beneficiary, Result, VaultError};

/// Length of a token value in bytes.
pub const TOKEN_BYTES: usize = 32;

/// What a token may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenPurpose {
    LoginRedirect,
    ReleaseAuthorization,
}

impl fmt::Display for TokenPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoginRedirect => write!(f, "LOGIN_REDIRECT"),
            Self::ReleaseAuthorization => write!(f, "RELEASE_AUTHORIZATION"),
        }
    }
}

/// What a token authorizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenSubject {
    /// Redirect target after login. Validated against the allow-list.
    Redirect { destination: String },
    /// A verified contributor and the wallet a release may pay.
    Release { beneficiary: Beneficiary },
}

/// The secret token value handed to a client. `Debug` never prints it.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenValue(String);

impl TokenValue {
    /// Wrap freshly generated random bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; TOKEN_BYTES]) -> Self {
        Self(hex::encode(bytes))
    }

    /// Parse a token presented by a client.
    ///
    /// Anything other than exactly 64 lowercase hex characters is rejected
    /// as [`VaultError::ExpiredOrInvalid`]; there is no fallback
    /// interpretation of malformed input.
    ///
    /// # Errors
    /// Returns `ExpiredOrInvalid` for malformed input.
    pub fn parse(raw: &str) -> Result<Self> {
        let well_formed = raw.len() == TOKEN_BYTES * 2
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if well_formed {
            Ok(Self(raw.to_string()))
        } else {
            Err(VaultError::ExpiredOrInvalid)
        }
    }

    /// The value to hand to the client.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Storage key: hex SHA-256 of the value.
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"grantvault:token:v1:");
        hasher.update(self.0.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Debug for TokenValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenValue({}…)", &self.0[..8.min(self.0.len())])
    }
}

/// A stored token record, keyed by the digest of its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationToken {
    pub digest: String,
    pub subject: TokenSubject,
    pub purpose: TokenPurpose,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
}

impl AuthorizationToken {
    /// Expired at or after `expires_at`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Not consumed and not expired.
    #[must_use]
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.consumed && !self.is_expired(now)
    }
}

/// What a successful `consume` hands back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub subject: TokenSubject,
    pub purpose: TokenPurpose,
    pub issued_at: DateTime<Utc>,
}
