//! One-time authorization token store.
//!
//! Issues 256-bit random tokens and lets each be consumed at most once, even
//! under concurrent presentation. Only the digest of a token is stored.
//!
//! Redirect destinations are checked against an allow-list both when a token
//! is issued and when it is consumed, so a policy tightened in between still
//! applies.

use std::{collections::HashMap, path::Path};

use chrono::{DateTime, Duration, Utc};
use grantvault_types::{
    AuthorizationToken, Result, TOKEN_BYTES, TokenGrant, TokenPurpose, TokenSubject, TokenValue,
    VaultError, constants::MAX_TOKEN_TTL_SECS,
};
use parking_lot::Mutex;
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};

use crate::journal::Journal;

// ---------------------------------------------------------------------------
// Redirect policy
// ---------------------------------------------------------------------------

/// Allow-list of post-login destinations.
///
/// A destination is accepted if it equals an entry, or starts with an entry
/// followed by a path, query or fragment boundary. Protocol-relative
/// (`//host`) destinations are always rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectPolicy {
    allowed: Vec<String>,
}

impl RedirectPolicy {
    #[must_use]
    pub fn new(allowed: Vec<String>) -> Self {
        Self { allowed }
    }

    /// Check a destination.
    ///
    /// # Errors
    /// `RedirectNotAllowed` if no entry admits it.
    pub fn check(&self, destination: &str) -> Result<()> {
        if self.admits(destination) {
            Ok(())
        } else {
            Err(VaultError::RedirectNotAllowed {
                destination: destination.to_string(),
            })
        }
    }

    fn admits(&self, destination: &str) -> bool {
        if destination.is_empty()
            || destination.starts_with("//")
            || destination
                .chars()
                .any(|c| c.is_control() || c.is_whitespace() || c == '\\')
        {
            return false;
        }

        self.allowed.iter().any(|entry| {
            if destination == entry {
                return true;
            }
            let Some(rest) = destination.strip_prefix(entry.as_str()) else {
                return false;
            };
            entry.ends_with('/') || rest.starts_with(['/', '?', '#'])
        })
    }
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self::new(vec!["/".to_string()])
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
enum TokenEvent {
    Issued(AuthorizationToken),
    Consumed { digest: String },
    Swept { digests: Vec<String> },
}

/// Issues and consumes one-time tokens.
pub struct TokenStore {
    tokens: Mutex<HashMap<String, AuthorizationToken>>,
    redirects: RedirectPolicy,
    journal: Option<Journal<TokenEvent>>,
}

impl TokenStore {
    /// An in-memory store.
    #[must_use]
    pub fn new(redirects: RedirectPolicy) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            redirects,
            journal: None,
        }
    }

    /// A journaled store, restored from `path`.
    ///
    /// # Errors
    /// Propagates journal open/replay failures.
    pub fn open(redirects: RedirectPolicy, path: impl AsRef<Path>) -> Result<Self> {
        let (journal, events) = Journal::<TokenEvent>::open(path)?;
        let mut tokens = HashMap::new();
        for event in events {
            match event {
                TokenEvent::Issued(token) => {
                    tokens.insert(token.digest.clone(), token);
                }
                TokenEvent::Consumed { digest } => {
                    if let Some(token) = tokens.get_mut(&digest) {
                        token.consumed = true;
                    }
                }
                TokenEvent::Swept { digests } => {
                    for digest in digests {
                        tokens.remove(&digest);
                    }
                }
            }
        }
        tracing::info!(tokens = tokens.len(), "token store restored");
        Ok(Self {
            tokens: Mutex::new(tokens),
            redirects,
            journal: Some(journal),
        })
    }

    /// Issue a token for `subject`, valid for `ttl` from `now`.
    ///
    /// The returned value is the only copy of the secret.
    ///
    /// # Errors
    /// - `Configuration` if `ttl` is not positive or exceeds the maximum
    /// - `RedirectNotAllowed` for a redirect outside the allow-list
    pub fn issue(
        &self,
        subject: TokenSubject,
        purpose: TokenPurpose,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<TokenValue> {
        if ttl <= Duration::zero() || ttl > Duration::seconds(MAX_TOKEN_TTL_SECS) {
            return Err(VaultError::Configuration(format!(
                "token ttl must be in (0, {MAX_TOKEN_TTL_SECS}] seconds"
            )));
        }
        Self::check_pairing(&subject, purpose)?;
        if let TokenSubject::Redirect { destination } = &subject {
            self.redirects.check(destination)?;
        }

        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let value = TokenValue::from_bytes(bytes);

        let token = AuthorizationToken {
            digest: value.digest(),
            subject,
            purpose,
            created_at: now,
            expires_at: now + ttl,
            consumed: false,
        };

        let mut tokens = self.tokens.lock();
        if let Some(journal) = &self.journal {
            journal.append(&TokenEvent::Issued(token.clone()))?;
        }
        tracing::debug!(
            purpose = %purpose,
            expires_at = %token.expires_at,
            "token issued"
        );
        tokens.insert(token.digest.clone(), token);
        Ok(value)
    }

    /// Consume a token presented by a client.
    ///
    /// Check and mark happen under one lock, so of any number of concurrent
    /// presentations of the same value exactly one succeeds.
    ///
    /// # Errors
    /// `ExpiredOrInvalid` for malformed, unknown, expired or already-consumed
    /// tokens; `RedirectNotAllowed` if the stored destination no longer
    /// passes the allow-list.
    pub fn consume(&self, raw: &str, now: DateTime<Utc>) -> Result<TokenGrant> {
        let value = TokenValue::parse(raw)?;
        let digest = value.digest();

        let mut tokens = self.tokens.lock();
        let token = tokens
            .get_mut(&digest)
            .ok_or(VaultError::ExpiredOrInvalid)?;
        if !token.is_usable(now) {
            tracing::debug!(
                consumed = token.consumed,
                expired = token.is_expired(now),
                "token rejected"
            );
            return Err(VaultError::ExpiredOrInvalid);
        }
        if let TokenSubject::Redirect { destination } = &token.subject {
            self.redirects.check(destination)?;
        }

        if let Some(journal) = &self.journal {
            journal.append(&TokenEvent::Consumed {
                digest: digest.clone(),
            })?;
        }
        token.consumed = true;
        tracing::debug!(purpose = %token.purpose, "token consumed");

        Ok(TokenGrant {
            subject: token.subject.clone(),
            purpose: token.purpose,
            issued_at: token.created_at,
        })
    }

    /// Drop consumed and expired tokens. Returns how many were removed.
    ///
    /// # Errors
    /// `Io` if the sweep cannot be journaled; nothing is removed then.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut tokens = self.tokens.lock();
        let dead: Vec<String> = tokens
            .values()
            .filter(|t| !t.is_usable(now))
            .map(|t| t.digest.clone())
            .collect();
        if dead.is_empty() {
            return Ok(0);
        }

        if let Some(journal) = &self.journal {
            journal.append(&TokenEvent::Swept {
                digests: dead.clone(),
            })?;
        }
        for digest in &dead {
            tokens.remove(digest);
        }
        tracing::debug!(removed = dead.len(), "tokens swept");
        Ok(dead.len())
    }

    /// Tokens still usable at `now`.
    #[must_use]
    pub fn active(&self, now: DateTime<Utc>) -> usize {
        self.tokens
            .lock()
            .values()
            .filter(|t| t.is_usable(now))
            .count()
    }

    fn check_pairing(subject: &TokenSubject, purpose: TokenPurpose) -> Result<()> {
        match (subject, purpose) {
            (TokenSubject::Redirect { .. }, TokenPurpose::LoginRedirect)
            | (TokenSubject::Release { .. }, TokenPurpose::ReleaseAuthorization) => Ok(()),
            _ => Err(VaultError::Configuration(format!(
                "token purpose {purpose} does not match its subject"
            ))),
        }
    }
}
