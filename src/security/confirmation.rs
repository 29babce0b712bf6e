//! Two-step confirmation for destructive operations.
//!
//! ```text
//!            issue()                  validate(matching)
//!   Empty ───────────> Pending ──────────────────────────> Empty
//!     ^                  │  │
//!     │    expiry        │  │ issue() replaces the token
//!     └──────────────────┘  └──────> Pending
//! ```
//!
//! Issuing while a token is pending replaces it; only the most recent
//! token can confirm.

use crate::clock::Clock;
use crate::storage::acquire_lock;
use secrecy::{ExposeSecret, SecretString};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fixed token prefix.
pub const TOKEN_PREFIX: &str = "PURGE-";

struct Pending {
    token: SecretString,
    expires_at_ms: u64,
}

/// A freshly issued token.
#[derive(Debug)]
pub struct IssuedToken {
    /// The token; reveal only to the caller that requested it.
    pub token: SecretString,
    /// How long it stays valid.
    pub ttl: Duration,
}

/// Result of presenting a token.
#[derive(Debug)]
pub enum ConfirmationOutcome {
    /// Token matched and was consumed.
    Accepted,
    /// A token is pending but the presented one differs. The pending token
    /// stays valid.
    Mismatch {
        /// The pending token. Never forward this to the caller.
        expected: SecretString,
        /// Time left on the pending token.
        remaining: Duration,
    },
    /// Nothing pending, or the pending token expired.
    NoneOrExpired,
}

/// Single-slot token guard.
pub struct ConfirmationTokenGuard {
    clock: Arc<dyn Clock>,
    ttl: Duration,
    pending: Mutex<Option<Pending>>,
}

impl std::fmt::Debug for ConfirmationTokenGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationTokenGuard")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

fn generate_token() -> String {
    let bytes = rand::random::<[u8; 16]>();
    format!("{TOKEN_PREFIX}{}", hex::encode_upper(bytes))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl ConfirmationTokenGuard {
    /// Creates an empty guard with the given token lifetime.
    #[must_use]
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            ttl,
            pending: Mutex::new(None),
        }
    }

    /// Token lifetime.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issues a new token, replacing any pending one.
    pub fn issue(&self) -> IssuedToken {
        let token = generate_token();
        let expires_at_ms = self
            .clock
            .now_millis()
            .saturating_add(u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX));

        let replaced = acquire_lock(&self.pending, "confirmation_token")
            .replace(Pending {
                token: SecretString::from(token.clone()),
                expires_at_ms,
            })
            .is_some();
        if replaced {
            tracing::debug!("Replaced pending confirmation token");
        }
        metrics::counter!("confirmation_tokens_issued_total").increment(1);

        IssuedToken {
            token: SecretString::from(token),
            ttl: self.ttl,
        }
    }

    /// Checks `presented` against the pending token and consumes it on match.
    pub fn validate_and_consume(&self, presented: &str) -> ConfirmationOutcome {
        let now = self.clock.now_millis();
        let mut slot = acquire_lock(&self.pending, "confirmation_token");

        let Some(pending) = slot.as_ref() else {
            return ConfirmationOutcome::NoneOrExpired;
        };
        if now >= pending.expires_at_ms {
            *slot = None;
            return ConfirmationOutcome::NoneOrExpired;
        }
        if constant_time_eq(
            pending.token.expose_secret().as_bytes(),
            presented.trim().as_bytes(),
        ) {
            *slot = None;
            return ConfirmationOutcome::Accepted;
        }

        ConfirmationOutcome::Mismatch {
            expected: pending.token.clone(),
            remaining: Duration::from_millis(pending.expires_at_ms - now),
        }
    }

    /// Time left on the pending token, if any.
    pub fn pending_remaining(&self) -> Option<Duration> {
        let now = self.clock.now_millis();
        acquire_lock(&self.pending, "confirmation_token")
            .as_ref()
            .filter(|p| now < p.expires_at_ms)
            .map(|p| Duration::from_millis(p.expires_at_ms - now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn guard() -> (Arc<ManualClock>, ConfirmationTokenGuard) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let guard = ConfirmationTokenGuard::new(Duration::from_secs(60), clock.clone());
        (clock, guard)
    }

    #[test]
    fn test_token_format() {
        let (_clock, guard) = guard();
        let issued = guard.issue();
        let token = issued.token.expose_secret();
        assert!(token.starts_with(TOKEN_PREFIX));
        assert_eq!(token.len(), TOKEN_PREFIX.len() + 32);
        assert!(token[TOKEN_PREFIX.len()..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        assert_eq!(issued.ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_token_is_single_use() {
        let (_clock, guard) = guard();
        let token = guard.issue().token.expose_secret().to_string();

        assert!(matches!(guard.validate_and_consume(&token), ConfirmationOutcome::Accepted));
        assert!(matches!(
            guard.validate_and_consume(&token),
            ConfirmationOutcome::NoneOrExpired
        ));
    }

    #[test]
    fn test_reissue_invalidates_previous_token() {
        let (_clock, guard) = guard();
        let first = guard.issue().token.expose_secret().to_string();
        let second = guard.issue().token.expose_secret().to_string();
        assert_ne!(first, second);

        match guard.validate_and_consume(&first) {
            ConfirmationOutcome::Mismatch { expected, remaining } => {
                assert_eq!(expected.expose_secret(), second);
                assert_eq!(remaining, Duration::from_secs(60));
            },
            other => panic!("expected mismatch, got {other:?}"),
        }
        // A mismatch leaves the pending token usable.
        assert!(matches!(guard.validate_and_consume(&second), ConfirmationOutcome::Accepted));
    }

    #[test]
    fn test_expired_token_rejected() {
        let (clock, guard) = guard();
        let token = guard.issue().token.expose_secret().to_string();
        clock.advance(Duration::from_secs(30));
        assert_eq!(guard.pending_remaining(), Some(Duration::from_secs(30)));

        clock.advance(Duration::from_secs(30));
        assert_eq!(guard.pending_remaining(), None);
        assert!(matches!(
            guard.validate_and_consume(&token),
            ConfirmationOutcome::NoneOrExpired
        ));
    }

    #[test]
    fn test_validate_without_issue() {
        let (_clock, guard) = guard();
        assert!(matches!(
            guard.validate_and_consume("PURGE-00"),
            ConfirmationOutcome::NoneOrExpired
        ));
    }

    #[test]
    fn test_debug_output_hides_token() {
        let (_clock, guard) = guard();
        let issued = guard.issue();
        let token = issued.token.expose_secret().to_string();
        let outcome = guard.validate_and_consume("wrong");
        let rendered = format!("{issued:?} {outcome:?} {guard:?}");
        assert!(!rendered.contains(&token));
    }
}
