//! Admission control and destructive-operation confirmation.

pub mod confirmation;
pub mod rate_limit;

pub use confirmation::{ConfirmationOutcome, ConfirmationTokenGuard, IssuedToken, TOKEN_PREFIX};
pub use rate_limit::{RateLimitConfig, RateLimiter};
