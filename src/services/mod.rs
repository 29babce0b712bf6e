//! Operation surface.
//!
//! The coordinator composes storage and security components and is the only
//! place that maps internal failures to caller-facing errors.

mod coordinator;
pub mod validation;

pub use coordinator::{DEFAULT_RECALL_LIMIT, MAX_RECALL_LIMIT, Operation, ResourceCoordinator};
pub use validation::{sanitize_input, validate_key};
