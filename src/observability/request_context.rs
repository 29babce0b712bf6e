//! Per-operation correlation context.
//!
//! The coordinator enters one context per call. Code further down the same
//! thread (retries, pool warnings) reads it through [`current_request_id`]
//! instead of threading the id through every signature.

use std::cell::RefCell;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Correlation data for one coordinator call.
#[derive(Clone, Debug)]
pub struct RequestContext {
    request_id: String,
    operation: &'static str,
    started: Instant,
}

impl RequestContext {
    /// Starts a context for `operation` with a fresh v4 id.
    #[must_use]
    pub fn new(operation: &'static str) -> Self {
        Self::with_id(operation, Uuid::new_v4().to_string())
    }

    /// Starts a context reusing a caller-supplied id.
    #[must_use]
    pub fn with_id(operation: &'static str, request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            operation,
            started: Instant::now(),
        }
    }

    /// Correlation id.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Operation name.
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        self.operation
    }

    /// Time since the context was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

thread_local! {
    static ACTIVE: RefCell<Option<RequestContext>> = const { RefCell::new(None) };
}

/// Restores the enclosing context when dropped.
#[derive(Debug)]
pub struct RequestContextGuard {
    outer: Option<RequestContext>,
}

impl Drop for RequestContextGuard {
    fn drop(&mut self) {
        let outer = self.outer.take();
        ACTIVE.with(|slot| *slot.borrow_mut() = outer);
    }
}

/// Makes `context` the active one on this thread until the guard drops.
#[must_use]
pub fn enter_request_context(context: RequestContext) -> RequestContextGuard {
    let outer = ACTIVE.with(|slot| slot.borrow_mut().replace(context));
    RequestContextGuard { outer }
}

/// Id of the active context on this thread.
#[must_use]
pub fn current_request_id() -> Option<String> {
    ACTIVE.with(|slot| slot.borrow().as_ref().map(|ctx| ctx.request_id.clone()))
}
