//! Monotonic token generation with collision rejection.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::Error;

/// Number of rejected candidates tolerated before giving up.
const MAX_COLLISIONS: u32 = 1000;

/// Monotonically incrementing token source.
///
/// The caller supplies a callback that rejects tokens still live in its own
/// tables; after [`MAX_COLLISIONS`] consecutive rejections the generator
/// fails with [`Error::TokenExhausted`].
#[derive(Debug, Default)]
pub struct TokenGenerator {
    next: AtomicU32,
}

impl TokenGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_token(&self, in_use: impl Fn(u32) -> bool) -> Result<u32, Error> {
        for _ in 0..MAX_COLLISIONS {
            let token = self.next.fetch_add(1, Ordering::Relaxed);
            if !in_use(token) {
                return Ok(token);
            }
        }
        Err(Error::TokenExhausted)
    }
}
