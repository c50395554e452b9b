//! Correlation token generation.
//!
//! Every outbound frame that expects correlation (acknowledgment, response,
//! or a continuous stream) carries a token produced here. Tokens must be
//! unique across all concurrently pending entries; the default generator
//! draws random UUIDs, which stay collision-free far beyond any realistic
//! pending-table size.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Produces correlation tokens for outbound frames.
pub trait TokenGenerator: Send + Sync {
    /// Generate the next token.
    fn generate(&self) -> String;
}

/// Random UUID tokens in compact (hyphen-free) form. The default.
#[derive(Debug, Default)]
pub struct ShortTokenGenerator;

impl TokenGenerator for ShortTokenGenerator {
    fn generate(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }
}

/// Monotonic counter tokens. Deterministic, useful for diagnostics and
/// tests; do not share one instance across sessions that exchange frames
/// with each other.
#[derive(Debug, Default)]
pub struct SequentialTokenGenerator {
    counter: AtomicU64,
}

impl TokenGenerator for SequentialTokenGenerator {
    fn generate(&self) -> String {
        let next = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        next.to_string()
    }
}
