//! Session lifetime: CancellationToken + batch generation guard.
//! Ensures results of a superseded batch, or of a disposed session, are
//! discarded instead of being applied to stale state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Owned by one discovery session. Each `initialize` advances the
/// generation; `dispose` cancels the token for good.
pub struct SessionLifetime {
    token: CancellationToken,
    generation: Arc<AtomicU64>,
}

impl Default for SessionLifetime {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLifetime {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start a new generation; guards taken earlier stop being current.
    pub fn advance(&self) -> BatchGuard {
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.guard_for(gen)
    }

    /// Guard for the current generation without advancing it.
    pub fn guard(&self) -> BatchGuard {
        self.guard_for(self.generation.load(Ordering::SeqCst))
    }

    fn guard_for(&self, my_generation: u64) -> BatchGuard {
        BatchGuard {
            generation: Arc::clone(&self.generation),
            my_generation,
            token: self.token.child_token(),
        }
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn dispose(&self) {
        self.token.cancel();
    }

    pub fn is_disposed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Checked by a batch before it writes a result.
#[derive(Clone)]
pub struct BatchGuard {
    generation: Arc<AtomicU64>,
    my_generation: u64,
    token: CancellationToken,
}

impl BatchGuard {
    #[inline]
    pub fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.my_generation
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Not disposed and still the current generation.
    #[inline]
    pub fn should_apply(&self) -> bool {
        !self.is_cancelled() && self.is_current()
    }

    pub fn my_generation(&self) -> u64 {
        self.my_generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advancing_invalidates_older_guards() {
        let lifetime = SessionLifetime::new();
        let first = lifetime.advance();
        assert!(first.should_apply());

        let second = lifetime.advance();
        assert!(!first.should_apply());
        assert!(second.should_apply());
        assert_eq!(second.my_generation(), 2);
        assert!(lifetime.guard().should_apply());
    }

    #[test]
    fn dispose_cancels_every_guard() {
        let lifetime = SessionLifetime::new();
        let guard = lifetime.guard();
        lifetime.dispose();
        assert!(lifetime.is_disposed());
        assert!(guard.is_current());
        assert!(!guard.should_apply());
        assert!(!lifetime.advance().should_apply());
    }
}
