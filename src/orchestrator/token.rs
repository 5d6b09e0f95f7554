//! Run generations. Each start mints a token; any continuation holding an
//! older one is stale and must not touch shared state.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RunToken(u64);

impl RunToken {
    pub fn generation(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RunToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run#{}", self.0)
    }
}

/// Monotonic token counter. At most one token is current at a time.
#[derive(Debug, Default)]
pub struct RunTokens {
    current: AtomicU64,
}

impl RunTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mint(&self) -> RunToken {
        RunToken(self.current.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Retire the current token without handing out a replacement.
    pub fn invalidate(&self) {
        self.current.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_current(&self, token: RunToken) -> bool {
        self.current.load(Ordering::SeqCst) == token.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_token_stales_previous() {
        let tokens = RunTokens::new();
        let first = tokens.mint();
        assert!(tokens.is_current(first));

        let second = tokens.mint();
        assert!(!tokens.is_current(first));
        assert!(tokens.is_current(second));
        assert!(second.generation() > first.generation());
    }

    #[test]
    fn test_invalidate_leaves_no_current_token() {
        let tokens = RunTokens::new();
        let token = tokens.mint();
        tokens.invalidate();
        assert!(!tokens.is_current(token));

        let next = tokens.mint();
        assert!(tokens.is_current(next));
        assert_ne!(next, token);
    }

    #[test]
    fn test_display() {
        let tokens = RunTokens::new();
        assert_eq!(tokens.mint().to_string(), "run#1");
    }
}
