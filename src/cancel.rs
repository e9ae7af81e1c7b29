//! Cooperative cancellation for long-running enumerations.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Shared interruption flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Result of a cancellable computation. A cancelled run still carries
/// whatever was produced before the interruption was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Complete(T),
    Cancelled(T),
}

impl<T> Outcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled(_))
    }

    pub fn value(&self) -> &T {
        match self {
            Outcome::Complete(v) | Outcome::Cancelled(v) => v,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            Outcome::Complete(v) | Outcome::Cancelled(v) => v,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Complete(v) => Outcome::Complete(f(v)),
            Outcome::Cancelled(v) => Outcome::Cancelled(f(v)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn outcome_keeps_partial_values() {
        let outcome = Outcome::Cancelled(vec![1, 2]).map(|v| v.len());
        assert!(outcome.is_cancelled());
        assert_eq!(outcome.into_inner(), 2);
    }
}
