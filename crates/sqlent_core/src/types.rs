//! Small shared types: retry policy and callbacks.

use std::fmt;

/// Callback invoked when the manager transitions from clean to dirty.
pub type OnChange = Box<dyn Fn() + Send + Sync>;

/// Policy applied when the engine reports BUSY.
///
/// Consulted once per failed attempt with the attempt count so far.
/// Ignored while a transaction is active; transactions never retry.
pub enum Retry {
    /// Give up immediately (the default).
    Never,
    /// Retry until the statement succeeds.
    Forever,
    /// Retry at most this many times.
    UpTo(u32),
    /// Ask the predicate, passing the number of attempts made so far.
    Predicate(Box<dyn Fn(u32) -> bool + Send + Sync>),
}

impl Retry {
    /// Returns true if another attempt should be made after `attempts`
    /// failures.
    #[must_use]
    pub fn should_retry(&self, attempts: u32) -> bool {
        match self {
            Retry::Never => false,
            Retry::Forever => true,
            Retry::UpTo(n) => attempts < *n,
            Retry::Predicate(f) => f(attempts),
        }
    }
}

impl Default for Retry {
    fn default() -> Self {
        Retry::Never
    }
}

impl From<bool> for Retry {
    fn from(v: bool) -> Self {
        if v {
            Retry::Forever
        } else {
            Retry::Never
        }
    }
}

impl From<u32> for Retry {
    fn from(n: u32) -> Self {
        Retry::UpTo(n)
    }
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Retry::Never => write!(f, "Retry::Never"),
            Retry::Forever => write!(f, "Retry::Forever"),
            Retry::UpTo(n) => write!(f, "Retry::UpTo({n})"),
            Retry::Predicate(_) => write!(f, "Retry::Predicate(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_and_forever() {
        assert!(!Retry::Never.should_retry(0));
        assert!(Retry::Forever.should_retry(1000));
    }

    #[test]
    fn bounded() {
        let retry = Retry::UpTo(2);
        assert!(retry.should_retry(0));
        assert!(retry.should_retry(1));
        assert!(!retry.should_retry(2));
    }

    #[test]
    fn predicate() {
        let retry = Retry::Predicate(Box::new(|n| n % 2 == 0));
        assert!(retry.should_retry(0));
        assert!(!retry.should_retry(1));
    }

    #[test]
    fn conversions() {
        assert!(matches!(Retry::from(true), Retry::Forever));
        assert!(matches!(Retry::from(false), Retry::Never));
        assert!(matches!(Retry::from(3u32), Retry::UpTo(3)));
    }
}
