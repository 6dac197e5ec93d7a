//! Timer tokens. The host schedules timers; the core only hands out tokens
//! and ignores firings whose token is no longer current.

/// Identifies one arming of a timer. A re-armed timer gets a fresh token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(u64);

impl TimerToken {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Monotonic token source.
#[derive(Debug, Default)]
pub struct TimerTokens {
    next: u64,
}

impl TimerTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&mut self) -> TimerToken {
        self.next += 1;
        TimerToken(self.next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique() {
        let mut tokens = TimerTokens::new();
        let a = tokens.issue();
        let b = tokens.issue();
        assert_ne!(a, b);
        assert!(b.get() > a.get());
    }
}
