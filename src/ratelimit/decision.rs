//! Rate limit decisions.

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// The outcome of one rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// The quota the request was checked against.
    pub limit: u32,
    /// Requests left in the current window, never negative.
    pub remaining: u32,
    /// When the current window ends, in epoch milliseconds.
    pub reset_at_ms: u64,
    /// Seconds a rejected caller should wait, at least 1.
    pub retry_after_secs: u32,
}

impl RateDecision {
    /// Build a decision from the counter value observed after this hit.
    pub fn from_count(limit: u32, count: u32, reset_at_ms: u64, now_ms: u64) -> Self {
        Self {
            allowed: count <= limit,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at_ms,
            retry_after_secs: retry_after_secs(reset_at_ms, now_ms),
        }
    }

    /// Like [`from_count`](Self::from_count), except that the first hit of a
    /// window (`count == 1`) is always admitted, whatever the limit.
    pub fn from_window_count(limit: u32, count: u32, reset_at_ms: u64, now_ms: u64) -> Self {
        let decision = Self::from_count(limit, count, reset_at_ms, now_ms);
        Self {
            allowed: decision.allowed || count == 1,
            ..decision
        }
    }

    /// The window reset time in whole epoch seconds, rounded up.
    pub fn reset_at_secs(&self) -> u64 {
        self.reset_at_ms.div_ceil(1000)
    }
}

fn retry_after_secs(reset_at_ms: u64, now_ms: u64) -> u32 {
    let secs = reset_at_ms.saturating_sub(now_ms).div_ceil(1000);
    u32::try_from(secs).unwrap_or(u32::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_within_limit() {
        let decision = RateDecision::from_count(10, 3, 61_000, 1_000);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 7);
        assert_eq!(decision.retry_after_secs, 60);
    }

    #[test]
    fn test_decision_at_and_over_limit() {
        let at = RateDecision::from_count(5, 5, 2_000, 1_000);
        assert!(at.allowed);
        assert_eq!(at.remaining, 0);

        let over = RateDecision::from_count(5, 9, 2_000, 1_000);
        assert!(!over.allowed);
        assert_eq!(over.remaining, 0);
    }

    #[test]
    fn test_window_count_admits_first_hit() {
        let first = RateDecision::from_window_count(0, 1, 2_000, 1_000);
        assert!(first.allowed);
        assert_eq!(first.remaining, 0);

        assert!(!RateDecision::from_window_count(0, 2, 2_000, 1_000).allowed);
        assert!(!RateDecision::from_count(0, 1, 2_000, 1_000).allowed);
        assert!(RateDecision::from_window_count(3, 3, 2_000, 1_000).allowed);
    }

    #[test]
    fn test_retry_after_is_at_least_one_second() {
        assert_eq!(RateDecision::from_count(1, 2, 1_000, 1_000).retry_after_secs, 1);
        assert_eq!(RateDecision::from_count(1, 2, 500, 1_000).retry_after_secs, 1);
        assert_eq!(RateDecision::from_count(1, 2, 1_001, 1_000).retry_after_secs, 1);
        assert_eq!(RateDecision::from_count(1, 2, 2_001, 1_000).retry_after_secs, 2);
    }

    #[test]
    fn test_reset_at_secs_rounds_up() {
        let decision = RateDecision::from_count(1, 1, 1_700_000_000_001, 0);
        assert_eq!(decision.reset_at_secs(), 1_700_000_001);
    }
}
