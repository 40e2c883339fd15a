// Token bucket rate limiter without a separate replenishment process

use std::time::Instant;

/// Token bucket governing bytes per second. A limit of 0 disables
/// limiting entirely.
pub struct RateLimiter {
    limit_per_sec: u64,
    bucket_tokens: u64,
    bucket_last_update: Instant,
}

impl RateLimiter {
    pub fn new(limit_per_sec: u64) -> Self {
        Self {
            limit_per_sec,
            bucket_tokens: limit_per_sec,
            bucket_last_update: Instant::now(),
        }
    }

    fn replenish(&mut self, now: Instant) {
        let lapse = now.duration_since(self.bucket_last_update).as_secs_f64();
        self.bucket_tokens = self
            .limit_per_sec
            .min(self.bucket_tokens + (lapse * self.limit_per_sec as f64) as u64);
        self.bucket_last_update = now;
    }

    /// Extract the minimum of the available and the desired number of
    /// tokens.
    pub fn extract_tokens(&mut self, desired: u64) -> u64 {
        self.extract_tokens_at(desired, Instant::now())
    }

    pub fn extract_tokens_at(&mut self, desired: u64, now: Instant) -> u64 {
        if self.limit_per_sec == 0 {
            return desired;
        }
        self.replenish(now);
        let extracted = desired.min(self.bucket_tokens);
        self.bucket_tokens -= extracted;
        extracted
    }

    /// Consume `tokens` if they are all available right now.
    pub fn grant(&mut self, tokens: u64) -> bool {
        self.grant_at(tokens, Instant::now())
    }

    pub fn grant_at(&mut self, tokens: u64, now: Instant) -> bool {
        if self.limit_per_sec == 0 {
            return true;
        }
        self.replenish(now);
        if self.bucket_tokens >= tokens {
            self.bucket_tokens -= tokens;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_unlimited_when_limit_is_zero() {
        let mut limiter = RateLimiter::new(0);
        assert_eq!(limiter.extract_tokens(1_000_000), 1_000_000);
        assert!(limiter.grant(u64::MAX));
    }

    #[test]
    fn test_extract_caps_at_available() {
        let mut limiter = RateLimiter::new(100);
        let start = Instant::now();
        assert_eq!(limiter.extract_tokens_at(60, start), 60);
        assert_eq!(limiter.extract_tokens_at(60, start), 40);
        assert_eq!(limiter.extract_tokens_at(60, start), 0);
    }

    #[test]
    fn test_replenishes_with_elapsed_time() {
        let mut limiter = RateLimiter::new(100);
        let start = Instant::now();
        assert_eq!(limiter.extract_tokens_at(100, start), 100);
        // Half a second refills half the bucket.
        let later = start + Duration::from_millis(500);
        assert_eq!(limiter.extract_tokens_at(100, later), 50);
    }

    #[test]
    fn test_bucket_never_exceeds_limit() {
        let mut limiter = RateLimiter::new(100);
        let start = Instant::now();
        let much_later = start + Duration::from_secs(60);
        assert_eq!(limiter.extract_tokens_at(1000, much_later), 100);
    }

    #[test]
    fn test_grant_is_all_or_nothing() {
        let mut limiter = RateLimiter::new(10);
        let start = Instant::now();
        assert!(limiter.grant_at(10, start));
        assert!(!limiter.grant_at(1, start));
    }
}
