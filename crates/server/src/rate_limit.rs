//! Token bucket rate limiter for voice connections
//!
//! Each connection gets one bucket for control messages and one for inbound audio bytes.
//! Exceeding either drops the offending message; the connection stays open.

use std::time::Instant;

use voice_session_config::RateLimitConfig;

/// A single refilling bucket
#[derive(Debug, Clone)]
struct TokenBucket {
    rate: f32,
    capacity: f32,
    tokens: f32,
}

impl TokenBucket {
    fn new(per_second: u32, burst_multiplier: f32) -> Self {
        let rate = per_second as f32;
        let capacity = rate * burst_multiplier.max(1.0);
        Self {
            rate,
            capacity,
            tokens: capacity,
        }
    }

    fn refill(&mut self, elapsed_secs: f32) {
        self.tokens = (self.tokens + elapsed_secs * self.rate).min(self.capacity);
    }

    fn take(&mut self, amount: f32) -> bool {
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }
}

/// Per-connection limiter
#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    messages: TokenBucket,
    audio: TokenBucket,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            messages: TokenBucket::new(config.messages_per_second, config.burst_multiplier),
            audio: TokenBucket::new(config.audio_bytes_per_second, config.burst_multiplier),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f32();
        if elapsed > 0.0 {
            self.messages.refill(elapsed);
            self.audio.refill(elapsed);
            self.last_refill = now;
        }
    }

    /// Account for one control message
    pub fn check_message(&mut self) -> Result<(), RateLimitError> {
        if !self.enabled {
            return Ok(());
        }
        self.refill();
        if self.messages.take(1.0) {
            Ok(())
        } else {
            Err(RateLimitError::MessageRateExceeded)
        }
    }

    /// Account for one inbound audio packet of `bytes` bytes
    pub fn check_audio(&mut self, bytes: usize) -> Result<(), RateLimitError> {
        if !self.enabled {
            return Ok(());
        }
        self.refill();
        if self.audio.take(bytes as f32) {
            Ok(())
        } else {
            Err(RateLimitError::AudioRateExceeded)
        }
    }

    pub fn remaining_message_tokens(&self) -> f32 {
        self.messages.tokens
    }

    pub fn remaining_audio_tokens(&self) -> f32 {
        self.audio.tokens
    }
}

/// Rate limit errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    MessageRateExceeded,
    AudioRateExceeded,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimitError::MessageRateExceeded => write!(f, "Message rate limit exceeded"),
            RateLimitError::AudioRateExceeded => write!(f, "Audio rate limit exceeded"),
        }
    }
}

impl std::error::Error for RateLimitError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(enabled: bool, messages: u32, audio: u32, burst: f32) -> RateLimitConfig {
        RateLimitConfig {
            enabled,
            messages_per_second: messages,
            audio_bytes_per_second: audio,
            burst_multiplier: burst,
        }
    }

    #[test]
    fn test_burst_allowance() {
        let mut limiter = RateLimiter::new(&config(true, 10, 1000, 2.0));
        for _ in 0..20 {
            assert!(limiter.check_message().is_ok());
        }
        assert_eq!(limiter.check_message(), Err(RateLimitError::MessageRateExceeded));
    }

    #[test]
    fn test_disabled_limiter_allows_everything() {
        let mut limiter = RateLimiter::new(&config(false, 1, 1, 1.0));
        for _ in 0..1000 {
            assert!(limiter.check_message().is_ok());
            assert!(limiter.check_audio(4096).is_ok());
        }
    }

    #[test]
    fn test_audio_bytes() {
        let mut limiter = RateLimiter::new(&config(true, 100, 1000, 1.0));
        assert!(limiter.check_audio(500).is_ok());
        assert!(limiter.check_audio(500).is_ok());
        assert_eq!(limiter.check_audio(100), Err(RateLimitError::AudioRateExceeded));
        // Message bucket is independent
        assert!(limiter.check_message().is_ok());
    }

    #[test]
    fn test_refill_is_capped() {
        let mut bucket = TokenBucket::new(10, 1.0);
        assert!(bucket.take(10.0));
        bucket.refill(0.5);
        assert!((bucket.tokens - 5.0).abs() < f32::EPSILON);
        bucket.refill(60.0);
        assert!((bucket.tokens - 10.0).abs() < f32::EPSILON);
    }
}
