//! Outbound message rate limiting.
//!
//! Each Discord channel gets its own sliding one-minute window so a busy
//! bounty board cannot starve announcements elsewhere in the guild.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;

const WINDOW: Duration = Duration::from_secs(60);

/// Rate limiting error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RateLimitError {
    /// Budget exhausted; the oldest send leaves the window after `retry_after_secs`.
    #[error("channel {channel_id} rate limited; retry after {retry_after_secs}s")]
    Exceeded {
        channel_id: u64,
        retry_after_secs: u64,
    },
}

/// Sliding-window limiter for one channel.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_messages_per_minute: u32,
    window: VecDeque<Instant>,
    held_until: Option<Instant>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(max_messages_per_minute: u32) -> Self {
        Self {
            max_messages_per_minute,
            window: VecDeque::new(),
            held_until: None,
        }
    }

    /// Refuse every send until `until`, whatever the window holds.
    pub fn hold_until(&mut self, until: Instant) {
        self.held_until = Some(self.held_until.map_or(until, |held| held.max(until)));
    }

    /// Record a send at `now` if the budget allows it.
    ///
    /// On refusal returns the wait, in whole seconds rounded up, until a
    /// slot frees.
    pub fn try_send_at(&mut self, now: Instant) -> Result<(), u64> {
        if let Some(until) = self.held_until {
            if now < until {
                let remaining = until.duration_since(now);
                return Err(remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0));
            }
            self.held_until = None;
        }

        while self
            .window
            .front()
            .is_some_and(|first| now.duration_since(*first) >= WINDOW)
        {
            self.window.pop_front();
        }

        if self.window.len() >= self.max_messages_per_minute as usize {
            let oldest = self.window.front().copied().unwrap_or(now);
            let remaining = WINDOW.saturating_sub(now.duration_since(oldest));
            return Err(remaining.as_secs().saturating_add(1));
        }

        self.window.push_back(now);
        Ok(())
    }

    /// Messages still allowed in the current window.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.max_messages_per_minute
            .saturating_sub(u32::try_from(self.window.len()).unwrap_or(u32::MAX))
    }
}

/// Limiters for every channel the bot has announced to.
#[derive(Debug)]
pub struct ChannelRateLimiters {
    per_minute: u32,
    limiters: HashMap<u64, RateLimiter>,
}

impl ChannelRateLimiters {
    /// Every channel gets a budget of `per_minute` messages.
    #[must_use]
    pub fn new(per_minute: u32) -> Self {
        Self {
            per_minute,
            limiters: HashMap::new(),
        }
    }

    pub fn try_send(&mut self, channel_id: u64) -> Result<(), RateLimitError> {
        self.try_send_at(channel_id, Instant::now())
    }

    pub fn try_send_at(&mut self, channel_id: u64, now: Instant) -> Result<(), RateLimitError> {
        let per_minute = self.per_minute;
        self.limiters
            .entry(channel_id)
            .or_insert_with(|| RateLimiter::new(per_minute))
            .try_send_at(now)
            .map_err(|retry_after_secs| RateLimitError::Exceeded {
                channel_id,
                retry_after_secs,
            })
    }

    /// Back off `channel_id` for `retry_after`, as told by the server.
    pub fn hold(&mut self, channel_id: u64, retry_after: Duration) {
        self.hold_at(channel_id, Instant::now(), retry_after);
    }

    pub fn hold_at(&mut self, channel_id: u64, now: Instant, retry_after: Duration) {
        let per_minute = self.per_minute;
        self.limiters
            .entry(channel_id)
            .or_insert_with(|| RateLimiter::new(per_minute))
            .hold_until(now + retry_after);
    }

    /// Messages left for `channel_id`; unseen channels have the full budget.
    #[must_use]
    pub fn remaining(&self, channel_id: u64) -> u32 {
        self.limiters
            .get(&channel_id)
            .map_or(self.per_minute, RateLimiter::remaining)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn blocks_after_budget_and_reports_wait() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(3);
        for i in 0..3 {
            assert!(limiter.try_send_at(start + Duration::from_secs(i)).is_ok());
        }
        assert_eq!(limiter.remaining(), 0);

        let wait = limiter.try_send_at(start + Duration::from_secs(10)).unwrap_err();
        assert_eq!(wait, 51);
    }

    #[test]
    fn window_slides() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(2);
        assert!(limiter.try_send_at(start).is_ok());
        assert!(limiter.try_send_at(start + Duration::from_secs(30)).is_ok());
        assert!(limiter.try_send_at(start + Duration::from_secs(59)).is_err());

        assert!(limiter.try_send_at(start + Duration::from_secs(60)).is_ok());
        assert!(limiter.try_send_at(start + Duration::from_secs(61)).is_err());
        assert!(limiter.try_send_at(start + Duration::from_secs(90)).is_ok());
    }

    #[test]
    fn channels_are_isolated() {
        let now = Instant::now();
        let mut limiters = ChannelRateLimiters::new(1);
        assert!(limiters.try_send_at(100, now).is_ok());
        assert_eq!(
            limiters.try_send_at(100, now),
            Err(RateLimitError::Exceeded {
                channel_id: 100,
                retry_after_secs: 61
            })
        );
        assert!(limiters.try_send_at(200, now).is_ok());
        assert_eq!(limiters.remaining(100), 0);
        assert_eq!(limiters.remaining(300), 1);
    }

    #[test]
    fn server_hold_blocks_until_it_lapses() {
        let now = Instant::now();
        let mut limiters = ChannelRateLimiters::new(10);
        limiters.hold_at(5, now, Duration::from_millis(2500));
        assert_eq!(
            limiters.try_send_at(5, now + Duration::from_secs(1)),
            Err(RateLimitError::Exceeded {
                channel_id: 5,
                retry_after_secs: 2
            })
        );
        assert!(limiters.try_send_at(6, now).is_ok());
        assert!(limiters.try_send_at(5, now + Duration::from_secs(3)).is_ok());
    }
}
