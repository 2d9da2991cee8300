/*
[INPUT]:  429 notifications from port calls, cycle completion reports
[OUTPUT]: Per-cycle run/skip/paused decision and entry-blocking flag
[POS]:    Risk layer - centralized rate-limit backoff
[UPDATE]: When backoff shape or recovery policy changes
*/

use std::time::{Duration, Instant};

use tracing::warn;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleDecision {
    Run,
    Skip,
    Paused,
}

/// Tracks consecutive 429s and gates every control cycle.
///
/// Never fails; the only output is the per-cycle decision and the
/// entry-blocking flag.
#[derive(Debug)]
pub struct RateLimitController {
    refresh_interval: Duration,
    consecutive_429: u32,
    pause_until: Option<Instant>,
    last_cycle_rate_limited: bool,
    last_cycle_completed_at: Option<Instant>,
}

impl RateLimitController {
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            refresh_interval,
            consecutive_429: 0,
            pause_until: None,
            last_cycle_rate_limited: false,
            last_cycle_completed_at: None,
        }
    }

    pub fn before_cycle(&self, now: Instant) -> CycleDecision {
        if let Some(until) = self.pause_until
            && now < until
        {
            return CycleDecision::Paused;
        }

        if self.last_cycle_rate_limited
            && let Some(completed) = self.last_cycle_completed_at
            && now.saturating_duration_since(completed) < self.refresh_interval
        {
            return CycleDecision::Skip;
        }

        CycleDecision::Run
    }

    pub fn on_cycle_complete(&mut self, had_rate_limit: bool, now: Instant) {
        self.last_cycle_rate_limited = had_rate_limit;
        self.last_cycle_completed_at = Some(now);
        if !had_rate_limit {
            self.consecutive_429 = self.consecutive_429.saturating_sub(1);
        }
    }

    /// Record a 429 and extend the pause window. The window only ever moves
    /// forward, even when a later registration computes a shorter backoff.
    pub fn register_rate_limit(&mut self, source: &str, now: Instant) {
        self.consecutive_429 = self.consecutive_429.saturating_add(1);

        let backoff = self.backoff(self.consecutive_429);
        let candidate = now + backoff;
        self.pause_until = Some(match self.pause_until {
            Some(current) => current.max(candidate),
            None => candidate,
        });

        warn!(
            source,
            consecutive_429 = self.consecutive_429,
            backoff_ms = backoff.as_millis() as u64,
            "rate limit hit; pausing cycles"
        );
    }

    /// Any recent 429 suppresses fresh entries; reduce-only closes stay allowed.
    pub fn should_block_entries(&self) -> bool {
        self.consecutive_429 >= 1
    }

    pub fn consecutive_429(&self) -> u32 {
        self.consecutive_429
    }

    fn backoff(&self, strikes: u32) -> Duration {
        let base = 2 * self.refresh_interval;
        let exp = strikes.saturating_sub(1).min(16);
        let scaled = base.saturating_mul(1u32 << exp);
        scaled.min(MAX_BACKOFF)
    }
}
