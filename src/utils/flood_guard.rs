//! Watch and ignore tables for endpoints that send malformed traffic.
//!
//! Every malformed datagram from an endpoint is counted in a one second window. An
//! endpoint that goes over the warning threshold inside one window is ignored: all of
//! its datagrams are dropped unread until the cool-down ends. Each repeat offence
//! doubles the cool-down, up to a configured maximum.
//!
//! This is local, best-effort flood mitigation. Source addresses are not authenticated.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::config::FloodConfig;

const WATCH_WINDOW: Duration = Duration::from_secs(1);

/// Sliding one second window of suspicious events for one endpoint.
#[derive(Debug, Clone, Copy)]
struct Watch {
    window_start: Instant,
    count: u32,
}

/// Active ignore entry.
#[derive(Debug, Clone, Copy)]
struct Ignore {
    until: Instant,
}

/// Offence history, kept after an ignore ends so repeat offenders escalate.
#[derive(Debug, Clone, Copy)]
struct Offence {
    strikes: u32,
    last: Instant,
}

#[derive(Debug)]
pub struct FloodGuard {
    config: FloodConfig,
    watched: DashMap<SocketAddr, Watch>,
    ignored: DashMap<SocketAddr, Ignore>,
    offences: DashMap<SocketAddr, Offence>,
}

impl FloodGuard {
    pub fn new(config: FloodConfig) -> Self {
        Self {
            config,
            watched: DashMap::new(),
            ignored: DashMap::new(),
            offences: DashMap::new(),
        }
    }

    /// Whether datagrams from `addr` are currently being dropped.
    pub fn is_ignored(&self, addr: &SocketAddr, now: Instant) -> bool {
        self.ignored
            .get(addr)
            .is_some_and(|entry| now < entry.until)
    }

    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }

    pub fn ignored_count(&self) -> usize {
        self.ignored.len()
    }

    /// Records one malformed datagram from `addr`.
    ///
    /// Returns `true` if this report moved the endpoint into the ignore table.
    pub fn report(&self, addr: SocketAddr, now: Instant) -> bool {
        let over_threshold = {
            let mut watch = self.watched.entry(addr).or_insert(Watch {
                window_start: now,
                count: 0,
            });
            if now.saturating_duration_since(watch.window_start) >= WATCH_WINDOW {
                watch.window_start = now;
                watch.count = 0;
            }
            watch.count += 1;
            debug!(peer = %addr, count = watch.count, "Endpoint watched");
            watch.count > self.config.warning_threshold
        };

        if !over_threshold {
            return false;
        }

        self.watched.remove(&addr);
        let strikes = {
            let mut offence = self.offences.entry(addr).or_insert(Offence {
                strikes: 0,
                last: now,
            });
            offence.strikes = offence.strikes.saturating_add(1);
            offence.last = now;
            offence.strikes
        };

        let duration = self.ignore_duration(strikes);
        self.ignored.insert(
            addr,
            Ignore {
                until: now + duration,
            },
        );
        warn!(
            peer = %addr,
            strikes,
            ignore_ms = duration.as_millis() as u64,
            "Endpoint exceeded malformed packet threshold, ignoring"
        );
        true
    }

    /// Cool-down for the n-th offence: base * 2^(n-1), capped.
    pub fn ignore_duration(&self, strikes: u32) -> Duration {
        let exponent = strikes.saturating_sub(1).min(16);
        self.config
            .base_ignore_duration
            .saturating_mul(1u32 << exponent)
            .min(self.config.max_ignore_duration)
    }

    /// Purges expired watch windows, ignore entries and old offence history.
    pub fn maintain(&self, now: Instant) {
        self.watched
            .retain(|_, watch| now.saturating_duration_since(watch.window_start) < WATCH_WINDOW);
        self.ignored.retain(|addr, entry| {
            let keep = now < entry.until;
            if !keep {
                debug!(peer = %addr, "Endpoint no longer ignored");
            }
            keep
        });
        let memory = self.config.max_ignore_duration * 2;
        self.offences
            .retain(|_, offence| now.saturating_duration_since(offence.last) < memory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 4000))
    }

    fn guard(threshold: u32) -> FloodGuard {
        FloodGuard::new(FloodConfig {
            warning_threshold: threshold,
            base_ignore_duration: Duration::from_secs(1),
            max_ignore_duration: Duration::from_secs(5),
        })
    }

    #[test]
    fn test_threshold_triggers_ignore() {
        let guard = guard(3);
        let now = Instant::now();
        for _ in 0..3 {
            assert!(!guard.report(addr(), now));
        }
        assert!(!guard.is_ignored(&addr(), now));
        assert!(guard.report(addr(), now));
        assert!(guard.is_ignored(&addr(), now));
    }

    #[test]
    fn test_window_resets() {
        let guard = guard(2);
        let start = Instant::now();
        guard.report(addr(), start);
        guard.report(addr(), start);
        // next report lands in a fresh window
        assert!(!guard.report(addr(), start + Duration::from_millis(1100)));
    }

    #[test]
    fn test_ignore_expires() {
        let guard = guard(0);
        let now = Instant::now();
        assert!(guard.report(addr(), now));
        assert!(guard.is_ignored(&addr(), now + Duration::from_millis(900)));
        assert!(!guard.is_ignored(&addr(), now + Duration::from_millis(1000)));

        guard.maintain(now + Duration::from_secs(2));
        assert_eq!(guard.ignored_count(), 0);
    }

    #[test]
    fn test_exponential_cooldown() {
        let guard = guard(1);
        assert_eq!(guard.ignore_duration(1), Duration::from_secs(1));
        assert_eq!(guard.ignore_duration(2), Duration::from_secs(2));
        assert_eq!(guard.ignore_duration(3), Duration::from_secs(4));
        assert_eq!(guard.ignore_duration(4), Duration::from_secs(5));
        assert_eq!(guard.ignore_duration(40), Duration::from_secs(5));
    }

    #[test]
    fn test_repeat_offender_escalates() {
        let guard = guard(0);
        let start = Instant::now();
        guard.report(addr(), start);
        let later = start + Duration::from_millis(1500);
        assert!(!guard.is_ignored(&addr(), later));
        guard.report(addr(), later);
        // second strike lasts two seconds
        assert!(guard.is_ignored(&addr(), later + Duration::from_millis(1500)));
    }
}
