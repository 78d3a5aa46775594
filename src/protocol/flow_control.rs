//! Per-connection flow control.
//!
//! ## MTU discovery
//! `Unset -> Setting -> Set`. While setting, a probe of the current size is sent; every
//! acknowledged probe grows the size by 25% up to the hard cap. A probe that cannot be sent,
//! or goes unanswered for the configured number of attempts, fixes the MTU at 75% of its
//! size. While probing, the usable MTU is the last size that was confirmed.
//!
//! ## Send throttle
//! Round-trip samples are averaged over a small window. The first full window sets the base
//! ping. A later window well above the base drops the connection to the throttled tier
//! (lower heartbeat rate, longer chunk interval); falling back below restores the normal
//! tier. A window well below the base re-baselines. Tier changes are rate limited by a
//! cooldown. This only paces this connection's own sends.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::{ConnectionConfig, TransportConfig};

/// Growth factor between successful probes.
const MTU_GROWTH: f64 = 1.25;

/// Fraction of a failed probe size taken as the final MTU.
const MTU_BACKOFF: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtuState {
    Unset,
    Setting,
    Set,
}

/// What the connection must do after feeding the discovery state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtuAction {
    Idle,
    /// Send a probe datagram of exactly this many bytes.
    Probe(usize),
    /// Discovery finished with this MTU.
    Settled(usize),
}

#[derive(Debug, Clone)]
pub struct MtuDiscovery {
    state: MtuState,
    confirmed: usize,
    probing: usize,
    attempts: u32,
    last_probe: Option<Instant>,
    min_mtu: usize,
    initial_probe: usize,
    max_mtu: usize,
    max_attempts: u32,
    enabled: bool,
}

impl MtuDiscovery {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            state: MtuState::Unset,
            confirmed: config.min_mtu,
            probing: config.mtu_initial_probe,
            attempts: 0,
            last_probe: None,
            min_mtu: config.min_mtu,
            initial_probe: config.mtu_initial_probe,
            max_mtu: config.max_mtu,
            max_attempts: config.mtu_probe_attempts.max(1),
            enabled: config.mtu_discovery_enabled,
        }
    }

    pub fn state(&self) -> MtuState {
        self.state
    }

    /// The MTU usable for sends right now.
    pub fn effective_mtu(&self) -> usize {
        self.confirmed
    }

    /// Size currently being probed.
    pub fn probing(&self) -> usize {
        self.probing
    }

    /// Leaves `Unset`. Returns the first probe, or settles on the minimum when disabled.
    pub fn start(&mut self, now: Instant) -> MtuAction {
        if self.state != MtuState::Unset {
            return MtuAction::Idle;
        }
        if !self.enabled {
            self.state = MtuState::Set;
            return MtuAction::Settled(self.confirmed);
        }
        self.state = MtuState::Setting;
        self.probing = self.initial_probe;
        self.attempts = 1;
        self.last_probe = Some(now);
        MtuAction::Probe(self.probing)
    }

    /// Re-sends an unanswered probe, or gives up after the last attempt.
    pub fn poll(&mut self, now: Instant, retry_after: Duration) -> MtuAction {
        if self.state != MtuState::Setting {
            return MtuAction::Idle;
        }
        let waited = self
            .last_probe
            .map_or(Duration::MAX, |last| now.saturating_duration_since(last));
        if waited <= retry_after {
            return MtuAction::Idle;
        }
        if self.attempts >= self.max_attempts {
            debug!(size = self.probing, "MTU probe unanswered");
            return self.fail();
        }
        self.attempts += 1;
        self.last_probe = Some(now);
        MtuAction::Probe(self.probing)
    }

    /// Handles the peer's reply to a probe of `size` bytes.
    pub fn on_reply(&mut self, size: usize, now: Instant) -> MtuAction {
        if self.state != MtuState::Setting || size != self.probing {
            return MtuAction::Idle;
        }
        self.confirmed = size;
        if size >= self.max_mtu {
            self.state = MtuState::Set;
            return MtuAction::Settled(size);
        }
        let next = ((size as f64) * MTU_GROWTH).ceil() as usize;
        self.probing = next.min(self.max_mtu);
        self.attempts = 1;
        self.last_probe = Some(now);
        MtuAction::Probe(self.probing)
    }

    /// The probe of the current size could not be sent.
    pub fn on_send_failure(&mut self) -> MtuAction {
        if self.state != MtuState::Setting {
            return MtuAction::Idle;
        }
        self.fail()
    }

    fn fail(&mut self) -> MtuAction {
        let backed_off = ((self.probing as f64) * MTU_BACKOFF) as usize;
        self.confirmed = backed_off.min(self.max_mtu).max(self.min_mtu);
        self.state = MtuState::Set;
        MtuAction::Settled(self.confirmed)
    }
}

/// Rolling window of round-trip samples.
#[derive(Debug, Clone)]
pub struct PingWindow {
    samples: Vec<Duration>,
    size: usize,
}

impl PingWindow {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            samples: Vec::with_capacity(size),
            size,
        }
    }

    /// Adds a sample. Returns the window average when the window fills, then starts over.
    pub fn record(&mut self, rtt: Duration) -> Option<Duration> {
        self.samples.push(rtt);
        if self.samples.len() < self.size {
            return None;
        }
        let total: Duration = self.samples.drain(..).sum();
        Some(total / self.size as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateTier {
    Normal,
    Throttled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleChange {
    None,
    /// First full window; this average is the base ping.
    Baseline(Duration),
    Dropped,
    Restored,
    Rebaselined(Duration),
}

#[derive(Debug, Clone)]
pub struct SendThrottle {
    base: Option<Duration>,
    tier: RateTier,
    last_change: Option<Instant>,
    spike: Duration,
    rebaseline: Duration,
    cooldown: Duration,
    normal: (u32, Duration),
    throttled: (u32, Duration),
}

impl SendThrottle {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            base: None,
            tier: RateTier::Normal,
            last_change: None,
            spike: config.ping_spike_threshold,
            rebaseline: config.ping_rebaseline_threshold,
            cooldown: config.rate_change_cooldown,
            normal: (config.send_rate.max(1), config.chunk_send_interval),
            throttled: (
                config.throttled_send_rate.max(1),
                config.throttled_chunk_send_interval,
            ),
        }
    }

    pub fn tier(&self) -> RateTier {
        self.tier
    }

    pub fn base_ping(&self) -> Option<Duration> {
        self.base
    }

    /// Heartbeats per second for the current tier.
    pub fn send_rate(&self) -> u32 {
        match self.tier {
            RateTier::Normal => self.normal.0,
            RateTier::Throttled => self.throttled.0,
        }
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_secs(1) / self.send_rate()
    }

    pub fn chunk_interval(&self) -> Duration {
        match self.tier {
            RateTier::Normal => self.normal.1,
            RateTier::Throttled => self.throttled.1,
        }
    }

    fn cooled_down(&self, now: Instant) -> bool {
        self.last_change
            .map_or(true, |last| now.saturating_duration_since(last) >= self.cooldown)
    }

    /// Feeds one completed window average.
    pub fn on_window(&mut self, avg: Duration, now: Instant) -> ThrottleChange {
        let Some(base) = self.base else {
            self.base = Some(avg);
            return ThrottleChange::Baseline(avg);
        };

        if avg > base + self.spike {
            if self.tier == RateTier::Normal && self.cooled_down(now) {
                self.tier = RateTier::Throttled;
                self.last_change = Some(now);
                info!(
                    avg_ms = avg.as_millis() as u64,
                    base_ms = base.as_millis() as u64,
                    "Ping spike, throttling send rate"
                );
                return ThrottleChange::Dropped;
            }
            return ThrottleChange::None;
        }

        if self.tier == RateTier::Throttled {
            if self.cooled_down(now) {
                self.tier = RateTier::Normal;
                self.last_change = Some(now);
                info!(avg_ms = avg.as_millis() as u64, "Ping recovered, restoring send rate");
                return ThrottleChange::Restored;
            }
            return ThrottleChange::None;
        }

        if avg + self.rebaseline < base {
            self.base = Some(avg);
            debug!(base_ms = avg.as_millis() as u64, "Base ping lowered");
            return ThrottleChange::Rebaselined(avg);
        }

        ThrottleChange::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> TransportConfig {
        TransportConfig {
            min_mtu: 508,
            mtu_initial_probe: 508,
            max_mtu: 1400,
            mtu_probe_attempts: 2,
            ..TransportConfig::default()
        }
    }

    #[test]
    fn test_mtu_grows_to_cap() {
        let mut mtu = MtuDiscovery::new(&transport());
        let now = Instant::now();
        assert_eq!(mtu.start(now), MtuAction::Probe(508));

        let mut sizes = vec![508];
        loop {
            match mtu.on_reply(*sizes.last().unwrap_or(&0), now) {
                MtuAction::Probe(next) => {
                    // effective MTU lags one probe behind
                    assert_eq!(mtu.effective_mtu(), *sizes.last().unwrap_or(&0));
                    sizes.push(next);
                }
                MtuAction::Settled(final_mtu) => {
                    assert_eq!(final_mtu, 1400);
                    break;
                }
                MtuAction::Idle => panic!("probe reply ignored"),
            }
        }
        assert!(sizes.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(mtu.state(), MtuState::Set);
        assert_eq!(mtu.effective_mtu(), 1400);
    }

    #[test]
    fn test_mtu_send_failure_backs_off() {
        let mut mtu = MtuDiscovery::new(&transport());
        let now = Instant::now();
        mtu.start(now);
        assert_eq!(mtu.on_reply(508, now), MtuAction::Probe(635));
        assert_eq!(mtu.on_reply(635, now), MtuAction::Probe(794));
        // 794 * 0.75 = 595
        assert_eq!(mtu.on_send_failure(), MtuAction::Settled(595));
        assert_eq!(mtu.effective_mtu(), 595);

        // stable once set
        assert_eq!(mtu.on_reply(794, now), MtuAction::Idle);
        assert_eq!(mtu.poll(now + Duration::from_secs(10), Duration::ZERO), MtuAction::Idle);
        assert_eq!(mtu.effective_mtu(), 595);
    }

    #[test]
    fn test_mtu_unanswered_probe_fails_after_attempts() {
        let mut mtu = MtuDiscovery::new(&transport());
        let start = Instant::now();
        let retry = Duration::from_millis(100);
        mtu.start(start);

        assert_eq!(mtu.poll(start + Duration::from_millis(50), retry), MtuAction::Idle);
        let t1 = start + Duration::from_millis(150);
        assert_eq!(mtu.poll(t1, retry), MtuAction::Probe(508));
        let t2 = t1 + Duration::from_millis(150);
        // 508 * 0.75 = 381, clamped up to the minimum
        assert_eq!(mtu.poll(t2, retry), MtuAction::Settled(508));
    }

    #[test]
    fn test_mtu_disabled_settles_at_minimum() {
        let config = TransportConfig {
            mtu_discovery_enabled: false,
            ..transport()
        };
        let mut mtu = MtuDiscovery::new(&config);
        assert_eq!(mtu.start(Instant::now()), MtuAction::Settled(508));
    }

    #[test]
    fn test_ping_window_average() {
        let mut window = PingWindow::new(5);
        for ms in [10, 20, 30, 40] {
            assert!(window.record(Duration::from_millis(ms)).is_none());
        }
        assert_eq!(
            window.record(Duration::from_millis(50)),
            Some(Duration::from_millis(30))
        );
        // starts over
        assert!(window.record(Duration::from_millis(50)).is_none());
    }

    fn throttle() -> SendThrottle {
        SendThrottle::new(&ConnectionConfig {
            rate_change_cooldown: Duration::from_secs(5),
            ..ConnectionConfig::default()
        })
    }

    #[test]
    fn test_throttle_drop_and_restore() {
        let mut throttle = throttle();
        let start = Instant::now();
        let ms = Duration::from_millis;

        assert_eq!(throttle.on_window(ms(50), start), ThrottleChange::Baseline(ms(50)));
        assert_eq!(throttle.send_rate(), 60);

        assert_eq!(throttle.on_window(ms(200), start), ThrottleChange::Dropped);
        assert_eq!(throttle.tier(), RateTier::Throttled);
        assert_eq!(throttle.send_rate(), 20);
        assert_eq!(throttle.chunk_interval(), ms(50));

        // recovered, but still inside the cooldown
        assert_eq!(throttle.on_window(ms(60), start + ms(1000)), ThrottleChange::None);
        assert_eq!(
            throttle.on_window(ms(60), start + ms(6000)),
            ThrottleChange::Restored
        );
        assert_eq!(throttle.tier(), RateTier::Normal);
        assert_eq!(throttle.chunk_interval(), ms(15));
    }

    #[test]
    fn test_throttle_rebaseline() {
        let mut throttle = throttle();
        let now = Instant::now();
        let ms = Duration::from_millis;
        throttle.on_window(ms(100), now);
        assert_eq!(throttle.on_window(ms(90), now), ThrottleChange::None);
        assert_eq!(throttle.on_window(ms(70), now), ThrottleChange::Rebaselined(ms(70)));
        assert_eq!(throttle.base_ping(), Some(ms(70)));
    }

    #[test]
    fn test_spike_at_threshold_does_not_drop() {
        let mut throttle = throttle();
        let now = Instant::now();
        let ms = Duration::from_millis;
        throttle.on_window(ms(20), now);
        assert_eq!(throttle.on_window(ms(100), now), ThrottleChange::None);
        assert_eq!(throttle.on_window(ms(101), now), ThrottleChange::Dropped);
    }
}
