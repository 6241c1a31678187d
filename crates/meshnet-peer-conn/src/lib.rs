//! Peer Connection State Machine (spec.md §4.5).
//!
//! Grounded in `snownet::Node`'s sans-IO shape: the clock is an argument,
//! never read internally, and driving the machine (`on_latency_sample`,
//! `on_timeout`, `disconnect`) returns a list of [`Action`]s for the caller
//! to execute rather than performing I/O itself. This keeps state
//! transitions deterministic and unit-testable without a runtime, exactly
//! as `Node::handle_timeout`/`handle_message` do for `snownet`.

use meshnet_model::Strategy;
use std::time::{Duration, Instant};

/// Default latency degradation threshold (spec.md §4.5), overridable per
/// game profile.
pub const DEFAULT_DEGRADATION_THRESHOLD: Duration = Duration::from_millis(150);
const CONNECTING_FAILURE_LIMIT: u32 = 5;
const DEGRADED_SAMPLE_THRESHOLD: u32 = 3;
const FAILED_CLEANUP_GRACE: Duration = Duration::from_secs(30);
const DEGRADED_SUSTAINED_LIMIT: Duration = Duration::from_secs(30);
const DEGRADED_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Degraded,
    Failed,
    Cleanup,
}

/// Side effects the owning Connection Manager must carry out; the state
/// machine itself never touches the tunnel device or the relay selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Strategy is `direct`: remove and re-add the peer on the tunnel
    /// device with the same endpoint to refresh the crypto session.
    RefreshDirectEndpoint,
    /// Strategy is `relay`: ask the Relay Selector to propose a switch,
    /// committing only if strictly better by its margin.
    AttemptRelaySwitch,
    /// Remove the peer from the tunnel device, release its virtual
    /// address, and cancel monitoring tasks.
    EnterCleanup,
}

pub struct PeerConnectionSm {
    state: PeerState,
    strategy: Strategy,
    degradation_threshold: Duration,
    consecutive_failed_probes: u32,
    consecutive_degraded_samples: u32,
    consecutive_recovered_samples: u32,
    degraded_since: Option<Instant>,
    failed_since: Option<Instant>,
    last_reconnect_attempt: Option<Instant>,
}

impl PeerConnectionSm {
    pub fn new(strategy: Strategy, degradation_threshold: Duration) -> Self {
        Self {
            state: PeerState::Connecting,
            strategy,
            degradation_threshold,
            consecutive_failed_probes: 0,
            consecutive_degraded_samples: 0,
            consecutive_recovered_samples: 0,
            degraded_since: None,
            failed_since: None,
            last_reconnect_attempt: None,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn set_strategy(&mut self, strategy: Strategy) {
        self.strategy = strategy;
    }

    /// Feeds one latency probe result (`None` on a 2 s timeout with no
    /// reply) into the machine at time `now`.
    pub fn on_latency_sample(&mut self, now: Instant, rtt: Option<Duration>) -> Vec<Action> {
        match self.state {
            PeerState::Connecting => self.on_connecting_sample(now, rtt),
            PeerState::Connected => self.on_connected_sample(now, rtt),
            PeerState::Degraded => self.on_degraded_sample(now, rtt),
            PeerState::Failed | PeerState::Cleanup => Vec::new(),
        }
    }

    fn on_connecting_sample(&mut self, now: Instant, rtt: Option<Duration>) -> Vec<Action> {
        match rtt {
            Some(_) => {
                self.state = PeerState::Connected;
                self.consecutive_failed_probes = 0;
                Vec::new()
            }
            None => {
                self.consecutive_failed_probes += 1;
                if self.consecutive_failed_probes >= CONNECTING_FAILURE_LIMIT {
                    self.state = PeerState::Failed;
                    self.failed_since = Some(now);
                }
                Vec::new()
            }
        }
    }

    fn on_connected_sample(&mut self, now: Instant, rtt: Option<Duration>) -> Vec<Action> {
        let exceeds = rtt.map_or(true, |sample| sample > self.degradation_threshold);
        if exceeds {
            self.consecutive_degraded_samples += 1;
            if self.consecutive_degraded_samples >= DEGRADED_SAMPLE_THRESHOLD {
                self.state = PeerState::Degraded;
                self.degraded_since = Some(now);
                self.consecutive_recovered_samples = 0;
            }
        } else {
            self.consecutive_degraded_samples = 0;
        }
        Vec::new()
    }

    fn on_degraded_sample(&mut self, now: Instant, rtt: Option<Duration>) -> Vec<Action> {
        let within_threshold = rtt.map_or(false, |sample| sample <= self.degradation_threshold);
        if within_threshold {
            self.consecutive_recovered_samples += 1;
            if self.consecutive_recovered_samples >= DEGRADED_SAMPLE_THRESHOLD {
                self.state = PeerState::Connected;
                self.degraded_since = None;
                self.consecutive_degraded_samples = 0;
            }
        } else {
            self.consecutive_recovered_samples = 0;
        }

        let _ = now;
        Vec::new()
    }

    /// Drives timer-based transitions: the 30 s failed→cleanup grace, the
    /// 30 s sustained-degradation→failed limit, and the 5 s reconnect
    /// ticker while degraded.
    pub fn on_timeout(&mut self, now: Instant) -> Vec<Action> {
        match self.state {
            PeerState::Failed => {
                if self
                    .failed_since
                    .map_or(false, |since| now.duration_since(since) >= FAILED_CLEANUP_GRACE)
                {
                    self.state = PeerState::Cleanup;
                    return vec![Action::EnterCleanup];
                }
                Vec::new()
            }
            PeerState::Degraded => self.on_degraded_timeout(now),
            _ => Vec::new(),
        }
    }

    fn on_degraded_timeout(&mut self, now: Instant) -> Vec<Action> {
        if self
            .degraded_since
            .map_or(false, |since| now.duration_since(since) >= DEGRADED_SUSTAINED_LIMIT)
        {
            self.state = PeerState::Failed;
            self.failed_since = Some(now);
            return Vec::new();
        }

        let due = self
            .last_reconnect_attempt
            .map_or(true, |last| now.duration_since(last) >= DEGRADED_RECONNECT_INTERVAL);
        if !due {
            return Vec::new();
        }

        self.last_reconnect_attempt = Some(now);
        match self.strategy {
            Strategy::Direct(_) => vec![Action::RefreshDirectEndpoint],
            Strategy::Relay(_) => vec![Action::AttemptRelaySwitch],
        }
    }

    /// Explicit disconnect or party leave: any non-terminal state moves
    /// straight to cleanup.
    pub fn disconnect(&mut self) -> Vec<Action> {
        if self.state == PeerState::Cleanup {
            return Vec::new();
        }
        self.state = PeerState::Cleanup;
        vec![Action::EnterCleanup]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn strategy() -> Strategy {
        Strategy::Direct(meshnet_model::Endpoint::new(Ipv4Addr::LOCALHOST.into(), 1))
    }

    #[test]
    fn connecting_moves_to_connected_on_first_reply() {
        let mut sm = PeerConnectionSm::new(strategy(), DEFAULT_DEGRADATION_THRESHOLD);
        let now = Instant::now();
        sm.on_latency_sample(now, Some(Duration::from_millis(20)));
        assert_eq!(sm.state(), PeerState::Connected);
    }

    #[test]
    fn connecting_fails_after_five_timeouts() {
        let mut sm = PeerConnectionSm::new(strategy(), DEFAULT_DEGRADATION_THRESHOLD);
        let now = Instant::now();
        for _ in 0..4 {
            sm.on_latency_sample(now, None);
            assert_eq!(sm.state(), PeerState::Connecting);
        }
        sm.on_latency_sample(now, None);
        assert_eq!(sm.state(), PeerState::Failed);
    }

    #[test]
    fn failed_enters_cleanup_after_grace_period() {
        let mut sm = PeerConnectionSm::new(strategy(), DEFAULT_DEGRADATION_THRESHOLD);
        let t0 = Instant::now();
        for _ in 0..5 {
            sm.on_latency_sample(t0, None);
        }
        assert_eq!(sm.state(), PeerState::Failed);

        let actions = sm.on_timeout(t0 + Duration::from_secs(10));
        assert!(actions.is_empty());
        assert_eq!(sm.state(), PeerState::Failed);

        let actions = sm.on_timeout(t0 + Duration::from_secs(31));
        assert_eq!(actions, vec![Action::EnterCleanup]);
        assert_eq!(sm.state(), PeerState::Cleanup);
    }

    #[test]
    fn connected_degrades_after_three_bad_samples() {
        let mut sm = PeerConnectionSm::new(strategy(), DEFAULT_DEGRADATION_THRESHOLD);
        let now = Instant::now();
        sm.on_latency_sample(now, Some(Duration::from_millis(10)));
        assert_eq!(sm.state(), PeerState::Connected);

        for _ in 0..2 {
            sm.on_latency_sample(now, Some(Duration::from_millis(300)));
            assert_eq!(sm.state(), PeerState::Connected);
        }
        sm.on_latency_sample(now, Some(Duration::from_millis(300)));
        assert_eq!(sm.state(), PeerState::Degraded);
    }

    #[test]
    fn degraded_recovers_after_three_good_samples() {
        let mut sm = PeerConnectionSm::new(strategy(), DEFAULT_DEGRADATION_THRESHOLD);
        let now = Instant::now();
        sm.on_latency_sample(now, Some(Duration::from_millis(10)));
        for _ in 0..3 {
            sm.on_latency_sample(now, Some(Duration::from_millis(300)));
        }
        assert_eq!(sm.state(), PeerState::Degraded);

        for _ in 0..2 {
            sm.on_latency_sample(now, Some(Duration::from_millis(10)));
            assert_eq!(sm.state(), PeerState::Degraded);
        }
        sm.on_latency_sample(now, Some(Duration::from_millis(10)));
        assert_eq!(sm.state(), PeerState::Connected);
    }

    #[test]
    fn degraded_reconnect_ticker_emits_direct_refresh() {
        let mut sm = PeerConnectionSm::new(strategy(), DEFAULT_DEGRADATION_THRESHOLD);
        let t0 = Instant::now();
        sm.on_latency_sample(t0, Some(Duration::from_millis(10)));
        for _ in 0..3 {
            sm.on_latency_sample(t0, Some(Duration::from_millis(300)));
        }
        assert_eq!(sm.state(), PeerState::Degraded);

        let actions = sm.on_timeout(t0 + Duration::from_secs(5));
        assert_eq!(actions, vec![Action::RefreshDirectEndpoint]);

        // Not due again immediately.
        let actions = sm.on_timeout(t0 + Duration::from_secs(6));
        assert!(actions.is_empty());
    }

    #[test]
    fn degraded_reconnect_ticker_emits_relay_switch_for_relay_strategy() {
        let relay_strategy =
            Strategy::Relay(meshnet_model::Endpoint::new(Ipv4Addr::LOCALHOST.into(), 2));
        let mut sm = PeerConnectionSm::new(relay_strategy, DEFAULT_DEGRADATION_THRESHOLD);
        let t0 = Instant::now();
        sm.on_latency_sample(t0, Some(Duration::from_millis(10)));
        for _ in 0..3 {
            sm.on_latency_sample(t0, Some(Duration::from_millis(300)));
        }

        let actions = sm.on_timeout(t0 + Duration::from_secs(5));
        assert_eq!(actions, vec![Action::AttemptRelaySwitch]);
    }

    #[test]
    fn sustained_degradation_fails_after_thirty_seconds() {
        let mut sm = PeerConnectionSm::new(strategy(), DEFAULT_DEGRADATION_THRESHOLD);
        let t0 = Instant::now();
        sm.on_latency_sample(t0, Some(Duration::from_millis(10)));
        for _ in 0..3 {
            sm.on_latency_sample(t0, Some(Duration::from_millis(300)));
        }
        assert_eq!(sm.state(), PeerState::Degraded);

        sm.on_timeout(t0 + Duration::from_secs(31));
        assert_eq!(sm.state(), PeerState::Failed);
    }

    #[test]
    fn disconnect_from_any_non_terminal_state_enters_cleanup() {
        let mut sm = PeerConnectionSm::new(strategy(), DEFAULT_DEGRADATION_THRESHOLD);
        let actions = sm.disconnect();
        assert_eq!(actions, vec![Action::EnterCleanup]);
        assert_eq!(sm.state(), PeerState::Cleanup);

        // Idempotent.
        assert!(sm.disconnect().is_empty());
    }
}
