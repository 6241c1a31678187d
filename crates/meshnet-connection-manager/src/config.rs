use meshnet_model::Endpoint;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Constructor-passed configuration for a [`crate::ConnectionManager`]
/// (spec.md §11: no settings database, just explicit structs with literal
/// defaults).
#[derive(Debug, Clone, Copy)]
pub struct ConnectionManagerConfig {
    /// Overridable per game profile (spec.md §4.5, default 150 ms).
    pub degradation_threshold: Duration,
    /// Relay-switch margin (spec.md §4.3, default 20%).
    pub relay_switch_margin: f64,
    /// Interval between steady-state latency probes.
    pub latency_probe_interval: Duration,
    /// The relay endpoint declared in local configuration, if any
    /// (spec.md §4.3 candidate-list source #2).
    pub static_relay_endpoint: Option<Endpoint>,
    /// The built-in default relay (spec.md §4.3 candidate-list source #3).
    pub builtin_default_relay: Endpoint,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            degradation_threshold: meshnet_peer_conn::DEFAULT_DEGRADATION_THRESHOLD,
            relay_switch_margin: meshnet_relay_selector::DEFAULT_SWITCH_MARGIN,
            latency_probe_interval: Duration::from_secs(2),
            static_relay_endpoint: None,
            builtin_default_relay: Endpoint::new(Ipv4Addr::new(127, 0, 0, 1).into(), 54000),
        }
    }
}
