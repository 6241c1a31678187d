//! Sliding-window dedup over `(content_hash, source_virtual_address)`
//! (spec.md §4.11 "Capture" / "Deduplication"). Also the mechanism behind
//! loop prevention: a packet that travels out over the tunnel and comes
//! back carries the same original source address, so the second sighting
//! is recognized and dropped.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Default dedup window, per spec.md §4.11 "a sliding-window set with a
/// 2-second window".
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(2);

fn content_key(payload: &[u8], source_virtual_address: IpAddr) -> u64 {
    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);
    source_virtual_address.hash(&mut hasher);
    hasher.finish()
}

/// Tracks recently-seen `(content_hash, source_virtual_address)` pairs.
/// Entries older than `window` are purged lazily on every check.
pub struct DedupWindow {
    window: Duration,
    seen: VecDeque<(u64, Instant)>,
}

impl DedupWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: VecDeque::new(),
        }
    }

    /// Returns `true` if `(payload, source)` is new within the window (and
    /// records it), `false` if it is a duplicate that should be dropped.
    pub fn check_and_insert(&mut self, payload: &[u8], source: IpAddr, now: Instant) -> bool {
        self.purge_expired(now);

        let key = content_key(payload, source);
        if self.seen.iter().any(|(seen_key, _)| *seen_key == key) {
            return false;
        }

        self.seen.push_back((key, now));
        true
    }

    fn purge_expired(&mut self, now: Instant) {
        while let Some((_, seen_at)) = self.seen.front() {
            if now.duration_since(*seen_at) >= self.window {
                self.seen.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 13, 0, n))
    }

    #[test]
    fn first_sighting_is_new() {
        let mut window = DedupWindow::new(DEFAULT_WINDOW);
        assert!(window.check_and_insert(b"ping", addr(1), Instant::now()));
    }

    #[test]
    fn repeat_within_window_is_duplicate() {
        let mut window = DedupWindow::new(DEFAULT_WINDOW);
        let now = Instant::now();
        assert!(window.check_and_insert(b"ping", addr(1), now));
        assert!(!window.check_and_insert(b"ping", addr(1), now + Duration::from_millis(500)));
    }

    #[test]
    fn repeat_after_window_expires_is_new() {
        let mut window = DedupWindow::new(Duration::from_millis(50));
        let now = Instant::now();
        assert!(window.check_and_insert(b"ping", addr(1), now));
        assert!(window.check_and_insert(b"ping", addr(1), now + Duration::from_millis(60)));
    }

    #[test]
    fn different_source_is_not_a_duplicate() {
        let mut window = DedupWindow::new(DEFAULT_WINDOW);
        let now = Instant::now();
        assert!(window.check_and_insert(b"ping", addr(1), now));
        assert!(window.check_and_insert(b"ping", addr(2), now));
    }

    #[test]
    fn different_payload_is_not_a_duplicate() {
        let mut window = DedupWindow::new(DEFAULT_WINDOW);
        let now = Instant::now();
        assert!(window.check_and_insert(b"ping", addr(1), now));
        assert!(window.check_and_insert(b"pong", addr(1), now));
    }
}
