//! Bounded per-peer outbound queue, drop-oldest on overflow (spec.md §5
//! "Back-pressure": "the Broadcast Emulator bounds its outbound queue per
//! peer (default 256 datagrams); on overflow, drops the oldest").

use parking_lot::Mutex;
use std::collections::VecDeque;

pub const DEFAULT_CAPACITY: usize = 256;

pub struct OutboundQueue {
    capacity: usize,
    items: Mutex<VecDeque<Vec<u8>>>,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Enqueues `item`, dropping the oldest queued item if already at
    /// capacity. Returns `true` if an item was dropped to make room.
    pub fn push(&self, item: Vec<u8>) -> bool {
        let mut items = self.items.lock();
        let dropped = if items.len() >= self.capacity {
            items.pop_front();
            true
        } else {
            false
        };
        items.push_back(item);
        dropped
    }

    pub fn pop(&self) -> Option<Vec<u8>> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
