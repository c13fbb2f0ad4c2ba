use std::collections::VecDeque;

/// Tracks the minimum timestamp among a set of currently-buffered records using a monotonic
/// deque, so `add`/`remove` are amortized O(1) and `get` is O(1).
///
/// Per-queue timestamps are not monotonic (producers can write out-of-order), so a naive running
/// minimum can't handle removal of the current minimum. A min-heap would work but costs O(log n)
/// and still needs lazy deletion. The deque keeps only timestamps that *could* become the
/// minimum: when `x` is added, every trailing candidate with a timestamp >= `x.timestamp` can
/// never be the minimum again while `x` is buffered, so it is dropped before `x` is appended.
#[derive(Debug, Default)]
pub struct TimestampTracker {
    deque: VecDeque<(i64, i64)>, // (offset, timestamp), offset disambiguates equal timestamps
}

impl TimestampTracker {
    pub fn new() -> Self {
        Self {
            deque: VecDeque::new(),
        }
    }

    /// Record the admission of a timestamped item identified by `offset`.
    pub fn add(&mut self, offset: i64, timestamp: i64) {
        while let Some(&(_, back_ts)) = self.deque.back() {
            if back_ts >= timestamp {
                self.deque.pop_back();
            } else {
                break;
            }
        }
        self.deque.push_back((offset, timestamp));
    }

    /// Record the removal of the item identified by `offset`. Safe to call even if `offset` was
    /// already shadowed out of the deque by a later, lower-or-equal timestamp: in that case this
    /// is a no-op, since the deque no longer holds an entry for it.
    pub fn remove(&mut self, offset: i64) {
        if let Some(&(front_offset, _)) = self.deque.front() {
            if front_offset == offset {
                self.deque.pop_front();
            }
        }
    }

    /// The minimum timestamp currently tracked, or -1 if nothing is tracked.
    pub fn get(&self) -> i64 {
        self.deque.front().map(|&(_, ts)| ts).unwrap_or(-1)
    }

    pub fn is_empty(&self) -> bool {
        self.deque.is_empty()
    }
}
