use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A live handle to a scheduled punctuation. Dropping it has no effect; `cancel()` marks the
/// entry dead so `PunctuationQueue::punctuate` skips it via lazy removal, mirroring
/// `TimestampTracker`'s own lazy-removal discipline rather than a linear scan of the heap.
#[derive(Clone)]
pub struct PunctuationCancellable {
    cancelled: Arc<AtomicBool>,
}

impl PunctuationCancellable {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct Entry {
    next_fire: i64,
    interval_ms: i64,
    node: usize,
    seq: u64,
    cancelled: Arc<AtomicBool>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.next_fire == other.next_fire && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Ties broken by insertion order so the schedule is deterministic (spec §4.4 P4).
        self.next_fire.cmp(&other.next_fire).then(self.seq.cmp(&other.seq))
    }
}

/// A stream-time-driven scheduler of periodic per-node callbacks (spec §4.4). Holds no reference
/// to the topology; `StreamTaskInner::maybe_punctuate` supplies the dispatch callback so this
/// stays an independently testable priority queue.
#[derive(Default)]
pub struct PunctuationQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
}

impl PunctuationQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Schedules `node` to be punctuated every `interval_ms`, starting at `start_time +
    /// interval_ms`. Returns a handle that can cancel the schedule.
    pub fn schedule(&mut self, node: usize, start_time: i64, interval_ms: i64) -> PunctuationCancellable {
        let cancelled = Arc::new(AtomicBool::new(false));
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry {
            next_fire: start_time + interval_ms,
            interval_ms,
            node,
            seq,
            cancelled: cancelled.clone(),
        }));
        PunctuationCancellable { cancelled }
    }

    /// Fires every due entry whose `next_fire <= stream_time`, invoking `on_punctuate(node,
    /// scheduled_time)` for each, then reschedules it at `scheduled_time + interval_ms`.
    /// Cancelled entries are dropped instead of rescheduled. Returns the number of callbacks
    /// invoked. Generic over the callback's error type so this module stays independent of
    /// `TaskError`; a user-code error escaping a node's `punctuate` is fatal to the task (spec
    /// §7), so the first one stops the sweep and is returned to the caller, but the firing
    /// entry is rescheduled first — a punctuation failure closes the task, it doesn't lose the
    /// schedule.
    pub fn punctuate<E>(
        &mut self,
        stream_time: i64,
        mut on_punctuate: impl FnMut(usize, i64) -> Result<(), E>,
    ) -> Result<usize, E> {
        let mut fired = 0;
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.next_fire > stream_time {
                break;
            }
            let Reverse(entry) = self.heap.pop().unwrap();
            if entry.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            let result = on_punctuate(entry.node, entry.next_fire);
            self.heap.push(Reverse(Entry {
                next_fire: entry.next_fire + entry.interval_ms,
                interval_ms: entry.interval_ms,
                node: entry.node,
                seq: entry.seq,
                cancelled: entry.cancelled,
            }));
            result?;
            fired += 1;
        }
        Ok(fired)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// The timestamp of the soonest outstanding schedule, ignoring cancellation, or `None` if
    /// nothing is scheduled. Used by the task loop to decide whether advancing stream time can
    /// possibly trigger a punctuation before bothering to call `punctuate`.
    pub fn next_fire_time(&self) -> Option<i64> {
        self.heap.peek().map(|Reverse(e)| e.next_fire)
    }
}
