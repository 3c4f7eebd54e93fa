// =============================================================================
// Backtest bar queues — chronological replay across symbols
// =============================================================================
//
// The coordinator pre-loads one queue of bars per `(symbol, interval)` for
// the current session date, then pops the globally oldest bar on every
// streaming step. A min-heap over the queue heads keyed on
// `(timestamp, symbol, interval)` keeps each step logarithmic in the number
// of active symbols and makes the tie-break (symbol name) deterministic.
//
// Heap entries go stale when a queue is drained or removed out-of-band
// (catch-up, symbol removal); `pop_next` lazily discards any entry that no
// longer matches its queue's actual head.
//
// The queues are thread-local to the coordinator — no lock.
// =============================================================================

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};

use chrono::DateTime;
use chrono_tz::Tz;

use crate::types::{Bar, Interval};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct HeadKey {
    epoch: i64,
    symbol: String,
    interval: Interval,
}

#[derive(Default)]
pub struct BarQueues {
    queues: HashMap<(String, Interval), VecDeque<Bar>>,
    heads: BinaryHeap<Reverse<HeadKey>>,
}

impl BarQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the queue for `(symbol, interval)`. Bars must be
    /// chronologically sorted — the data-source contract.
    pub fn fill(&mut self, symbol: &str, interval: Interval, bars: Vec<Bar>) {
        let key = (symbol.to_string(), interval);
        let queue: VecDeque<Bar> = bars.into();
        if let Some(front) = queue.front() {
            self.heads.push(Reverse(HeadKey {
                epoch: front.timestamp.timestamp(),
                symbol: symbol.to_string(),
                interval,
            }));
        }
        self.queues.insert(key, queue);
    }

    /// Pop the globally oldest bar across all queues. Ties break by symbol
    /// name, then interval, for deterministic replay.
    pub fn pop_next(&mut self) -> Option<(String, Interval, Bar)> {
        while let Some(Reverse(key)) = self.heads.pop() {
            let map_key = (key.symbol.clone(), key.interval);
            let Some(queue) = self.queues.get_mut(&map_key) else {
                continue; // symbol removed; stale entry
            };
            match queue.front() {
                Some(front) if front.timestamp.timestamp() == key.epoch => {
                    let bar = queue.pop_front().expect("front just observed");
                    if let Some(next) = queue.front() {
                        self.heads.push(Reverse(HeadKey {
                            epoch: next.timestamp.timestamp(),
                            symbol: key.symbol,
                            interval: key.interval,
                        }));
                    }
                    return Some((map_key.0, map_key.1, bar));
                }
                _ => continue, // queue mutated out-of-band; stale entry
            }
        }
        None
    }

    /// Drain all bars with `timestamp < cutoff` from one queue, preserving
    /// order — the catch-up path for mid-session additions.
    pub fn drain_before(
        &mut self,
        symbol: &str,
        interval: Interval,
        cutoff: DateTime<Tz>,
    ) -> Vec<Bar> {
        let key = (symbol.to_string(), interval);
        let Some(queue) = self.queues.get_mut(&key) else {
            return Vec::new();
        };
        let mut drained = Vec::new();
        while let Some(front) = queue.front() {
            if front.timestamp < cutoff {
                drained.push(queue.pop_front().expect("front just observed"));
            } else {
                break;
            }
        }
        if let Some(front) = queue.front() {
            self.heads.push(Reverse(HeadKey {
                epoch: front.timestamp.timestamp(),
                symbol: symbol.to_string(),
                interval,
            }));
        }
        drained
    }

    /// Drop every queue belonging to `symbol` (rollback / removal). Stale
    /// heap entries are discarded lazily.
    pub fn remove_symbol(&mut self, symbol: &str) {
        self.queues.retain(|(sym, _), _| sym != symbol);
    }

    pub fn clear(&mut self) {
        self.queues.clear();
        self.heads.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.queues.values().all(VecDeque::is_empty)
    }

    pub fn total_len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Per-queue depths for the status export.
    pub fn depths(&self) -> Vec<(String, String, usize)> {
        let mut out: Vec<_> = self
            .queues
            .iter()
            .map(|((sym, iv), q)| (sym.clone(), iv.to_string(), q.len()))
            .collect();
        out.sort();
        out
    }
}
