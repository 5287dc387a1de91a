//! Virtual-time scheduling.
//!
//! Each timer scope owns a logical clock: a priority queue of
//! (virtual-time, token) entries over a private timeline. The engine
//! advances a clock only when it is otherwise stuck — both scheduler queues
//! empty — which makes delays deterministic under test. One `advance` wakes
//! the whole batch of entries due at the next earliest time and moves the
//! timeline forward to it.
//!
//! Clocks nest: a child scope keeps its own timeline but defers to its
//! parent's ordering — the engine always advances the innermost scope with
//! pending work first, and a scope that finishes hands its remaining entries
//! to its parent with their remaining delays preserved.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use slotmap::{new_key_type, SlotMap};

use crate::token::TokenKey;

new_key_type! {
    pub struct ClockKey;
}

type Entry = Reverse<(u64, u64, TokenKey)>;

#[derive(Debug)]
struct Clock {
    now: u64,
    depth: usize,
    parent: Option<ClockKey>,
    heap: BinaryHeap<Entry>,
}

/// All clock scopes of one engine run.
#[derive(Debug)]
pub struct Clocks {
    arena: SlotMap<ClockKey, Clock>,
    /// Creation order, for deterministic advance selection.
    order: Vec<ClockKey>,
    root: ClockKey,
    seq: u64,
}

impl Clocks {
    pub fn new() -> Clocks {
        let mut arena = SlotMap::with_key();
        let root = arena.insert(Clock {
            now: 0,
            depth: 0,
            parent: None,
            heap: BinaryHeap::new(),
        });
        Clocks {
            arena,
            order: vec![root],
            root,
            seq: 0,
        }
    }

    pub fn root(&self) -> ClockKey {
        self.root
    }

    /// Open a nested timer scope under `parent`.
    pub fn create_child(&mut self, parent: ClockKey) -> Option<ClockKey> {
        let depth = self.arena.get(parent)?.depth + 1;
        let key = self.arena.insert(Clock {
            now: 0,
            depth,
            parent: Some(parent),
            heap: BinaryHeap::new(),
        });
        self.order.push(key);
        Some(key)
    }

    pub fn now(&self, key: ClockKey) -> Option<u64> {
        self.arena.get(key).map(|c| c.now)
    }

    pub fn parent(&self, key: ClockKey) -> Option<ClockKey> {
        self.arena.get(key).and_then(|c| c.parent)
    }

    /// Enqueue `token` to wake `delay` ticks after the scope's current time.
    /// Returns false if the scope is gone.
    pub fn schedule(&mut self, key: ClockKey, delay: u64, token: TokenKey) -> bool {
        let seq = self.seq;
        match self.arena.get_mut(key) {
            Some(clock) => {
                let time = clock.now.saturating_add(delay);
                clock.heap.push(Reverse((time, seq, token)));
                self.seq += 1;
                true
            }
            None => false,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.arena.values().any(|clock| !clock.heap.is_empty())
    }

    /// Advance one scope: the innermost scope with pending entries (first
    /// created wins ties). Every entry due at the new time wakes together,
    /// in scheduling order. Returns the woken tokens, empty when nothing is
    /// pending anywhere.
    pub fn advance(&mut self) -> Vec<TokenKey> {
        let mut chosen: Option<(ClockKey, usize)> = None;
        for &key in &self.order {
            let Some(clock) = self.arena.get(key) else {
                continue;
            };
            if clock.heap.is_empty() {
                continue;
            }
            match chosen {
                Some((_, depth)) if depth >= clock.depth => {}
                _ => chosen = Some((key, clock.depth)),
            }
        }
        let Some((key, _)) = chosen else {
            return Vec::new();
        };
        let clock = &mut self.arena[key];
        let Some(Reverse((next_time, _, _))) = clock.heap.peek().copied() else {
            return Vec::new();
        };
        clock.now = next_time;
        let mut woken = Vec::new();
        while let Some(Reverse((time, _, token))) = clock.heap.peek().copied() {
            if time > next_time {
                break;
            }
            clock.heap.pop();
            woken.push(token);
        }
        woken
    }

    /// Close a scope and hand its remaining entries to the parent clock,
    /// preserving each entry's remaining delay on the parent's timeline.
    pub fn merge_into_parent(&mut self, key: ClockKey) {
        if key == self.root {
            return;
        }
        let Some(clock) = self.arena.remove(key) else {
            return;
        };
        self.order.retain(|&k| k != key);
        let Some(parent) = clock.parent else {
            return;
        };
        let child_now = clock.now;
        let mut entries: Vec<_> = clock.heap.into_sorted_vec();
        // into_sorted_vec on Reverse entries yields latest first.
        entries.reverse();
        for Reverse((time, _, token)) in entries {
            self.schedule(parent, time - child_now, token);
        }
    }
}

impl Default for Clocks {
    fn default() -> Self {
        Self::new()
    }
}
