//! Cancellation tree.
//!
//! A group answers "should this token still run". Killing a group kills
//! every descendant group and every member token; both operations are
//! idempotent and operations on a dead group are no-ops. Groups live in a
//! generational arena, so a key held by a long-suspended token simply stops
//! resolving once the group dies — there is nothing to dangle.
//!
//! A group created for the right side of a pruning carries a one-shot cell:
//! the first value stored wakes the parked waiter and kills the group, so
//! later publications from that side are unobservable.

use std::collections::BTreeSet;

use slotmap::{new_key_type, SlotMap};

use crate::token::TokenKey;

new_key_type! {
    pub struct GroupKey;
}

/// One-shot value cell for a pruning combinator.
#[derive(Debug, Clone)]
pub struct PruneCell {
    /// The token parked on the left side, waiting for a binding.
    pub waiter: TokenKey,
    pub filled: bool,
}

#[derive(Debug)]
struct Group {
    parent: Option<GroupKey>,
    children: Vec<GroupKey>,
    // BTreeSet so reap order is stable across runs.
    members: BTreeSet<TokenKey>,
    cell: Option<PruneCell>,
}

/// Arena of all groups of one engine run.
#[derive(Debug)]
pub struct Groups {
    arena: SlotMap<GroupKey, Group>,
}

impl Groups {
    /// Create the arena together with its root group.
    pub fn new() -> (Groups, GroupKey) {
        let mut arena = SlotMap::with_key();
        let root = arena.insert(Group {
            parent: None,
            children: Vec::new(),
            members: BTreeSet::new(),
            cell: None,
        });
        (Groups { arena }, root)
    }

    /// A fresh child of `parent`. Returns `None` if the parent is dead.
    pub fn create_child(&mut self, parent: GroupKey) -> Option<GroupKey> {
        self.create(parent, None)
    }

    /// A fresh pruning child of `parent`, with `waiter` parked on its cell.
    pub fn create_cell_child(&mut self, parent: GroupKey, waiter: TokenKey) -> Option<GroupKey> {
        self.create(parent, Some(PruneCell { waiter, filled: false }))
    }

    fn create(&mut self, parent: GroupKey, cell: Option<PruneCell>) -> Option<GroupKey> {
        if !self.arena.contains_key(parent) {
            return None;
        }
        let key = self.arena.insert(Group {
            parent: Some(parent),
            children: Vec::new(),
            members: BTreeSet::new(),
            cell,
        });
        if let Some(group) = self.arena.get_mut(parent) {
            group.children.push(key);
        }
        Some(key)
    }

    /// Liveness check; a stale key is simply dead.
    pub fn is_alive(&self, key: GroupKey) -> bool {
        self.arena.contains_key(key)
    }

    pub fn add_member(&mut self, key: GroupKey, token: TokenKey) {
        if let Some(group) = self.arena.get_mut(key) {
            group.members.insert(token);
        }
    }

    pub fn remove_member(&mut self, key: GroupKey, token: TokenKey) {
        if let Some(group) = self.arena.get_mut(key) {
            group.members.remove(&token);
        }
    }

    /// Read the pruning cell, if the group is alive and carries one.
    pub fn cell(&self, key: GroupKey) -> Option<&PruneCell> {
        self.arena.get(key).and_then(|g| g.cell.as_ref())
    }

    /// Mark the cell filled. Returns the parked waiter exactly once; later
    /// calls (or calls on a dead group) return `None`.
    pub fn fill_cell(&mut self, key: GroupKey) -> Option<TokenKey> {
        let cell = self.arena.get_mut(key)?.cell.as_mut()?;
        if cell.filled {
            return None;
        }
        cell.filled = true;
        Some(cell.waiter)
    }

    /// Kill the group and every descendant, removing them from the arena.
    ///
    /// Returns the member tokens of the whole subtree in deterministic
    /// order; the engine is responsible for reaping them. Killing a dead
    /// group returns nothing and changes nothing.
    pub fn kill(&mut self, key: GroupKey) -> Vec<TokenKey> {
        if !self.arena.contains_key(key) {
            return Vec::new();
        }
        // Detach from the parent so a later parent kill skips us cleanly.
        if let Some(parent) = self.arena[key].parent {
            if let Some(group) = self.arena.get_mut(parent) {
                group.children.retain(|&child| child != key);
            }
        }
        let mut tokens = Vec::new();
        let mut pending = vec![key];
        while let Some(current) = pending.pop() {
            if let Some(group) = self.arena.remove(current) {
                tokens.extend(group.members.iter().copied());
                pending.extend(group.children);
            }
        }
        tokens
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}
