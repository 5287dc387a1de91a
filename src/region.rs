//! Quiescence tree.
//!
//! A region answers "has this dynamic extent finished": it closes exactly
//! when its live count reaches zero, fires its close behavior once, and then
//! leaves its parent — so a child closing may let the parent close in the
//! same cascade. Tokens enter a region when they are created in it and leave
//! when they die or migrate; a nested region counts as one inhabitant of its
//! parent for its whole life.
//!
//! What closing *means* is pluggable per region through [`OnClose`], a
//! closed set of behaviors the engine interprets: finishing the whole run,
//! resolving a pruning, releasing the right side of an otherwise, or handing
//! a clock scope back to its parent.

use slotmap::{new_key_type, SlotMap};

use crate::clock::ClockKey;
use crate::group::GroupKey;
use crate::token::TokenKey;

new_key_type! {
    pub struct RegionKey;
}

/// What happens when a region closes.
#[derive(Debug, Clone)]
pub enum OnClose {
    /// Nothing beyond the close itself (isolated scopes).
    Nothing,
    /// The root execution finished; the engine halts.
    Root,
    /// The right side of a pruning finished. If its cell was never filled,
    /// the parked waiter will never get a binding and must die.
    Prune { group: GroupKey },
    /// The left side of an otherwise finished. If it never published, the
    /// parked right token is released; `published` is flipped by the first
    /// escaping publication, which also kills `right_group`.
    Otherwise {
        right: TokenKey,
        right_group: GroupKey,
        published: bool,
    },
    /// A clock scope finished; pending timers hand off to the parent clock.
    ClockHandoff { clock: ClockKey },
}

#[derive(Debug)]
struct Region {
    count: usize,
    parent: Option<RegionKey>,
    closed: bool,
    on_close: OnClose,
}

/// Arena of all regions of one engine run.
#[derive(Debug)]
pub struct Regions {
    arena: SlotMap<RegionKey, Region>,
}

impl Regions {
    /// Create the arena together with the root region (whose close halts
    /// the engine).
    pub fn new() -> (Regions, RegionKey) {
        let mut arena = SlotMap::with_key();
        let root = arena.insert(Region {
            count: 0,
            parent: None,
            closed: false,
            on_close: OnClose::Root,
        });
        (Regions { arena }, root)
    }

    /// A fresh child region. The child counts as one inhabitant of the
    /// parent until it closes.
    pub fn create_child(&mut self, parent: RegionKey, on_close: OnClose) -> RegionKey {
        if let Some(region) = self.arena.get_mut(parent) {
            if !region.closed {
                region.count += 1;
            }
        }
        self.arena.insert(Region {
            count: 0,
            parent: Some(parent),
            closed: false,
            on_close,
        })
    }

    pub fn is_open(&self, key: RegionKey) -> bool {
        self.arena.get(key).map(|r| !r.closed).unwrap_or(false)
    }

    pub fn parent(&self, key: RegionKey) -> Option<RegionKey> {
        self.arena.get(key).and_then(|r| r.parent)
    }

    /// One more live token inside `key`. Entering a closed region is
    /// ignored; the caller must treat that token as dead.
    pub fn enter(&mut self, key: RegionKey) {
        if let Some(region) = self.arena.get_mut(key) {
            if !region.closed {
                region.count += 1;
            }
        }
    }

    /// One live token left `key`. Returns the close behaviors of every
    /// region the departure closed, innermost first.
    pub fn leave(&mut self, key: RegionKey) -> Vec<OnClose> {
        let mut closed = Vec::new();
        let mut current = Some(key);
        while let Some(key) = current {
            let Some(region) = self.arena.get_mut(key) else {
                break;
            };
            if region.closed {
                break;
            }
            region.count = region.count.saturating_sub(1);
            if region.count > 0 {
                break;
            }
            region.closed = true;
            closed.push(std::mem::replace(&mut region.on_close, OnClose::Nothing));
            current = region.parent;
        }
        closed
    }

    /// Flip the `published` flag of an otherwise region.
    ///
    /// Returns the parked right token and its group the first time, so the
    /// caller can cancel them; `None` on repeat calls, closed regions, or
    /// regions that are not an otherwise.
    pub fn mark_published(&mut self, key: RegionKey) -> Option<(TokenKey, GroupKey)> {
        let region = self.arena.get_mut(key)?;
        if region.closed {
            return None;
        }
        match &mut region.on_close {
            OnClose::Otherwise {
                right,
                right_group,
                published,
            } if !*published => {
                *published = true;
                Some((*right, *right_group))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closes_exactly_on_last_leave() {
        let (mut regions, root) = Regions::new();
        regions.enter(root);
        regions.enter(root);
        assert!(regions.leave(root).is_empty());
        let closed = regions.leave(root);
        assert_eq!(closed.len(), 1);
        assert!(matches!(closed[0], OnClose::Root));
        assert!(!regions.is_open(root));
    }

    #[test]
    fn test_close_fires_once() {
        let (mut regions, root) = Regions::new();
        regions.enter(root);
        let first = regions.leave(root);
        assert_eq!(first.len(), 1);
        // A stray leave on a closed region must not re-fire.
        assert!(regions.leave(root).is_empty());
        regions.enter(root);
        assert!(regions.leave(root).is_empty());
    }

    #[test]
    fn test_child_close_cascades_to_parent() {
        let (mut regions, root) = Regions::new();
        regions.enter(root);
        let child = regions.create_child(root, OnClose::Nothing);
        regions.enter(child);
        // Token moves from root into the child; root stays open because the
        // child inhabits it.
        assert!(regions.leave(root).is_empty());
        let closed = regions.leave(child);
        assert_eq!(closed.len(), 2);
        assert!(matches!(closed[0], OnClose::Nothing));
        assert!(matches!(closed[1], OnClose::Root));
    }

    #[test]
    fn test_mark_published_once() {
        let (mut regions, root) = Regions::new();
        let (mut groups, group_root) = crate::group::Groups::new();
        let right_group = groups.create_child(group_root).unwrap();
        let mut tokens: slotmap::SlotMap<TokenKey, ()> = slotmap::SlotMap::with_key();
        let right = tokens.insert(());

        let child = regions.create_child(
            root,
            OnClose::Otherwise {
                right,
                right_group,
                published: false,
            },
        );
        assert_eq!(regions.mark_published(child), Some((right, right_group)));
        assert_eq!(regions.mark_published(child), None);
        assert_eq!(regions.mark_published(root), None);
    }

    #[test]
    fn test_otherwise_close_carries_published_flag() {
        let (mut regions, root) = Regions::new();
        let (mut groups, group_root) = crate::group::Groups::new();
        let right_group = groups.create_child(group_root).unwrap();
        let mut tokens: slotmap::SlotMap<TokenKey, ()> = slotmap::SlotMap::with_key();
        let right = tokens.insert(());

        let child = regions.create_child(
            root,
            OnClose::Otherwise {
                right,
                right_group,
                published: false,
            },
        );
        regions.enter(child);
        regions.mark_published(child);
        let closed = regions.leave(child);
        assert!(matches!(
            closed[0],
            OnClose::Otherwise { published: true, .. }
        ));
    }
}
