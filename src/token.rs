//! Execution strands.
//!
//! A token is one strand of control moving across the node graph: a current
//! node, a lexical environment, a continuation stack for calls, a handler
//! stack for exceptions, and its group/region/clock membership. Tokens are
//! cheap to clone — every aggregate field is a persistent structure — which
//! is what lets fork-style combinators split a strand in O(1) without the
//! two halves observing each other.
//!
//! Tokens live in a generational arena keyed by [`TokenKey`]; once a token
//! dies its key never resolves again, so a stale key surfacing from a queue
//! or a late call return is detected instead of silently aliasing a
//! recycled slot.

use std::sync::Arc;

use slotmap::new_key_type;

use crate::clock::ClockKey;
use crate::env::Env;
use crate::error::SourceLocation;
use crate::graph::NodeId;
use crate::group::GroupKey;
use crate::region::RegionKey;
use crate::value::Value;

new_key_type! {
    pub struct TokenKey;
}

/// A saved caller: where to resume and with which environment.
#[derive(Debug, Clone)]
pub struct Frame {
    pub env: Env,
    pub return_node: NodeId,
    /// Location of the call site, for backtraces.
    pub location: SourceLocation,
}

#[derive(Debug)]
struct StackNode {
    frame: Frame,
    parent: Option<Arc<StackNode>>,
}

/// Persistent continuation stack. Pushing and popping share structure, so a
/// forked token carries its caller chain for free.
#[derive(Debug, Clone, Default)]
pub struct CallStack {
    head: Option<Arc<StackNode>>,
    depth: usize,
}

impl CallStack {
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[must_use]
    pub fn push(&self, frame: Frame) -> CallStack {
        CallStack {
            head: Some(Arc::new(StackNode {
                frame,
                parent: self.head.clone(),
            })),
            depth: self.depth + 1,
        }
    }

    pub fn pop(&self) -> Option<(Frame, CallStack)> {
        let node = self.head.as_deref()?;
        Some((
            node.frame.clone(),
            CallStack {
                head: node.parent.clone(),
                depth: self.depth - 1,
            },
        ))
    }

    /// Call-site locations, innermost first.
    pub fn locations(&self) -> Vec<SourceLocation> {
        let mut out = Vec::with_capacity(self.depth);
        let mut node = self.head.as_deref();
        while let Some(n) = node {
            out.push(n.frame.location);
            node = n.parent.as_deref();
        }
        out
    }
}

/// One open exception handler: everything needed to start a fresh token
/// running the handler body where the `try` stood.
#[derive(Debug, Clone)]
pub struct Handler {
    pub env: Env,
    pub node: NodeId,
    pub stack: CallStack,
    pub group: GroupKey,
    pub region: RegionKey,
    pub clock: ClockKey,
}

#[derive(Debug)]
struct HandlerNode {
    handler: Handler,
    parent: Option<Arc<HandlerNode>>,
}

/// Persistent handler stack; raising unwinds to the nearest frame.
#[derive(Debug, Clone, Default)]
pub struct HandlerStack {
    head: Option<Arc<HandlerNode>>,
}

impl HandlerStack {
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[must_use]
    pub fn push(&self, handler: Handler) -> HandlerStack {
        HandlerStack {
            head: Some(Arc::new(HandlerNode {
                handler,
                parent: self.head.clone(),
            })),
        }
    }

    pub fn pop(&self) -> Option<(Handler, HandlerStack)> {
        let node = self.head.as_deref()?;
        Some((
            node.handler.clone(),
            HandlerStack {
                head: node.parent.clone(),
            },
        ))
    }
}

/// One live execution strand.
#[derive(Debug, Clone)]
pub struct Token {
    pub node: NodeId,
    pub env: Env,
    /// The most recently published or bound value.
    pub value: Value,
    pub group: GroupKey,
    pub region: RegionKey,
    pub clock: ClockKey,
    pub stack: CallStack,
    pub handlers: HandlerStack,
    /// Remaining non-tail call frames before a stack-limit error.
    pub budget: usize,
    /// Frames elided by tail calls; diagnostic only.
    pub tail_depth: u64,
    pub location: SourceLocation,
    /// True while the token waits on a clock and has vacated its region.
    pub vacated: bool,
}

impl Token {
    /// Call-site chain for error reports: current location first, then the
    /// continuation stack outward.
    pub fn backtrace(&self) -> Vec<SourceLocation> {
        let mut trace = vec![self.location];
        trace.extend(self.stack.locations());
        trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(line: u32) -> Frame {
        Frame {
            env: Env::new(),
            return_node: 0,
            location: SourceLocation::new(line, 1),
        }
    }

    #[test]
    fn test_call_stack_is_persistent() {
        let base = CallStack::default();
        let one = base.push(frame(1));
        let two = one.push(frame(2));
        assert_eq!(base.depth(), 0);
        assert_eq!(one.depth(), 1);
        assert_eq!(two.depth(), 2);

        let (popped, rest) = two.pop().unwrap();
        assert_eq!(popped.location.line, 2);
        assert_eq!(rest.depth(), 1);
        // The original stack is untouched.
        assert_eq!(two.depth(), 2);
        assert!(base.pop().is_none());
    }

    #[test]
    fn test_locations_innermost_first() {
        let stack = CallStack::default().push(frame(1)).push(frame(2));
        let lines: Vec<u32> = stack.locations().iter().map(|l| l.line).collect();
        assert_eq!(lines, vec![2, 1]);
    }

    #[test]
    fn test_handler_stack_order() {
        let (_, group) = crate::group::Groups::new();
        let (_, region) = crate::region::Regions::new();
        let clocks = crate::clock::Clocks::new();
        let make = |node| Handler {
            env: Env::new(),
            node,
            stack: CallStack::default(),
            group,
            region,
            clock: clocks.root(),
        };
        let stack = HandlerStack::default().push(make(1)).push(make(2));
        let (inner, rest) = stack.pop().unwrap();
        assert_eq!(inner.node, 2);
        let (outer, rest) = rest.pop().unwrap();
        assert_eq!(outer.node, 1);
        assert!(rest.is_empty());
    }
}
