//! Compiled program representation.
//!
//! A program is a flat arena of combinator nodes wired by index, built once
//! by the compiler and immutable afterwards, so one `Arc<Program>` can back
//! any number of concurrent executions. Recursion between closures is
//! expressed through definition indices rather than pointers, which keeps
//! the graph acyclic at the storage level even when the control flow is not.

use crate::ast::Arg;
use crate::error::SourceLocation;

pub type NodeId = usize;
pub type DefId = usize;

/// One primitive combinator behavior.
///
/// Every arriving token is transformed by exactly one of these; the engine
/// dispatches with a single exhaustive match.
#[derive(Debug, Clone)]
pub enum Node {
    /// Publish the value of an argument to the continuation.
    Let { arg: Arg, next: NodeId },
    /// Invoke a site or closure, publishing each result to `next`.
    /// `tail` marks calls whose continuation is a plain return, letting
    /// self-recursion reuse the current frame.
    Call {
        target: Arg,
        args: Vec<Arg>,
        next: NodeId,
        tail: bool,
    },
    /// Pop a continuation frame and resume the caller.
    Return,
    /// Split the arriving token into two strands.
    Fork { left: NodeId, right: NodeId },
    /// `left <x< right`: park the arriving token before `left`, launch
    /// `right` in a fresh group and region.
    Prune { left: NodeId, right: NodeId },
    /// Terminal of a pruning's right side: capture the first publication
    /// into the group's cell, then cancel the group.
    Store,
    /// Bind the published value into the environment and continue.
    Bind { next: NodeId },
    /// Drop `depth` bindings when leaving a scope.
    Unwind { depth: usize, next: NodeId },
    /// `left ; right`: run `left` in a sub-region with `right` parked; the
    /// region's close releases `right` if nothing was published.
    Otherwise { left: NodeId, right: NodeId },
    /// First escape point of an otherwise's left side: mark the sub-region
    /// published, cancel the parked right side, migrate out, continue.
    Leave { next: NodeId },
    /// Create the closures of a declaration group, tie their capture frames,
    /// bind them, and continue into the body.
    Defs { defs: Vec<DefId>, next: NodeId },
    /// Push an exception-handler frame, then run `body`.
    PushHandler { handler: NodeId, body: NodeId },
    /// Leave a handled scope normally.
    PopHandler { next: NodeId },
    /// Raise the published value as an exception.
    Throw,
    /// Record a source location on the passing token.
    Location {
        location: SourceLocation,
        next: NodeId,
    },
    /// Enter an isolated scope (a nested region).
    Isolate { body: NodeId },
    /// Leave an isolated scope, returning to the enclosing region.
    Deisolate { next: NodeId },
    /// Silent end of a strand.
    Stop,
    /// Top-level publication: the value escapes the graph.
    Publish,
}

/// Where one capture slot of a closure gets its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// A binding of the environment enclosing the declaration group.
    Outer(usize),
    /// Another member of the same declaration group (possibly the closure
    /// itself).
    Sibling(usize),
}

/// A compiled closure body with its static capture layout.
#[derive(Debug, Clone)]
pub struct CompiledDef {
    pub arity: usize,
    pub body: NodeId,
    pub captures: Vec<Capture>,
    pub location: SourceLocation,
}

/// An immutable compiled program.
#[derive(Debug, Clone)]
pub struct Program {
    nodes: Vec<Node>,
    defs: Vec<CompiledDef>,
    root: NodeId,
}

impl Program {
    pub(crate) fn new(nodes: Vec<Node>, defs: Vec<CompiledDef>, root: NodeId) -> Self {
        Self { nodes, defs, root }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn def(&self, id: DefId) -> &CompiledDef {
        &self.defs[id]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn def_count(&self) -> usize {
        self.defs.len()
    }
}
