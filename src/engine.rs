//! The scheduler.
//!
//! One logical thread steps tokens over the node graph. Tokens ready to run
//! and tokens returning from external calls sit in two separate FIFO
//! queues: all ready tokens are processed before the next call return is
//! admitted, and admitting one starts a new round. This keeps sibling
//! strands fairly interleaved and makes publication order deterministic
//! when the calls themselves are.
//!
//! Tokens may be activated from the engine thread and resumed from worker
//! threads, so the two queues live behind one lock/notify pair; everything
//! else — tokens, groups, regions, clocks — is engine-private and needs no
//! locking at all.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;

use crate::ast::Arg;
use crate::clock::Clocks;
use crate::env::Env;
use crate::error::{EngineError, ErrorReport, TokenError};
use crate::graph::{Node, NodeId, Program};
use crate::group::{GroupKey, Groups};
use crate::region::{OnClose, RegionKey, Regions};
use crate::site::{Continuation, Site, SiteRegistry};
use crate::sites::core_sites;
use crate::pool::{PoolHandle, WorkerPool};
use crate::token::{CallStack, Frame, Handler, HandlerStack, Token, TokenKey};
use crate::value::{CaptureFrame, Closure, Value};

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Non-tail call depth each token may reach before dying with a
    /// stack-limit error.
    pub stack_limit: usize,
    /// Maximum number of simultaneously live tokens.
    pub max_tokens: usize,
    /// Worker threads backing blocking external calls.
    pub pool_threads: usize,
    /// Halt after this many top-level publications (`None`: run until
    /// quiescent).
    pub max_publications: Option<usize>,
    /// Escalate stack/token limit errors to engine-fatal.
    pub fatal_resource_errors: bool,
    /// Emit per-round queue-depth reports through the debug hook.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_limit: 1024,
            max_tokens: 100_000,
            pool_threads: num_cpus::get(),
            max_publications: None,
            fatal_resource_errors: false,
            debug: false,
        }
    }
}

/// Counters collected over one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub rounds: u64,
    pub steps: u64,
    pub publications: u64,
    pub uncaught_errors: u64,
    pub tokens_spawned: u64,
    pub peak_ready: usize,
    pub peak_returns: usize,
}

/// How an external call settled its continuation.
#[derive(Debug)]
pub(crate) enum CallOutcome {
    Resume(Value),
    Error(TokenError),
    Die,
    /// Wait on the issuing token's clock scope for `delay` virtual ticks.
    Park { delay: u64 },
}

#[derive(Debug)]
pub(crate) struct ReturnEntry {
    pub token: TokenKey,
    pub outcome: CallOutcome,
}

#[derive(Debug, Default)]
pub(crate) struct SharedState {
    pub ready: VecDeque<TokenKey>,
    pub returns: VecDeque<ReturnEntry>,
    /// Calls issued but not yet settled; the engine blocks rather than
    /// halting while any are outstanding.
    pub pending_calls: usize,
    pub halt: bool,
    pub pause: bool,
}

/// The cross-thread slice of the engine: the two queues and their condvar.
#[derive(Debug, Default)]
pub(crate) struct EngineShared {
    pub state: Mutex<SharedState>,
    pub cond: Condvar,
}

impl EngineShared {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_pending_call(&self) {
        self.state.lock().pending_calls += 1;
    }

    pub(crate) fn push_return(&self, entry: ReturnEntry) {
        let mut state = self.state.lock();
        state.returns.push_back(entry);
        state.pending_calls = state.pending_calls.saturating_sub(1);
        self.cond.notify_all();
    }
}

/// External control over a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<EngineShared>,
}

impl EngineHandle {
    pub fn pause(&self) {
        self.shared.state.lock().pause = true;
        self.shared.cond.notify_all();
    }

    pub fn unpause(&self) {
        self.shared.state.lock().pause = false;
        self.shared.cond.notify_all();
    }

    /// Stop the engine as soon as the current step finishes.
    pub fn terminate(&self) {
        self.shared.state.lock().halt = true;
        self.shared.cond.notify_all();
    }
}

enum Action {
    Step(TokenKey),
    Round(ReturnEntry),
    Advance,
    Halt,
}

type PublishHook = Box<dyn FnMut(Value) + Send>;
type ErrorHook = Box<dyn FnMut(&ErrorReport) + Send>;
type DebugHook = Box<dyn FnMut(&str) + Send>;

/// Executes one compiled program.
pub struct Engine {
    program: Arc<Program>,
    config: Config,
    shared: Arc<EngineShared>,
    pool: WorkerPool,
    sites: SiteRegistry,
    tokens: SlotMap<TokenKey, Token>,
    groups: Groups,
    root_group: GroupKey,
    regions: Regions,
    root_region: RegionKey,
    clocks: Clocks,
    /// True while pending clock entries hold the root region open.
    clock_occupied: bool,
    publications: usize,
    round: u64,
    stats: EngineStats,
    on_publish: PublishHook,
    on_error: ErrorHook,
    on_debug: DebugHook,
    started: bool,
}

impl Engine {
    pub fn new(program: Arc<Program>, config: Config) -> Engine {
        let (groups, root_group) = Groups::new();
        let (regions, root_region) = Regions::new();
        let pool = WorkerPool::new(config.pool_threads);
        Engine {
            program,
            config,
            shared: Arc::new(EngineShared::new()),
            pool,
            sites: core_sites(),
            tokens: SlotMap::with_key(),
            groups,
            root_group,
            regions,
            root_region,
            clocks: Clocks::new(),
            clock_occupied: false,
            publications: 0,
            round: 0,
            stats: EngineStats::default(),
            on_publish: Box::new(|value| println!("{value}")),
            on_error: Box::new(|report| eprintln!("{report}")),
            on_debug: Box::new(|line| eprintln!("{line}")),
            started: false,
        }
    }

    /// Bind or replace an external call implementation.
    pub fn register_site(&mut self, name: &str, site: Arc<dyn Site>) {
        self.sites.register(name, site);
    }

    /// Submission handle of the worker pool, for building threaded sites.
    pub fn pool_handle(&self) -> PoolHandle {
        self.pool.handle()
    }

    /// Control handle usable from other threads.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: self.shared.clone(),
        }
    }

    /// Override where top-level publications go.
    pub fn on_publish<F: FnMut(Value) + Send + 'static>(&mut self, hook: F) {
        self.on_publish = Box::new(hook);
    }

    /// Override where uncaught-error reports go.
    pub fn on_error<F: FnMut(&ErrorReport) + Send + 'static>(&mut self, hook: F) {
        self.on_error = Box::new(hook);
    }

    /// Override where debug lines go.
    pub fn on_debug<F: FnMut(&str) + Send + 'static>(&mut self, hook: F) {
        self.on_debug = Box::new(hook);
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Run to completion: until the root region closes, the publication cap
    /// is hit, the engine is terminated, or nothing can ever run again.
    pub fn run(&mut self) -> Result<EngineStats, EngineError> {
        if self.started {
            return Err(EngineError::Internal(
                "an engine runs its program exactly once".to_string(),
            ));
        }
        self.started = true;

        let root = Token {
            node: self.program.root(),
            env: Env::new(),
            value: Value::Signal,
            group: self.root_group,
            region: self.root_region,
            clock: self.clocks.root(),
            stack: CallStack::default(),
            handlers: HandlerStack::default(),
            budget: self.config.stack_limit,
            tail_depth: 0,
            location: Default::default(),
            vacated: false,
        };
        match self.insert_token(root) {
            Ok(key) => self.schedule(key),
            Err(error) => {
                self.report_uncaught(&error, Vec::new());
                return Ok(self.stats.clone());
            }
        }

        loop {
            match self.next_action() {
                Action::Step(key) => self.process(key)?,
                Action::Round(entry) => self.apply_return(entry)?,
                Action::Advance => self.advance_clock()?,
                Action::Halt => break,
            }
        }
        Ok(self.stats.clone())
    }

    /// Run and collect the publication stream; a convenience for embedders
    /// and tests that want the values rather than a stream.
    pub fn run_collect(&mut self) -> Result<Vec<Value>, EngineError> {
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink = out.clone();
        self.on_publish(move |value| sink.lock().push(value));
        self.run()?;
        let values = out.lock().clone();
        Ok(values)
    }

    fn next_action(&mut self) -> Action {
        let mut state = self.shared.state.lock();
        loop {
            if state.halt {
                return Action::Halt;
            }
            if state.pause {
                self.shared.cond.wait(&mut state);
                continue;
            }
            if let Some(key) = state.ready.pop_front() {
                return Action::Step(key);
            }
            if let Some(entry) = state.returns.pop_front() {
                self.stats.peak_returns = self.stats.peak_returns.max(state.returns.len() + 1);
                return Action::Round(entry);
            }
            if self.clocks.has_pending() {
                return Action::Advance;
            }
            if state.pending_calls > 0 {
                // A call is in flight; its settlement will wake us.
                self.shared.cond.wait(&mut state);
                continue;
            }
            // Quiescent: nothing ready, nothing returning, no timers, no
            // calls. Nothing can ever run again.
            return Action::Halt;
        }
    }

    /// Admit one call return, starting a new round.
    fn apply_return(&mut self, entry: ReturnEntry) -> Result<(), EngineError> {
        self.round += 1;
        self.stats.rounds = self.round;
        self.report_round();

        let key = entry.token;
        if !self.tokens.contains_key(key) {
            // The issuing token was cancelled while its call was in flight;
            // the outcome is discarded (best-effort cancellation, no undo).
            return Ok(());
        }
        match entry.outcome {
            CallOutcome::Resume(value) => {
                if let Some(token) = self.tokens.get_mut(key) {
                    token.value = value;
                }
                self.schedule(key);
            }
            CallOutcome::Error(error) => self.token_error(key, error)?,
            CallOutcome::Die => self.reap(key)?,
            CallOutcome::Park { delay } => {
                let Some(token) = self.tokens.get(key) else {
                    return Ok(());
                };
                let (region, clock) = (token.region, token.clock);
                if self.clocks.schedule(clock, delay, key) {
                    if let Some(token) = self.tokens.get_mut(key) {
                        token.vacated = true;
                    }
                    // A clock-parked token is quiescent: it vacates its
                    // region so the scope can finish without it, and
                    // re-enters (or dies) when time advances. The pending
                    // entry keeps the root region open meanwhile.
                    self.sync_clock_occupancy()?;
                    let closed = self.regions.leave(region);
                    self.handle_closures(closed)?;
                } else {
                    self.reap(key)?;
                }
            }
        }
        Ok(())
    }

    /// Wake every token due at the next virtual instant.
    fn advance_clock(&mut self) -> Result<(), EngineError> {
        for key in self.clocks.advance() {
            let Some(token) = self.tokens.get_mut(key) else {
                // Killed while parked.
                continue;
            };
            let region = token.region;
            if self.regions.is_open(region) {
                token.vacated = false;
                token.value = Value::Signal;
                self.regions.enter(region);
                self.schedule(key);
            } else {
                // The scope finished while we slept; the delayed strand is
                // dead and must not resurrect a closed region.
                self.reap(key)?;
            }
        }
        self.sync_clock_occupancy()
    }

    /// Pending timers count as one inhabitant of the root region, so an
    /// execution with nothing left but delays does not finish early.
    fn sync_clock_occupancy(&mut self) -> Result<(), EngineError> {
        let pending = self.clocks.has_pending();
        if pending && !self.clock_occupied {
            self.clock_occupied = true;
            self.regions.enter(self.root_region);
        } else if !pending && self.clock_occupied {
            self.clock_occupied = false;
            let closed = self.regions.leave(self.root_region);
            self.handle_closures(closed)?;
        }
        Ok(())
    }

    /// Step one token: apply its node's transformation.
    fn process(&mut self, key: TokenKey) -> Result<(), EngineError> {
        let Some(token) = self.tokens.get(key) else {
            // Killed while queued; a stale key is skipped, never stepped.
            return Ok(());
        };
        if !self.groups.is_alive(token.group) {
            return self.reap(key);
        }
        self.stats.steps += 1;
        let mut tok = token.clone();
        let program = self.program.clone();

        match *program.node(tok.node) {
            Node::Let { ref arg, next } => {
                tok.value = self.resolve_arg(&tok, arg)?;
                tok.node = next;
                self.store(key, tok);
                self.schedule(key);
            }

            Node::Publish => {
                let value = tok.value;
                self.publish(value);
                self.reap(key)?;
            }

            Node::Stop => self.reap(key)?,

            Node::Fork { left, right } => {
                let mut child = tok.clone();
                child.node = right;
                match self.insert_token(child) {
                    Ok(child_key) => {
                        tok.node = left;
                        self.store(key, tok);
                        self.schedule(key);
                        self.schedule(child_key);
                    }
                    Err(error) => self.token_error(key, error)?,
                }
            }

            Node::Bind { next } => {
                tok.env = tok.env.extend(tok.value.clone());
                tok.node = next;
                self.store(key, tok);
                self.schedule(key);
            }

            Node::Unwind { depth, next } => {
                tok.env = tok
                    .env
                    .unwind(depth)
                    .ok_or_else(|| internal("unwind past the environment depth"))?;
                tok.node = next;
                self.store(key, tok);
                self.schedule(key);
            }

            Node::Call {
                ref target,
                ref args,
                next,
                tail,
            } => {
                let callee = self.resolve_arg(&tok, target)?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.resolve_arg(&tok, arg)?);
                }
                match callee {
                    Value::Closure(closure) => {
                        self.call_closure(key, tok, &closure, values, next, tail)?
                    }
                    Value::Site(name) => match self.sites.get(&name) {
                        Some(site) => {
                            // Suspend at the continuation; the call's
                            // publications resume there.
                            tok.node = next;
                            self.store(key, tok);
                            let cont = self.make_continuation(key);
                            site.invoke(values, cont);
                        }
                        None => {
                            self.token_error(key, TokenError::UnknownSite(name.to_string()))?
                        }
                    },
                    other => self.token_error(key, TokenError::Uncallable(other))?,
                }
            }

            Node::Return => {
                let (frame, rest) = tok
                    .stack
                    .pop()
                    .ok_or_else(|| internal("return with no continuation frame"))?;
                tok.env = frame.env;
                tok.node = frame.return_node;
                tok.location = frame.location;
                tok.stack = rest;
                tok.budget += 1;
                self.store(key, tok);
                self.schedule(key);
            }

            Node::Prune { left, right } => {
                let Some(cell_group) = self.groups.create_cell_child(tok.group, key) else {
                    return self.reap(key);
                };
                let cell_region = self
                    .regions
                    .create_child(tok.region, OnClose::Prune { group: cell_group });
                let mut right_tok = tok.clone();
                right_tok.node = right;
                right_tok.group = cell_group;
                right_tok.region = cell_region;
                // Park the waiter before `left`; the cell wakes it.
                tok.node = left;
                self.store(key, tok);
                match self.insert_token(right_tok) {
                    Ok(right_key) => self.schedule(right_key),
                    Err(error) => {
                        self.token_error(key, error)?;
                        let closed = self.regions.leave(cell_region);
                        self.handle_closures(closed)?;
                    }
                }
            }

            Node::Store => {
                match self.groups.fill_cell(tok.group) {
                    Some(waiter) => {
                        let value = tok.value;
                        // First publication: cut the rest of the right side,
                        // then deliver the binding.
                        self.kill_group(tok.group)?;
                        if let Some(token) = self.tokens.get_mut(waiter) {
                            token.env = token.env.extend(value.clone());
                            token.value = value;
                            self.schedule(waiter);
                        }
                    }
                    // Late publication of an already-cut side.
                    None => self.reap(key)?,
                }
            }

            Node::Otherwise { left, right } => {
                let Some(right_group) = self.groups.create_child(tok.group) else {
                    return self.reap(key);
                };
                let mut right_tok = tok.clone();
                right_tok.node = right;
                right_tok.group = right_group;
                match self.insert_token(right_tok) {
                    Ok(right_key) => {
                        let sub = self.regions.create_child(
                            tok.region,
                            OnClose::Otherwise {
                                right: right_key,
                                right_group,
                                published: false,
                            },
                        );
                        self.regions.enter(sub);
                        let closed = self.regions.leave(tok.region);
                        self.handle_closures(closed)?;
                        tok.region = sub;
                        tok.node = left;
                        self.store(key, tok);
                        self.schedule(key);
                    }
                    Err(error) => {
                        self.kill_group(right_group)?;
                        self.token_error(key, error)?;
                    }
                }
            }

            Node::Leave { next } => {
                if let Some((_, right_group)) = self.regions.mark_published(tok.region) {
                    self.kill_group(right_group)?;
                }
                let parent = self
                    .regions
                    .parent(tok.region)
                    .ok_or_else(|| internal("leave from the root region"))?;
                self.regions.enter(parent);
                let closed = self.regions.leave(tok.region);
                self.handle_closures(closed)?;
                tok.region = parent;
                tok.node = next;
                self.store(key, tok);
                self.schedule(key);
            }

            Node::Defs { ref defs, next } => {
                let mut frames = Vec::with_capacity(defs.len());
                let mut closures = Vec::with_capacity(defs.len());
                for &def in defs {
                    let frame = Arc::new(CaptureFrame::new(program.def(def).captures.len()));
                    closures.push(Value::Closure(Closure {
                        def,
                        frame: frame.clone(),
                    }));
                    frames.push(frame);
                }
                for (frame, &def) in frames.iter().zip(defs) {
                    for (slot, capture) in program.def(def).captures.iter().enumerate() {
                        let value = match capture {
                            crate::graph::Capture::Outer(index) => tok
                                .env
                                .lookup(*index)
                                .cloned()
                                .ok_or_else(|| internal("capture index past the environment"))?,
                            crate::graph::Capture::Sibling(sibling) => closures[*sibling].clone(),
                        };
                        if !frame.set(slot, value) {
                            return Err(internal("capture slot filled twice"));
                        }
                    }
                }
                tok.env = tok.env.extend_all(closures);
                tok.node = next;
                self.store(key, tok);
                self.schedule(key);
            }

            Node::PushHandler { handler, body } => {
                tok.handlers = tok.handlers.push(Handler {
                    env: tok.env.clone(),
                    node: handler,
                    stack: tok.stack.clone(),
                    group: tok.group,
                    region: tok.region,
                    clock: tok.clock,
                });
                tok.node = body;
                self.store(key, tok);
                self.schedule(key);
            }

            Node::PopHandler { next } => {
                let (_, rest) = tok
                    .handlers
                    .pop()
                    .ok_or_else(|| internal("handler pop with no handler frame"))?;
                tok.handlers = rest;
                tok.node = next;
                self.store(key, tok);
                self.schedule(key);
            }

            Node::Throw => {
                let value = tok.value;
                self.token_error(key, TokenError::Raised(value))?;
            }

            Node::Location { location, next } => {
                tok.location = location;
                tok.node = next;
                self.store(key, tok);
                self.schedule(key);
            }

            Node::Isolate { body } => {
                // An isolated scope owns a nested timeline too; its pending
                // delays fold back into the enclosing clock when the scope
                // commits.
                let clock = self
                    .clocks
                    .create_child(tok.clock)
                    .ok_or_else(|| internal("isolate under a vanished clock scope"))?;
                let sub = self
                    .regions
                    .create_child(tok.region, OnClose::ClockHandoff { clock });
                self.regions.enter(sub);
                let closed = self.regions.leave(tok.region);
                self.handle_closures(closed)?;
                tok.region = sub;
                tok.clock = clock;
                tok.node = body;
                self.store(key, tok);
                self.schedule(key);
            }

            Node::Deisolate { next } => {
                let parent = self
                    .regions
                    .parent(tok.region)
                    .ok_or_else(|| internal("deisolate from the root region"))?;
                let parent_clock = self
                    .clocks
                    .parent(tok.clock)
                    .ok_or_else(|| internal("deisolate from the root clock scope"))?;
                self.regions.enter(parent);
                let closed = self.regions.leave(tok.region);
                self.handle_closures(closed)?;
                tok.region = parent;
                tok.clock = parent_clock;
                tok.node = next;
                self.store(key, tok);
                self.schedule(key);
            }
        }
        Ok(())
    }

    fn call_closure(
        &mut self,
        key: TokenKey,
        mut tok: Token,
        closure: &Closure,
        args: Vec<Value>,
        next: NodeId,
        tail: bool,
    ) -> Result<(), EngineError> {
        let program = self.program.clone();
        let def = program.def(closure.def);
        if args.len() != def.arity {
            return self.token_error(
                key,
                TokenError::ArityMismatch {
                    expected: def.arity,
                    actual: args.len(),
                },
            );
        }
        // Call environment: captures beneath, arguments on top.
        let mut env = Env::new();
        for slot in (0..def.captures.len()).rev() {
            let value = closure
                .frame
                .get(slot)
                .cloned()
                .ok_or_else(|| internal("unset capture slot at call time"))?;
            env = env.extend(value);
        }
        env = env.extend_all(args);

        if tail {
            // Reuse the current frame: unbounded self-recursion stays flat.
            tok.tail_depth += 1;
        } else {
            if tok.budget == 0 {
                return self.token_error(
                    key,
                    TokenError::StackLimit {
                        limit: self.config.stack_limit,
                    },
                );
            }
            tok.stack = tok.stack.push(Frame {
                env: tok.env.clone(),
                return_node: next,
                location: tok.location,
            });
            tok.budget -= 1;
        }
        tok.env = env;
        tok.node = def.body;
        tok.location = def.location;
        self.store(key, tok);
        self.schedule(key);
        Ok(())
    }

    /// Dispatch a token-level error: unwind to the nearest live handler or
    /// report it uncaught. The failing token always dies.
    fn token_error(&mut self, key: TokenKey, error: TokenError) -> Result<(), EngineError> {
        if error.is_resource_limit() && self.config.fatal_resource_errors {
            return Err(EngineError::Resource(error));
        }
        let Some(token) = self.tokens.get(key) else {
            return Ok(());
        };
        let tok = token.clone();
        match tok.handlers.pop() {
            Some((handler, rest)) => {
                // The handler runs where the try stood; if that scope has
                // been cancelled or finished, the raiser just dies.
                if self.groups.is_alive(handler.group) && self.regions.is_open(handler.region) {
                    let budget = self
                        .config
                        .stack_limit
                        .saturating_sub(handler.stack.depth());
                    let handler_tok = Token {
                        node: handler.node,
                        env: handler.env.extend(error.to_value()),
                        value: error.to_value(),
                        group: handler.group,
                        region: handler.region,
                        clock: handler.clock,
                        stack: handler.stack,
                        handlers: rest,
                        budget,
                        tail_depth: 0,
                        location: tok.location,
                        vacated: false,
                    };
                    match self.insert_token(handler_tok) {
                        Ok(handler_key) => self.schedule(handler_key),
                        Err(spawn_error) => {
                            self.report_uncaught(&spawn_error, tok.backtrace())
                        }
                    }
                }
                self.reap(key)
            }
            None => {
                self.report_uncaught(&error, tok.backtrace());
                self.reap(key)
            }
        }
    }

    /// Act on regions that just closed, innermost first.
    fn handle_closures(&mut self, closed: Vec<OnClose>) -> Result<(), EngineError> {
        for on_close in closed {
            match on_close {
                OnClose::Nothing => {}
                OnClose::Root => self.set_halt(),
                OnClose::Prune { group } => {
                    // The right side finished. If the cell never filled, the
                    // waiter will never get its binding.
                    if let Some(cell) = self.groups.cell(group) {
                        if !cell.filled {
                            let waiter = cell.waiter;
                            self.kill_group(group)?;
                            self.reap(waiter)?;
                        }
                    }
                }
                OnClose::Otherwise {
                    right, published, ..
                } => {
                    if !published {
                        // The left side finished silently: release the
                        // parked right side.
                        if self.tokens.contains_key(right) {
                            self.schedule(right);
                        }
                    }
                }
                OnClose::ClockHandoff { clock } => self.clocks.merge_into_parent(clock),
            }
        }
        Ok(())
    }

    /// Kill a group: every descendant group dies and every member token is
    /// reaped. Idempotent; a dead group kills nothing.
    fn kill_group(&mut self, group: GroupKey) -> Result<(), EngineError> {
        for token in self.groups.kill(group) {
            self.reap(token)?;
        }
        Ok(())
    }

    /// Remove a dead token and let its region notice the departure.
    fn reap(&mut self, key: TokenKey) -> Result<(), EngineError> {
        let Some(token) = self.tokens.remove(key) else {
            return Ok(());
        };
        self.groups.remove_member(token.group, key);
        if !token.vacated {
            let closed = self.regions.leave(token.region);
            self.handle_closures(closed)?;
        }
        Ok(())
    }

    fn insert_token(&mut self, token: Token) -> Result<TokenKey, TokenError> {
        if self.tokens.len() >= self.config.max_tokens {
            return Err(TokenError::TokenLimit {
                limit: self.config.max_tokens,
            });
        }
        let group = token.group;
        let region = token.region;
        let key = self.tokens.insert(token);
        self.groups.add_member(group, key);
        self.regions.enter(region);
        self.stats.tokens_spawned += 1;
        Ok(key)
    }

    fn make_continuation(&self, key: TokenKey) -> Continuation {
        self.shared.add_pending_call();
        Continuation::new(self.shared.clone(), key)
    }

    fn resolve_arg(&self, tok: &Token, arg: &Arg) -> Result<Value, EngineError> {
        match arg {
            Arg::Constant(value) => Ok(value.clone()),
            Arg::Var(index) => tok
                .env
                .lookup(*index)
                .cloned()
                .ok_or_else(|| internal("variable index past the environment")),
            Arg::Site(name) => Ok(Value::site(name)),
        }
    }

    fn schedule(&mut self, key: TokenKey) {
        let mut state = self.shared.state.lock();
        state.ready.push_back(key);
        self.stats.peak_ready = self.stats.peak_ready.max(state.ready.len());
    }

    fn publish(&mut self, value: Value) {
        (self.on_publish)(value);
        self.publications += 1;
        self.stats.publications += 1;
        if let Some(max) = self.config.max_publications {
            if self.publications >= max {
                self.set_halt();
            }
        }
    }

    fn report_uncaught(&mut self, error: &TokenError, backtrace: Vec<crate::error::SourceLocation>) {
        let report = ErrorReport {
            message: error.to_string(),
            backtrace,
            cause: error.cause().map(str::to_string),
        };
        self.stats.uncaught_errors += 1;
        (self.on_error)(&report);
    }

    fn set_halt(&self) {
        let mut state = self.shared.state.lock();
        state.halt = true;
        self.shared.cond.notify_all();
    }

    fn report_round(&mut self) {
        if !self.config.debug {
            return;
        }
        let (ready, returns) = {
            let state = self.shared.state.lock();
            (state.ready.len(), state.returns.len())
        };
        let line = format!(
            "--- round {}: {} ready, {} queued returns",
            self.round, ready, returns
        );
        (self.on_debug)(&line);
    }

    fn store(&mut self, key: TokenKey, token: Token) {
        if let Some(slot) = self.tokens.get_mut(key) {
            *slot = token;
        }
    }
}

fn internal(message: &str) -> EngineError {
    EngineError::Internal(message.to_string())
}
