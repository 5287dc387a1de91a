//! External-call contract.
//!
//! A site is anything callable from a program that lives outside the node
//! graph: a service binding, a timer, a pure computation. The engine hands
//! every invocation a one-shot [`Continuation`]; the implementation must
//! settle it exactly once — resume with a value, report an error, or die
//! silently. The handle is explicit and thread-safe, never ambient state,
//! so a call may complete from any thread; only the first settlement acts.
//!
//! Sites are looked up by name at call time, so bindings can be swapped
//! without engine changes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::{CallOutcome, EngineShared, ReturnEntry};
use crate::error::TokenError;
use crate::pool::PoolHandle;
use crate::token::TokenKey;
use crate::value::Value;

/// An external call implementation.
pub trait Site: Send + Sync {
    /// Start the call. `cont` must eventually be settled exactly once, from
    /// any thread; dropping it unsettled counts as a silent death.
    fn invoke(&self, args: Vec<Value>, cont: Continuation);
}

/// One-shot handle through which a call resumes, errors, parks, or silences
/// the token that issued it.
#[derive(Debug)]
pub struct Continuation {
    shared: Arc<EngineShared>,
    token: Mutex<Option<TokenKey>>,
}

impl Continuation {
    pub(crate) fn new(shared: Arc<EngineShared>, token: TokenKey) -> Self {
        Self {
            shared,
            token: Mutex::new(Some(token)),
        }
    }

    /// Publish `value` to the suspended token. It resumes on the next round.
    pub fn resume(self, value: Value) {
        self.fire(CallOutcome::Resume(value));
    }

    /// Report a call-level error; it is dispatched exactly like an exception
    /// raised at the call site.
    pub fn error(self, error: TokenError) {
        self.fire(CallOutcome::Error(error));
    }

    /// The call will never publish: the token dies silently.
    pub fn die(self) {
        self.fire(CallOutcome::Die);
    }

    /// Suspend the caller on its scope's virtual clock; it resumes with a
    /// signal once virtual time has advanced by `delay`.
    pub fn park(self, delay: u64) {
        self.fire(CallOutcome::Park { delay });
    }

    fn fire(&self, outcome: CallOutcome) {
        let Some(token) = self.token.lock().take() else {
            // Already settled; later outcomes are ignored.
            return;
        };
        self.shared.push_return(ReturnEntry { token, outcome });
    }
}

impl Drop for Continuation {
    fn drop(&mut self) {
        // An implementation that forgot to settle must not leak a suspended
        // token; treat the drop as a silent death.
        self.fire(CallOutcome::Die);
    }
}

/// Named site bindings for one engine.
#[derive(Default)]
pub struct SiteRegistry {
    map: HashMap<String, Arc<dyn Site>>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name`, replacing any previous binding.
    pub fn register(&mut self, name: &str, site: Arc<dyn Site>) {
        self.map.insert(name.to_string(), site);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Site>> {
        self.map.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }
}

/// Adapter for sites that compute immediately on the engine thread.
///
/// The wrapped function returns `Ok(Some(value))` to publish, `Ok(None)` to
/// stay silent, or an error to fail the call.
pub struct PureSite<F>(pub F);

impl<F> Site for PureSite<F>
where
    F: Fn(Vec<Value>) -> Result<Option<Value>, TokenError> + Send + Sync,
{
    fn invoke(&self, args: Vec<Value>, cont: Continuation) {
        match (self.0)(args) {
            Ok(Some(value)) => cont.resume(value),
            Ok(None) => cont.die(),
            Err(error) => cont.error(error),
        }
    }
}

/// Adapter for calls that are allowed to block an OS thread.
///
/// The computation runs on the engine's bounded worker pool; the engine's
/// own loop never blocks, and pool exhaustion queues the call.
pub struct ThreadedSite<F> {
    pool: PoolHandle,
    f: Arc<F>,
}

impl<F> ThreadedSite<F>
where
    F: Fn(Vec<Value>) -> Result<Option<Value>, TokenError> + Send + Sync + 'static,
{
    pub fn new(pool: PoolHandle, f: F) -> Self {
        Self { pool, f: Arc::new(f) }
    }
}

impl<F> Site for ThreadedSite<F>
where
    F: Fn(Vec<Value>) -> Result<Option<Value>, TokenError> + Send + Sync + 'static,
{
    fn invoke(&self, args: Vec<Value>, cont: Continuation) {
        let f = self.f.clone();
        self.pool.execute(move || match f(args) {
            Ok(Some(value)) => cont.resume(value),
            Ok(None) => cont.die(),
            Err(error) => cont.error(error),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineShared;
    use slotmap::SlotMap;

    fn fixture() -> (Arc<EngineShared>, TokenKey) {
        let shared = Arc::new(EngineShared::new());
        let mut tokens: SlotMap<TokenKey, ()> = SlotMap::with_key();
        let token = tokens.insert(());
        (shared, token)
    }

    #[test]
    fn test_resume_queues_one_return() {
        let (shared, token) = fixture();
        shared.add_pending_call();
        let cont = Continuation::new(shared.clone(), token);
        cont.resume(Value::Integer(1));

        let mut state = shared.state.lock();
        assert_eq!(state.returns.len(), 1);
        assert_eq!(state.pending_calls, 0);
        let entry = state.returns.pop_front().unwrap();
        assert_eq!(entry.token, token);
        assert!(matches!(entry.outcome, CallOutcome::Resume(Value::Integer(1))));
    }

    #[test]
    fn test_drop_without_settling_dies() {
        let (shared, token) = fixture();
        shared.add_pending_call();
        drop(Continuation::new(shared.clone(), token));

        let mut state = shared.state.lock();
        let entry = state.returns.pop_front().unwrap();
        assert!(matches!(entry.outcome, CallOutcome::Die));
        assert_eq!(state.pending_calls, 0);
    }

    #[test]
    fn test_settled_continuation_ignores_drop() {
        let (shared, token) = fixture();
        shared.add_pending_call();
        let cont = Continuation::new(shared.clone(), token);
        cont.error(TokenError::DivisionByZero);
        // `cont` was consumed and dropped inside `error`; only one entry.
        assert_eq!(shared.state.lock().returns.len(), 1);
    }

    #[test]
    fn test_registry_swaps_by_name() {
        fn one(_: Vec<Value>) -> Result<Option<Value>, TokenError> {
            Ok(Some(Value::Integer(1)))
        }
        fn two(_: Vec<Value>) -> Result<Option<Value>, TokenError> {
            Ok(Some(Value::Integer(2)))
        }
        let mut registry = SiteRegistry::new();
        registry.register("X", Arc::new(PureSite(one)));
        registry.register("X", Arc::new(PureSite(two)));
        assert!(registry.contains("X"));
        assert!(registry.get("Y").is_none());
    }
}
