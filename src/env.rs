use std::fmt;
use std::sync::Arc;

use crate::value::Value;

/// Persistent indexed environment.
///
/// Bindings form a shared linked list: extending is O(1) and produces an
/// independent environment, so forked tokens never observe each other's
/// bindings. Lookup is by de Bruijn index, 0 being the most recent binding.
/// Linear lookup sounds slow but environments stay shallow in practice, and
/// the O(1) copy is what the fork-heavy combinators actually need.
#[derive(Clone, Default)]
pub struct Env {
    head: Option<Arc<Binding>>,
    len: usize,
}

struct Binding {
    value: Value,
    parent: Option<Arc<Binding>>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A new environment with `value` pushed on top.
    #[must_use]
    pub fn extend(&self, value: Value) -> Env {
        Env {
            head: Some(Arc::new(Binding {
                value,
                parent: self.head.clone(),
            })),
            len: self.len + 1,
        }
    }

    /// Push several values; the last item of the iterator ends up on top.
    #[must_use]
    pub fn extend_all<I: IntoIterator<Item = Value>>(&self, values: I) -> Env {
        let mut env = self.clone();
        for value in values {
            env = env.extend(value);
        }
        env
    }

    /// Look up a binding by distance from the top.
    pub fn lookup(&self, index: usize) -> Option<&Value> {
        let mut node = self.head.as_deref()?;
        for _ in 0..index {
            node = node.parent.as_deref()?;
        }
        Some(&node.value)
    }

    /// Drop the top `n` bindings, leaving binding scopes.
    ///
    /// Returns `None` when the environment is shallower than `n`; the
    /// compiler only emits unwinds matching its own binds, so that is an
    /// internal error at the caller.
    pub fn unwind(&self, n: usize) -> Option<Env> {
        if n > self.len {
            return None;
        }
        let mut head = self.head.clone();
        for _ in 0..n {
            head = head.and_then(|node| node.parent.clone());
        }
        Some(Env {
            head,
            len: self.len - n,
        })
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Env({} bindings)", self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_and_lookup() {
        let env = Env::new()
            .extend(Value::Integer(1))
            .extend(Value::Integer(2));
        assert_eq!(env.lookup(0), Some(&Value::Integer(2)));
        assert_eq!(env.lookup(1), Some(&Value::Integer(1)));
        assert_eq!(env.lookup(2), None);
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn test_extension_does_not_alias() {
        let base = Env::new().extend(Value::Integer(1));
        let left = base.extend(Value::String("left".into()));
        let right = base.extend(Value::String("right".into()));
        assert_eq!(left.lookup(0), Some(&Value::String("left".into())));
        assert_eq!(right.lookup(0), Some(&Value::String("right".into())));
        assert_eq!(base.lookup(0), Some(&Value::Integer(1)));
    }

    #[test]
    fn test_unwind() {
        let env = Env::new()
            .extend(Value::Integer(1))
            .extend(Value::Integer(2))
            .extend(Value::Integer(3));
        let popped = env.unwind(2).unwrap();
        assert_eq!(popped.len(), 1);
        assert_eq!(popped.lookup(0), Some(&Value::Integer(1)));
        assert!(env.unwind(4).is_none());
        assert_eq!(env.unwind(0).unwrap().len(), 3);
    }

    #[test]
    fn test_extend_all_order() {
        let env = Env::new().extend_all(vec![Value::Integer(1), Value::Integer(2)]);
        // The last pushed value is index 0.
        assert_eq!(env.lookup(0), Some(&Value::Integer(2)));
        assert_eq!(env.lookup(1), Some(&Value::Integer(1)));
    }
}
