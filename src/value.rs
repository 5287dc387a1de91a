use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::Arc;

/// A value that can flow through the node graph and be published.
///
/// Values are cheap to clone: compound data is shared behind `Arc`. They must
/// be `Send + Sync` because external calls may carry them to worker threads.
#[derive(Debug, Clone)]
pub enum Value {
    /// The unit publication, produced by argumentless calls and timers.
    Signal,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    String(String),
    List(Arc<Vec<Value>>),
    /// A closure created by a declaration group.
    Closure(Closure),
    /// A reference to an external call implementation, resolved by name at
    /// call time so bindings stay swappable.
    Site(Arc<str>),
}

impl Value {
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Arc::new(items))
    }

    pub fn site(name: &str) -> Self {
        Value::Site(Arc::from(name))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Signal => "signal",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Closure(_) => "closure",
            Value::Site(_) => "site",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Signal, Value::Signal) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Real(a), Value::Real(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            // Closures have identity, not structure.
            (Value::Closure(a), Value::Closure(b)) => {
                a.def == b.def && Arc::ptr_eq(&a.frame, &b.frame)
            }
            (Value::Site(a), Value::Site(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Signal => write!(f, "signal"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(n) => write!(f, "{n}"),
            Value::Real(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "\"{s}\""),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Closure(c) => write!(f, "<closure/{}>", c.def),
            Value::Site(name) => write!(f, "<site {name}>"),
        }
    }
}

/// A closure value: a compiled definition plus its capture frame.
///
/// The frame is shared, never copied, so members of a mutually recursive
/// group can hold each other without duplicating environments.
#[derive(Clone)]
pub struct Closure {
    /// Index of the compiled definition in the program.
    pub def: usize,
    pub frame: Arc<CaptureFrame>,
}

// A frame can contain the closure itself; printing the slots would recurse
// forever, so both Debug impls stop at the frame boundary.
impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure")
            .field("def", &self.def)
            .field("captures", &self.frame.len())
            .finish()
    }
}

/// Fixed-size capture array for one closure, resolved once when the
/// declaration group is entered.
///
/// Slots are write-once cells so the recursive knot between siblings can be
/// tied after all the closure values exist; nothing can observe an unset slot
/// because the declaring token fills every frame before it proceeds.
pub struct CaptureFrame {
    slots: Vec<OnceCell<Value>>,
}

impl CaptureFrame {
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| OnceCell::new()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Fill a slot. Returns false if the slot was out of range or already set.
    pub fn set(&self, index: usize, value: Value) -> bool {
        match self.slots.get(index) {
            Some(cell) => cell.set(value).is_ok(),
            None => false,
        }
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.slots.get(index).and_then(|cell| cell.get())
    }
}

impl fmt::Debug for CaptureFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CaptureFrame({} slots)", self.slots.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Value::Signal.to_string(), "signal");
        assert_eq!(Value::Integer(-3).to_string(), "-3");
        assert_eq!(Value::String("hi".into()).to_string(), "\"hi\"");
        assert_eq!(
            Value::list(vec![Value::Integer(1), Value::Integer(2)]).to_string(),
            "[1, 2]"
        );
        assert_eq!(Value::site("Add").to_string(), "<site Add>");
    }

    #[test]
    fn test_equality() {
        assert_eq!(Value::Signal, Value::Signal);
        assert_eq!(Value::site("X"), Value::site("X"));
        assert_ne!(Value::Integer(1), Value::Real(1.0));
    }

    #[test]
    fn test_closure_identity() {
        let frame = Arc::new(CaptureFrame::new(0));
        let a = Value::Closure(Closure {
            def: 0,
            frame: frame.clone(),
        });
        let b = Value::Closure(Closure { def: 0, frame });
        let c = Value::Closure(Closure {
            def: 0,
            frame: Arc::new(CaptureFrame::new(0)),
        });
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_capture_frame_write_once() {
        let frame = CaptureFrame::new(2);
        assert!(frame.set(0, Value::Integer(1)));
        assert!(!frame.set(0, Value::Integer(2)));
        assert!(!frame.set(5, Value::Signal));
        assert_eq!(frame.get(0), Some(&Value::Integer(1)));
        assert_eq!(frame.get(1), None);
    }

    #[test]
    fn test_recursive_frame_debug_terminates() {
        let frame = Arc::new(CaptureFrame::new(1));
        let closure = Value::Closure(Closure {
            def: 7,
            frame: frame.clone(),
        });
        frame.set(0, closure.clone());
        let text = format!("{closure:?}");
        assert!(text.contains("def: 7"));
    }
}
