//! Expression trees consumed by the compiler.
//!
//! A front end (parser, type checker) hands the engine a closure-unconverted
//! tree in this form. Variables are de Bruijn indices counted from the most
//! recent binding; `Sequence`, `Prune` and `Try` each bind exactly one value
//! for their dependent side, `Defs` binds one closure per definition.

use crate::error::SourceLocation;
use crate::value::Value;

/// An argument position: a literal, a bound variable, or a named site.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Constant(Value),
    /// De Bruijn index into the lexical environment.
    Var(usize),
    /// Reference to an external call implementation, resolved by name when
    /// the call happens.
    Site(String),
}

/// One definition inside a recursive declaration group.
///
/// Inside the body, indices `0..arity` address the call arguments (index 0 is
/// the last argument); higher indices address the declaration site, where the
/// group's own closures are the innermost bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct Def {
    pub arity: usize,
    pub body: Expr,
    pub location: SourceLocation,
}

impl Def {
    pub fn new(arity: usize, body: Expr) -> Self {
        Self {
            arity,
            body,
            location: SourceLocation::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Never publishes.
    Stop,
    /// Publish the value of an argument.
    Arg(Arg),
    /// Invoke a site or closure.
    Call { target: Arg, args: Vec<Arg> },
    /// Run both sides concurrently; publications interleave.
    Parallel(Box<Expr>, Box<Expr>),
    /// `left >x> right`: for each publication of `left`, run an independent
    /// copy of `right` with the value bound at index 0.
    Sequence(Box<Expr>, Box<Expr>),
    /// `left <x< right`: run `right` until its first publication, bind that
    /// value at index 0 of `left`, and cancel the rest of `right`.
    Prune(Box<Expr>, Box<Expr>),
    /// `left ; right`: run `right` only if `left` finishes without
    /// publishing anything.
    Otherwise(Box<Expr>, Box<Expr>),
    /// Declare a group of mutually recursive closures, in scope for each
    /// other and for `body`.
    Defs { defs: Vec<Def>, body: Box<Expr> },
    /// Run `body` under an exception handler. The handler sees the raised
    /// value at index 0 and publishes to the whole expression's continuation.
    Try { body: Box<Expr>, handler: Box<Expr> },
    /// Evaluate the expression and raise its publication as an exception.
    Throw(Box<Expr>),
    /// Attach a source location to the inner expression.
    WithLocation {
        expr: Box<Expr>,
        location: SourceLocation,
    },
    /// Run `body` inside an isolated scope: internal effects commit as a
    /// unit when the scope's region closes.
    Isolated(Box<Expr>),
}

impl Expr {
    pub fn constant(value: Value) -> Expr {
        Expr::Arg(Arg::Constant(value))
    }

    pub fn var(index: usize) -> Expr {
        Expr::Arg(Arg::Var(index))
    }

    pub fn call_site(name: &str, args: Vec<Arg>) -> Expr {
        Expr::Call {
            target: Arg::Site(name.to_string()),
            args,
        }
    }

    pub fn parallel(left: Expr, right: Expr) -> Expr {
        Expr::Parallel(Box::new(left), Box::new(right))
    }

    pub fn sequence(left: Expr, right: Expr) -> Expr {
        Expr::Sequence(Box::new(left), Box::new(right))
    }

    pub fn prune(left: Expr, right: Expr) -> Expr {
        Expr::Prune(Box::new(left), Box::new(right))
    }

    pub fn otherwise(left: Expr, right: Expr) -> Expr {
        Expr::Otherwise(Box::new(left), Box::new(right))
    }
}
