//! # strand
//!
//! Execution engine for a concurrent orchestration language. Programs
//! coordinate many independent asynchronous calls — services, timers, pure
//! computations — through a small set of combinators for parallelism,
//! value pruning, sequencing, and racing. The engine compiles a parsed
//! expression tree into an immutable graph of combinator nodes, then moves
//! lightweight tokens (execution strands) across it, emitting a stream of
//! published values with deterministic cancellation and termination:
//!
//! - **Groups** form the cancellation tree: killing one cancels every
//!   descendant strand, idempotently.
//! - **Regions** form the quiescence tree: a region closes exactly when no
//!   live strand remains inside it, which is what resolves pruning and
//!   racing.
//! - **Virtual time** advances only when the scheduler is otherwise stuck,
//!   so timeouts are deterministic and cost no wall-clock time.
//! - **External calls** get an explicit one-shot continuation and may
//!   settle from any thread; blocking work runs on a bounded worker pool.
//!
//! ```
//! use std::sync::Arc;
//! use strand::{compile, Config, Engine, Expr, Value};
//!
//! // 1 | 2
//! let expr = Expr::parallel(
//!     Expr::constant(Value::Integer(1)),
//!     Expr::constant(Value::Integer(2)),
//! );
//! let program = Arc::new(compile(&expr).unwrap());
//! let mut engine = Engine::new(program, Config::default());
//! let values = engine.run_collect().unwrap();
//! assert_eq!(values, vec![Value::Integer(1), Value::Integer(2)]);
//! ```

pub mod ast;
pub mod clock;
pub mod compiler;
pub mod engine;
pub mod env;
pub mod error;
pub mod graph;
pub mod group;
pub mod pool;
pub mod region;
pub mod site;
pub mod sites;
pub mod token;
pub mod value;

pub use ast::{Arg, Def, Expr};
pub use compiler::compile;
pub use engine::{Config, Engine, EngineHandle, EngineStats};
pub use error::{
    CompileError, EngineError, Error, ErrorReport, Result, SourceLocation, TokenError,
};
pub use site::{Continuation, PureSite, Site, SiteRegistry, ThreadedSite};
pub use value::Value;
