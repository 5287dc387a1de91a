//! Compiles an expression tree into an execution graph.
//!
//! Every expression is compiled relative to an "output" node representing
//! the rest of the program, so the graph grows bottom-up: publications of
//! the compiled expression flow into `output`. Compilation is pure
//! structural recursion with no runtime side effects; the resulting
//! [`Program`] is immutable and safely shared across concurrent runs.
//!
//! Closure bodies never index their enclosing frame directly: free
//! variables are renumbered into fixed per-closure capture slots here, once,
//! so the engine can build a call environment from a static capture array.

use std::collections::{BTreeMap, BTreeSet};

use crate::ast::{Arg, Def, Expr};
use crate::error::CompileError;
use crate::graph::{Capture, CompiledDef, DefId, Node, NodeId, Program};

/// Compile a closed expression into a program whose top-level publications
/// escape through the engine's publication hook.
pub fn compile(expr: &Expr) -> Result<Program, CompileError> {
    let mut compiler = Compiler::default();
    let publish = compiler.push(Node::Publish);
    let root = compiler.compile_expr(expr, 0, publish)?;
    Ok(Program::new(compiler.nodes, compiler.defs, root))
}

#[derive(Default)]
struct Compiler {
    nodes: Vec<Node>,
    defs: Vec<CompiledDef>,
}

impl Compiler {
    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// A call whose continuation is a plain return can reuse its frame.
    fn is_tail(&self, output: NodeId) -> bool {
        matches!(self.nodes[output], Node::Return)
    }

    /// Emit an unwind for `depth` bindings, unless the continuation is a
    /// return (which restores the caller's environment wholesale anyway).
    fn unwind(&mut self, depth: usize, output: NodeId) -> NodeId {
        if depth == 0 || self.is_tail(output) {
            output
        } else {
            self.push(Node::Unwind {
                depth,
                next: output,
            })
        }
    }

    fn check_arg(&self, arg: &Arg, depth: usize) -> Result<(), CompileError> {
        if let Arg::Var(index) = arg {
            if *index >= depth {
                return Err(CompileError::UnboundVariable {
                    index: *index,
                    depth,
                });
            }
        }
        Ok(())
    }

    fn compile_expr(
        &mut self,
        expr: &Expr,
        depth: usize,
        output: NodeId,
    ) -> Result<NodeId, CompileError> {
        match expr {
            Expr::Stop => Ok(self.push(Node::Stop)),

            Expr::Arg(arg) => {
                self.check_arg(arg, depth)?;
                Ok(self.push(Node::Let {
                    arg: arg.clone(),
                    next: output,
                }))
            }

            Expr::Call { target, args } => {
                self.check_arg(target, depth)?;
                for arg in args {
                    self.check_arg(arg, depth)?;
                }
                let tail = self.is_tail(output);
                Ok(self.push(Node::Call {
                    target: target.clone(),
                    args: args.clone(),
                    next: output,
                    tail,
                }))
            }

            Expr::Parallel(left, right) => {
                let left = self.compile_expr(left, depth, output)?;
                let right = self.compile_expr(right, depth, output)?;
                Ok(self.push(Node::Fork { left, right }))
            }

            Expr::Sequence(left, right) => {
                let after = self.unwind(1, output);
                let right = self.compile_expr(right, depth + 1, after)?;
                let bind = self.push(Node::Bind { next: right });
                self.compile_expr(left, depth, bind)
            }

            Expr::Prune(left, right) => {
                let after = self.unwind(1, output);
                let left = self.compile_expr(left, depth + 1, after)?;
                let store = self.push(Node::Store);
                let right = self.compile_expr(right, depth, store)?;
                Ok(self.push(Node::Prune { left, right }))
            }

            Expr::Otherwise(left, right) => {
                let leave = self.push(Node::Leave { next: output });
                let left = self.compile_expr(left, depth, leave)?;
                let right = self.compile_expr(right, depth, output)?;
                Ok(self.push(Node::Otherwise { left, right }))
            }

            Expr::Defs { defs, body } => {
                if defs.is_empty() {
                    return Err(CompileError::EmptyDefGroup);
                }
                let group = defs.len();
                let mut ids: Vec<DefId> = Vec::with_capacity(group);
                for def in defs {
                    let compiled = self.compile_def(def, group, depth)?;
                    self.defs.push(compiled);
                    ids.push(self.defs.len() - 1);
                }
                let after = self.unwind(group, output);
                let body = self.compile_expr(body, depth + group, after)?;
                Ok(self.push(Node::Defs {
                    defs: ids,
                    next: body,
                }))
            }

            Expr::Try { body, handler } => {
                let after = self.unwind(1, output);
                let handler = self.compile_expr(handler, depth + 1, after)?;
                let pop = self.push(Node::PopHandler { next: output });
                let body = self.compile_expr(body, depth, pop)?;
                Ok(self.push(Node::PushHandler { handler, body }))
            }

            Expr::Throw(inner) => {
                let throw = self.push(Node::Throw);
                self.compile_expr(inner, depth, throw)
            }

            Expr::WithLocation { expr, location } => {
                let inner = self.compile_expr(expr, depth, output)?;
                Ok(self.push(Node::Location {
                    location: *location,
                    next: inner,
                }))
            }

            Expr::Isolated(inner) => {
                let leave = self.push(Node::Deisolate { next: output });
                let body = self.compile_expr(inner, depth, leave)?;
                Ok(self.push(Node::Isolate { body }))
            }
        }
    }

    /// Compile one member of a declaration group of `group` definitions,
    /// declared where `outer_depth` bindings were in scope.
    ///
    /// Free variables of the body (beyond the arguments) are collected,
    /// mapped to capture slots, and the body is renumbered so it only ever
    /// addresses `[arguments..., captures...]`.
    fn compile_def(
        &mut self,
        def: &Def,
        group: usize,
        outer_depth: usize,
    ) -> Result<CompiledDef, CompileError> {
        let mut free = BTreeSet::new();
        free_vars(&def.body, def.arity, &mut free);

        let mut slots = BTreeMap::new();
        let mut captures = Vec::with_capacity(free.len());
        for (slot, &index) in free.iter().enumerate() {
            slots.insert(index, slot);
            if index < group {
                // Innermost declaration-level binding is the last sibling.
                captures.push(Capture::Sibling(group - 1 - index));
            } else {
                let outer = index - group;
                if outer >= outer_depth {
                    return Err(CompileError::UnboundVariable {
                        index: outer,
                        depth: outer_depth,
                    });
                }
                captures.push(Capture::Outer(outer));
            }
        }

        let renumbered = renumber(&def.body, def.arity, &slots);
        let ret = self.push(Node::Return);
        let body = self.compile_expr(&renumbered, def.arity + captures.len(), ret)?;

        Ok(CompiledDef {
            arity: def.arity,
            body,
            captures,
            location: def.location,
        })
    }
}

/// Collect the indices (relative to `depth`) of variables free in `expr`.
fn free_vars(expr: &Expr, depth: usize, acc: &mut BTreeSet<usize>) {
    fn check(arg: &Arg, depth: usize, acc: &mut BTreeSet<usize>) {
        if let Arg::Var(index) = arg {
            if *index >= depth {
                acc.insert(index - depth);
            }
        }
    }
    match expr {
        Expr::Stop => {}
        Expr::Arg(arg) => check(arg, depth, acc),
        Expr::Call { target, args } => {
            check(target, depth, acc);
            for arg in args {
                check(arg, depth, acc);
            }
        }
        Expr::Parallel(l, r) | Expr::Otherwise(l, r) => {
            free_vars(l, depth, acc);
            free_vars(r, depth, acc);
        }
        Expr::Sequence(l, r) => {
            free_vars(l, depth, acc);
            free_vars(r, depth + 1, acc);
        }
        Expr::Prune(l, r) => {
            free_vars(l, depth + 1, acc);
            free_vars(r, depth, acc);
        }
        Expr::Defs { defs, body } => {
            let group = defs.len();
            for def in defs {
                free_vars(&def.body, depth + group + def.arity, acc);
            }
            free_vars(body, depth + group, acc);
        }
        Expr::Try { body, handler } => {
            free_vars(body, depth, acc);
            free_vars(handler, depth + 1, acc);
        }
        Expr::Throw(inner) | Expr::Isolated(inner) => free_vars(inner, depth, acc),
        Expr::WithLocation { expr, .. } => free_vars(expr, depth, acc),
    }
}

/// Rewrite free-variable references into capture-slot references.
///
/// A variable `v` at walk depth `d` with `v >= d` addresses declaration-level
/// binding `v - d`; its capture slot `s` sits at index `d + s` in the
/// renumbered body (the call environment lays captures directly beneath the
/// arguments).
fn renumber(expr: &Expr, depth: usize, slots: &BTreeMap<usize, usize>) -> Expr {
    let map_arg = |arg: &Arg, depth: usize| -> Arg {
        match arg {
            Arg::Var(v) if *v >= depth => Arg::Var(depth + slots[&(v - depth)]),
            other => other.clone(),
        }
    };
    match expr {
        Expr::Stop => Expr::Stop,
        Expr::Arg(arg) => Expr::Arg(map_arg(arg, depth)),
        Expr::Call { target, args } => Expr::Call {
            target: map_arg(target, depth),
            args: args.iter().map(|a| map_arg(a, depth)).collect(),
        },
        Expr::Parallel(l, r) => Expr::Parallel(
            Box::new(renumber(l, depth, slots)),
            Box::new(renumber(r, depth, slots)),
        ),
        Expr::Otherwise(l, r) => Expr::Otherwise(
            Box::new(renumber(l, depth, slots)),
            Box::new(renumber(r, depth, slots)),
        ),
        Expr::Sequence(l, r) => Expr::Sequence(
            Box::new(renumber(l, depth, slots)),
            Box::new(renumber(r, depth + 1, slots)),
        ),
        Expr::Prune(l, r) => Expr::Prune(
            Box::new(renumber(l, depth + 1, slots)),
            Box::new(renumber(r, depth, slots)),
        ),
        Expr::Defs { defs, body } => {
            let group = defs.len();
            Expr::Defs {
                defs: defs
                    .iter()
                    .map(|def| Def {
                        arity: def.arity,
                        body: renumber(&def.body, depth + group + def.arity, slots),
                        location: def.location,
                    })
                    .collect(),
                body: Box::new(renumber(body, depth + group, slots)),
            }
        }
        Expr::Try { body, handler } => Expr::Try {
            body: Box::new(renumber(body, depth, slots)),
            handler: Box::new(renumber(handler, depth + 1, slots)),
        },
        Expr::Throw(inner) => Expr::Throw(Box::new(renumber(inner, depth, slots))),
        Expr::Isolated(inner) => Expr::Isolated(Box::new(renumber(inner, depth, slots))),
        Expr::WithLocation { expr, location } => Expr::WithLocation {
            expr: Box::new(renumber(expr, depth, slots)),
            location: *location,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn int(n: i64) -> Expr {
        Expr::constant(Value::Integer(n))
    }

    #[test]
    fn test_compile_constant() {
        let program = compile(&int(1)).unwrap();
        assert!(matches!(
            program.node(program.root()),
            Node::Let { arg: Arg::Constant(Value::Integer(1)), .. }
        ));
    }

    #[test]
    fn test_unbound_variable_rejected() {
        let err = compile(&Expr::var(0)).unwrap_err();
        assert_eq!(err, CompileError::UnboundVariable { index: 0, depth: 0 });
    }

    #[test]
    fn test_sequence_binds_one() {
        assert!(compile(&Expr::sequence(int(1), Expr::var(0))).is_ok());
        let err = compile(&Expr::sequence(int(1), Expr::var(1))).unwrap_err();
        assert_eq!(err, CompileError::UnboundVariable { index: 1, depth: 1 });
    }

    #[test]
    fn test_empty_def_group_rejected() {
        let expr = Expr::Defs {
            defs: vec![],
            body: Box::new(int(1)),
        };
        assert_eq!(compile(&expr).unwrap_err(), CompileError::EmptyDefGroup);
    }

    fn find_calls(program: &Program) -> Vec<bool> {
        (0..program.node_count())
            .filter_map(|id| match program.node(id) {
                Node::Call { tail, .. } => Some(*tail),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_self_call_in_tail_position_is_marked() {
        // def f(x) = f(x); run f(1). The recursive call's continuation is the
        // body's return, so it must be marked tail.
        let def = Def::new(
            1,
            Expr::Call {
                target: Arg::Var(1),
                args: vec![Arg::Var(0)],
            },
        );
        let expr = Expr::Defs {
            defs: vec![def],
            body: Box::new(Expr::Call {
                target: Arg::Var(0),
                args: vec![Arg::Constant(Value::Integer(1))],
            }),
        };
        let program = compile(&expr).unwrap();
        let tails = find_calls(&program);
        assert!(tails.contains(&true), "recursive call should be tail");
    }

    #[test]
    fn test_sequenced_call_is_not_tail() {
        let expr = Expr::sequence(Expr::call_site("Add", vec![]), Expr::var(0));
        let program = compile(&expr).unwrap();
        assert_eq!(find_calls(&program), vec![false]);
    }

    #[test]
    fn test_outer_capture_becomes_slot() {
        // 5 >x> (def f() = x; run f()): the def captures the sequence
        // binding as its single outer slot, and the renumbered body reads
        // index 0 (arity 0 + slot 0).
        let def = Def::new(0, Expr::var(1)); // x: index 0 is the def itself
        let expr = Expr::sequence(
            int(5),
            Expr::Defs {
                defs: vec![def],
                body: Box::new(Expr::Call {
                    target: Arg::Var(0),
                    args: vec![],
                }),
            },
        );
        let program = compile(&expr).unwrap();
        assert_eq!(program.def_count(), 1);
        let def = program.def(0);
        assert_eq!(def.captures, vec![Capture::Outer(0)]);
        assert!(matches!(
            program.node(def.body),
            Node::Let { arg: Arg::Var(0), .. }
        ));
    }

    #[test]
    fn test_mutual_defs_capture_each_other() {
        // def f(x) = g(x); def g(x) = f(x); run f(1).
        // Inside each body at depth 1, index 1 is the innermost declaration
        // binding (g) and index 2 the outer one (f).
        let f = Def::new(
            1,
            Expr::Call {
                target: Arg::Var(1), // g
                args: vec![Arg::Var(0)],
            },
        );
        let g = Def::new(
            1,
            Expr::Call {
                target: Arg::Var(2), // f
                args: vec![Arg::Var(0)],
            },
        );
        let expr = Expr::Defs {
            defs: vec![f, g],
            body: Box::new(Expr::Call {
                target: Arg::Var(1), // f
                args: vec![Arg::Constant(Value::Integer(1))],
            }),
        };
        let program = compile(&expr).unwrap();
        assert_eq!(program.def_count(), 2);
        // f captured g: declaration-level index 0 is the last sibling (g).
        assert_eq!(program.def(0).captures, vec![Capture::Sibling(1)]);
        // g captured f.
        assert_eq!(program.def(1).captures, vec![Capture::Sibling(0)]);
    }

    #[test]
    fn test_unbound_in_def_body_rejected() {
        let def = Def::new(0, Expr::var(5));
        let expr = Expr::Defs {
            defs: vec![def],
            body: Box::new(int(1)),
        };
        assert!(matches!(
            compile(&expr).unwrap_err(),
            CompileError::UnboundVariable { .. }
        ));
    }
}
