use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use strand::{compile, Arg, Config, Def, Engine, Expr, Value};

fn iarg(n: i64) -> Arg {
    Arg::Constant(Value::Integer(n))
}

/// Tail-recursive countdown: measures raw token stepping and site-call
/// round-trips without any stack growth.
fn countdown(n: i64) -> Expr {
    let done = Expr::sequence(
        Expr::call_site("Eq", vec![Arg::Var(0), iarg(0)]),
        Expr::sequence(
            Expr::call_site("Ift", vec![Arg::Var(0)]),
            Expr::constant(Value::Signal),
        ),
    );
    let recurse = Expr::sequence(
        Expr::call_site("Greater", vec![Arg::Var(0), iarg(0)]),
        Expr::sequence(
            Expr::call_site("Ift", vec![Arg::Var(0)]),
            Expr::sequence(
                Expr::call_site("Sub", vec![Arg::Var(2), iarg(1)]),
                Expr::Call {
                    target: Arg::Var(4),
                    args: vec![Arg::Var(0)],
                },
            ),
        ),
    );
    Expr::Defs {
        defs: vec![Def::new(1, Expr::parallel(done, recurse))],
        body: Box::new(Expr::Call {
            target: Arg::Var(0),
            args: vec![iarg(n)],
        }),
    }
}

/// Wide parallel fan with a pruning cut at the end.
fn fan(width: i64) -> Expr {
    let mut tree = Expr::constant(Value::Integer(0));
    for i in 1..width {
        tree = Expr::parallel(Expr::constant(Value::Integer(i)), tree);
    }
    Expr::prune(Expr::var(0), tree)
}

fn bench_engine(c: &mut Criterion) {
    c.bench_function("tail_countdown_1000", |b| {
        let program = Arc::new(compile(&countdown(1000)).unwrap());
        b.iter(|| {
            let mut engine = Engine::new(program.clone(), Config::default());
            black_box(engine.run_collect().unwrap())
        })
    });

    c.bench_function("parallel_fan_256_pruned", |b| {
        let program = Arc::new(compile(&fan(256)).unwrap());
        b.iter(|| {
            let mut engine = Engine::new(program.clone(), Config::default());
            black_box(engine.run_collect().unwrap())
        })
    });
}

criterion_group!(benches, bench_engine);
criterion_main!(benches);
