//! A pool of worker processes spawned from this very binary.
//!
//! Each worker is this example re-executed with `--go-worker=true`; the
//! registration below runs on both sides, so parent and child agree on what
//! registry index 0 means. Run with `cargo run --example process_pool`.

use goro::{register, Goro, GoroOptions, TransportKind, Value};

fn fibonacci(n: u64) -> u64 {
    match n {
        0 | 1 => n,
        _ => fibonacci(n - 1) + fibonacci(n - 2),
    }
}

fn main() -> Result<(), goro::GoroError> {
    let fib = register(|args| {
        let n = args.first().and_then(Value::as_int).unwrap_or(0) as u64;
        Ok(Value::Int(fibonacci(n) as i64))
    });

    // In a spawned worker this runs the worker runtime and never returns.
    goro::init();

    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    runtime.block_on(async {
        let pool = Goro::start(
            GoroOptions::default()
                .with_workers(4)
                .with_adapter(TransportKind::Process),
        )
        .await?;

        let mut calls = Vec::new();
        for n in 28..36i64 {
            let pool = pool.clone();
            calls.push((
                n,
                tokio::spawn(async move { pool.call(fib, vec![Value::Int(n)]).await }),
            ));
        }

        for (n, call) in calls {
            let value = call.await.expect("call task")?;
            println!("fib({}) = {:?}", n, value);
        }

        pool.terminate().await
    })
}
