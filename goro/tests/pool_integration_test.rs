//! End-to-end scenarios over the thread transport: register, start, call,
//! terminate, and the fallback/scaling behaviors in between.

use std::time::Duration;

use goro::{
    register, register_async, use_exports, CallOutcome, ErrorValue, Exports, GoFunc, Goro,
    GoroError, GoroOptions, SharedValue, Value, REGISTRY_MALFORMED,
};

fn sum(args: Vec<Value>) -> CallOutcome {
    let a = args.first().and_then(Value::as_int).unwrap_or(0);
    let b = args.get(1).and_then(Value::as_int).unwrap_or(0);
    Ok(Value::Int(a + b))
}

#[tokio::test]
async fn test_registered_sum() {
    let sum = register(sum);
    let pool = Goro::start(GoroOptions::default().with_workers(1))
        .await
        .unwrap();

    let result = pool
        .call(sum, vec![Value::Int(12), Value::Int(13)])
        .await
        .unwrap();
    assert_eq!(result, Value::Int(25));

    pool.terminate().await.unwrap();
}

#[tokio::test]
async fn test_async_function() {
    let mul = register_async(|args: Vec<Value>| async move {
        let a = args.first().and_then(Value::as_int).unwrap_or(0);
        let b = args.get(1).and_then(Value::as_int).unwrap_or(0);
        Ok(Value::Int(a * b))
    });

    let pool = Goro::start(GoroOptions::default().with_workers(1))
        .await
        .unwrap();
    let result = pool
        .call(mul, vec![Value::Int(10), Value::Int(10)])
        .await
        .unwrap();
    assert_eq!(result, Value::Int(100));

    pool.terminate().await.unwrap();
}

#[tokio::test]
async fn test_registry_mismatch_detection() {
    let pool = Goro::start(GoroOptions::default().with_workers(1))
        .await
        .unwrap();

    // A handle the worker-side registry cannot back
    let bogus = GoFunc {
        index: u32::MAX,
        signature: 0xBAD_F00D,
    };
    let error = pool.call(bogus, vec![]).await.unwrap_err();
    assert_eq!(error.message(), REGISTRY_MALFORMED);

    pool.terminate().await.unwrap();
}

#[tokio::test]
async fn test_error_propagation() {
    let throw_err = register(|_args| -> CallOutcome {
        Err(ErrorValue::msg("Something went wrong"))
    });

    let pool = Goro::start(GoroOptions::default().with_workers(1))
        .await
        .unwrap();
    let error = pool.call(throw_err, vec![]).await.unwrap_err();
    match error {
        GoroError::Call(e) => assert_eq!(e.message, "Something went wrong"),
        other => panic!("expected a call error, got {:?}", other),
    }

    pool.terminate().await.unwrap();
}

#[tokio::test]
async fn test_structured_values() {
    let get_map = register(|_args| {
        Ok(Value::Map(vec![
            (Value::from("foo"), Value::from("Hello")),
            (Value::from("bar"), Value::from("World")),
        ]))
    });
    let get_regex = register(|_args| {
        Ok(Value::Regex {
            pattern: "[a-zA-Z0-9]".to_string(),
            flags: String::new(),
        })
    });

    let pool = Goro::start(GoroOptions::default().with_workers(1))
        .await
        .unwrap();

    let map = pool.call(get_map, vec![]).await.unwrap();
    assert_eq!(
        map,
        Value::Map(vec![
            (Value::from("foo"), Value::from("Hello")),
            (Value::from("bar"), Value::from("World")),
        ])
    );

    let regex = pool.call(get_regex, vec![]).await.unwrap();
    assert_eq!(
        regex,
        Value::Regex {
            pattern: "[a-zA-Z0-9]".to_string(),
            flags: String::new(),
        }
    );

    pool.terminate().await.unwrap();
}

#[tokio::test]
async fn test_cycle_elimination() {
    let cyclic = register(|_args| {
        let cell = SharedValue::new(Value::Null);
        cell.set(Value::Record(vec![
            ("foo".to_string(), Value::from("Hello, World")),
            ("bar".to_string(), Value::Shared(cell.clone())),
        ]));
        Ok(Value::Shared(cell))
    });

    let pool = Goro::start(GoroOptions::default().with_workers(1))
        .await
        .unwrap();
    let result = pool.call(cyclic, vec![]).await.unwrap();
    assert_eq!(result, Value::record([("foo", Value::from("Hello, World"))]));

    pool.terminate().await.unwrap();
}

#[tokio::test]
async fn test_local_fallback_after_terminate() {
    let mul = register_async(|args: Vec<Value>| async move {
        let a = args.first().and_then(Value::as_int).unwrap_or(0);
        let b = args.get(1).and_then(Value::as_int).unwrap_or(0);
        Ok(Value::Int(a * b))
    });

    let pool = Goro::start(GoroOptions::default().with_workers(1))
        .await
        .unwrap();
    pool.terminate().await.unwrap();
    assert_eq!(pool.workers().await, 0);

    // Empty pool: served on the main side, same result
    let result = pool
        .call(mul, vec![Value::Int(10), Value::Int(10)])
        .await
        .unwrap();
    assert_eq!(result, Value::Int(100));
}

#[tokio::test]
async fn test_named_exports() {
    use_exports(Exports::new().function("integration_sum", sum));

    let pool = Goro::start(GoroOptions::default().with_workers(1))
        .await
        .unwrap();
    let result = pool
        .call_named("integration_sum", vec![Value::Int(2), Value::Int(40)])
        .await
        .unwrap();
    assert_eq!(result, Value::Int(42));

    let missing = pool.call_named("integration_no_such_fn", vec![]).await;
    assert_eq!(missing.unwrap_err().message(), REGISTRY_MALFORMED);

    pool.terminate().await.unwrap();
}

#[tokio::test]
async fn test_worker_side_pool_query() {
    // The symmetric half of the protocol: a worker asks the main side how
    // many workers the pool has.
    let count = register_async(|_args| async move {
        let n = goro::workers().await;
        Ok(Value::Int(n as i64))
    });

    let pool = Goro::start(GoroOptions::default().with_workers(2))
        .await
        .unwrap();
    assert_eq!(pool.workers().await, 2);

    let seen_from_worker = pool.call(count, vec![]).await.unwrap();
    assert_eq!(seen_from_worker, Value::Int(2));

    pool.terminate().await.unwrap();
}

#[tokio::test]
async fn test_worker_identity() {
    let identity = register(|_args| {
        Ok(Value::record([
            ("is_main", Value::Bool(goro::is_main_thread())),
            ("thread_id", Value::Int(goro::thread_id() as i64)),
            ("data", goro::worker_data().unwrap_or(Value::Null)),
        ]))
    });

    assert!(goro::is_main_thread());
    assert_eq!(goro::thread_id(), 0);

    let pool = Goro::start(
        GoroOptions::default()
            .with_workers(1)
            .with_worker_data(Value::record([("env", Value::from("test"))])),
    )
    .await
    .unwrap();

    let seen = pool.call(identity, vec![]).await.unwrap();
    assert_eq!(seen.get("is_main").and_then(Value::as_bool), Some(false));
    assert!(seen.get("thread_id").and_then(Value::as_int).unwrap_or(0) > 0);
    assert_eq!(
        seen.get("data"),
        Some(&Value::record([("env", Value::from("test"))]))
    );

    pool.terminate().await.unwrap();
}

#[tokio::test]
async fn test_stale_worker_provokes_scale_up() {
    let busy = register(|args: Vec<Value>| {
        let ms = args.first().and_then(Value::as_int).unwrap_or(0) as u64;
        // Holding the CPU stops this worker's ticks
        std::thread::sleep(Duration::from_millis(ms));
        Ok(Value::Int(1))
    });
    let quick = register(|_args| Ok(Value::Int(2)));

    let pool = Goro::start(GoroOptions::default().with_worker_range(1, 2))
        .await
        .unwrap();
    assert_eq!(pool.workers().await, 1);

    let blocked = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.call(busy, vec![Value::Int(1600)]).await })
    };

    // Let the single worker go stale
    tokio::time::sleep(Duration::from_millis(1300)).await;

    let result = pool.call(quick, vec![]).await.unwrap();
    assert_eq!(result, Value::Int(2));
    assert_eq!(pool.workers().await, 2);

    let long_result = blocked.await.unwrap().unwrap();
    assert_eq!(long_result, Value::Int(1));

    pool.terminate().await.unwrap();
}

#[tokio::test]
async fn test_round_robin_spreads_calls() {
    let whoami = register(|_args| Ok(Value::Int(goro::thread_id() as i64)));

    let pool = Goro::start(GoroOptions::default().with_workers(3))
        .await
        .unwrap();

    let mut seen = std::collections::HashSet::new();
    for _ in 0..30 {
        let id = pool
            .call(whoami, vec![])
            .await
            .unwrap()
            .as_int()
            .unwrap_or(-1);
        seen.insert(id);
    }
    // Round-robin over a full pool reaches every worker
    assert_eq!(seen.len(), 3);

    pool.terminate().await.unwrap();
}
