//! Integration tests for dispatching and observing tasks through `Unfuture`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tandem_core::{Call, Error, FunctionId, Origin, Runtime, RuntimeConfig, TaskDef, Unfuture};

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::default().with_thread_pool_size(4)).unwrap()
}

fn add(runtime: &Runtime, a: i64, b: i64) -> Unfuture<i64> {
    let def = TaskDef::plain(FunctionId::new(module_path!(), "add"));
    runtime.dispatch(&def, Call::plain(move || a + b)).unwrap()
}

fn fetch(runtime: &Runtime) -> Unfuture<u32> {
    let def = TaskDef::cooperative(FunctionId::new(module_path!(), "fetch"));
    runtime
        .dispatch(
            &def,
            Call::cooperative(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                42
            }),
        )
        .unwrap()
}

#[test]
fn test_add_with_default_dispatch() {
    let runtime = runtime();
    let future = add(&runtime, 2, 3);
    assert_eq!(future.origin(), Origin::Thread);
    assert_eq!(future.result(None).unwrap(), 5);
}

#[test]
fn test_cooperative_fetch_from_blocking_thread() {
    let runtime = runtime();
    let future = fetch(&runtime);
    assert_eq!(future.result(Some(Duration::from_secs(5))).unwrap(), 42);
}

#[tokio::test]
async fn test_cooperative_fetch_awaited() {
    let runtime = runtime();
    assert_eq!(fetch(&runtime).await.unwrap(), 42);
}

#[test]
fn test_fetch_awaited_from_loop_task() {
    let runtime = runtime();
    let inner = runtime.clone();
    let def = TaskDef::cooperative(FunctionId::new(module_path!(), "outer"));
    let outer = runtime
        .dispatch(
            &def,
            Call::cooperative_fallible(async move { fetch(&inner).await.map(|v| v + 1) }),
        )
        .unwrap();
    assert_eq!(outer.wait().unwrap(), 43);
}

#[test]
fn test_then_scales_add() {
    let runtime = runtime();
    let scaled = add(&runtime, 2, 3).then(|f| f.result(None).map(|v| v * 10));
    assert_eq!(scaled.result(Some(Duration::from_secs(5))).unwrap(), 50);
}

#[test]
fn test_cooperative_cpu_bound_fails_immediately() {
    let runtime = runtime();
    let def = TaskDef::cooperative(FunctionId::new(module_path!(), "fetch")).cpu_bound(true);
    let started = Instant::now();
    let err = runtime
        .dispatch(&def, Call::cooperative(async { 42_u32 }))
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(err.to_string().contains("may not be cpu_bound"));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(runtime.stats().process_pools_created, 0);
}

#[test]
fn test_call_sites_never_block() {
    let runtime = runtime();
    let started = Instant::now();

    let slow_thread = runtime
        .dispatch(
            &TaskDef::plain(FunctionId::new(module_path!(), "slow_thread")),
            Call::plain(|| {
                std::thread::sleep(Duration::from_millis(400));
                1_u8
            }),
        )
        .unwrap();
    let slow_loop = runtime
        .dispatch(
            &TaskDef::cooperative(FunctionId::new(module_path!(), "slow_loop")),
            Call::cooperative(async {
                tokio::time::sleep(Duration::from_millis(400)).await;
                2_u8
            }),
        )
        .unwrap();

    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(slow_thread.wait().unwrap() + slow_loop.wait().unwrap(), 3);
}

#[test]
fn test_result_is_cached() {
    let runtime = runtime();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let future = runtime
        .dispatch(
            &TaskDef::plain(FunctionId::new(module_path!(), "count")),
            Call::plain_fallible(move || -> anyhow::Result<usize> {
                anyhow::ensure!(counter.fetch_add(1, Ordering::SeqCst) == 0, "ran twice");
                anyhow::bail!("first and only failure")
            }),
        )
        .unwrap();

    let first = future.wait().unwrap_err().to_string();
    for _ in 0..3 {
        let started = Instant::now();
        let again = future.result(Some(Duration::ZERO)).unwrap_err();
        assert_eq!(again.to_string(), first);
        assert!(started.elapsed() < Duration::from_millis(50));
    }
    assert_eq!(first, "first and only failure");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_blocking_on_loop_thread_is_refused() {
    let runtime = runtime();
    let gate = Unfuture::<u32>::pending(&runtime);
    let inner = gate.clone();

    let probe = runtime
        .dispatch(
            &TaskDef::cooperative(FunctionId::new(module_path!(), "probe")),
            Call::cooperative(async move { matches!(inner.result(None), Err(Error::UnsafeWait)) }),
        )
        .unwrap();
    assert!(probe.wait().unwrap());

    // The same wait from this thread blocks until the future resolves.
    let setter = gate.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        setter.set_result(8).unwrap();
    });
    assert_eq!(gate.result(Some(Duration::from_secs(5))).unwrap(), 8);
    handle.join().unwrap();
}

#[test]
fn test_timeout_leaves_task_running() {
    let runtime = runtime();
    let finished = Arc::new(AtomicUsize::new(0));
    let flag = finished.clone();
    let future = runtime
        .dispatch(
            &TaskDef::plain(FunctionId::new(module_path!(), "sleepy")),
            Call::plain(move || {
                std::thread::sleep(Duration::from_millis(150));
                flag.fetch_add(1, Ordering::SeqCst);
                "awake"
            }),
        )
        .unwrap();

    assert!(matches!(
        future.result(Some(Duration::from_millis(10))),
        Err(Error::Timeout(_))
    ));
    assert_eq!(future.wait().unwrap(), "awake");
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

#[test]
fn test_then_does_not_run_after_failure() {
    let runtime = runtime();
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = ran.clone();
    let failing = runtime
        .dispatch(
            &TaskDef::plain(FunctionId::new(module_path!(), "fail")),
            Call::plain_fallible(|| -> anyhow::Result<i64> { anyhow::bail!("source failed") }),
        )
        .unwrap();

    let next = failing.then(move |f| {
        counter.fetch_add(1, Ordering::SeqCst);
        f.result(None)
    });
    let err = next.wait().unwrap_err();
    assert_eq!(err.to_string(), "source failed");
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn test_then_async_adopts_dispatched_future() {
    let runtime = runtime();
    let inner = runtime.clone();
    let chained = add(&runtime, 1, 1).then_async(move |f| {
        let value = f.result(None).unwrap_or_default();
        add(&inner, value, 40)
    });
    assert_eq!(chained.wait().unwrap(), 42);
}

#[test]
fn test_chain_runs_in_order() {
    let runtime = runtime();
    let log = Arc::new(std::sync::Mutex::new(Vec::new()));
    let (first, second) = (log.clone(), log.clone());

    let chained = add(&runtime, 0, 1)
        .then(move |f| {
            first.lock().unwrap().push("first");
            f.result(None)
        })
        .then(move |f| {
            second.lock().unwrap().push("second");
            f.result(None).map(|v| v + 1)
        });

    assert_eq!(chained.wait().unwrap(), 2);
    assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
}
