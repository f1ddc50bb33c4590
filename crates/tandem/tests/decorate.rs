//! Integration tests for `#[tandem::task]` on the global runtime.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tandem::prelude::*;
use tandem::{Call, FunctionId, Origin, TaskDef};

#[tandem::task]
fn add(a: i64, b: i64) -> i64 {
    a + b
}

#[tandem::task]
async fn fetch() -> u32 {
    tokio::task::yield_now().await;
    42
}

/// Parses a number.
#[tandem::task]
pub fn parse(text: String) -> std::result::Result<u32, std::num::ParseIntError> {
    text.trim().parse()
}

#[tandem::task]
async fn parse_later(text: String) -> anyhow::Result<u32> {
    tokio::time::sleep(Duration::from_millis(5)).await;
    let value: u32 = text.parse()?;
    Ok(value * 2)
}

#[tandem::task]
fn slow(millis: u64) -> &'static str {
    std::thread::sleep(Duration::from_millis(millis));
    "done"
}

#[tandem::task]
fn explode() -> u8 {
    panic!("kaboom")
}

#[tandem::task]
fn early(flag: bool) -> u8 {
    if flag {
        return 1;
    }
    2
}

#[derive(Clone)]
struct Counter {
    base: u32,
}

impl Counter {
    #[tandem::task]
    fn total(self, extra: u32) -> u32 {
        self.base + extra
    }

    #[tandem::task]
    fn shared_total(self: Arc<Self>, extra: u32) -> u32 {
        self.base + extra
    }

    #[tandem::task]
    async fn total_later(mut self, extra: u32) -> u32 {
        tokio::task::yield_now().await;
        self.base += extra;
        self.base
    }
}

#[test]
fn test_add_result() {
    let sum = add(2, 3);
    assert_eq!(sum.origin(), Origin::Thread);
    assert_eq!(sum.result(None).unwrap(), 5);
}

#[test]
fn test_fetch_from_blocking_thread() {
    let answer = fetch();
    assert_eq!(answer.origin(), Origin::Cooperative);
    assert_eq!(answer.result(Some(Duration::from_secs(5))).unwrap(), 42);
}

#[tokio::test]
async fn test_fetch_awaited() {
    assert_eq!(fetch().await.unwrap(), 42);
}

#[test]
fn test_then_scales_sum() {
    let scaled = add(2, 3).then(|sum| sum.result(None).map(|v| v * 10));
    assert_eq!(scaled.wait().unwrap(), 50);
}

#[test]
fn test_cooperative_cpu_bound_rejected() {
    let def = TaskDef::cooperative(FunctionId::new(module_path!(), "fetch")).cpu_bound(true);
    let err = Runtime::global()
        .dispatch(&def, Call::cooperative(async { 42_u32 }))
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

#[test]
fn test_fallible_task() {
    assert_eq!(parse(" 17 ".to_string()).wait().unwrap(), 17);

    let err = parse("seventeen".to_string()).wait().unwrap_err();
    let task = err.as_task().expect("task error");
    assert!(!task.is_panic());
    assert!(task.downcast_ref::<std::num::ParseIntError>().is_some());
}

#[test]
fn test_fallible_async_task() {
    assert_eq!(parse_later("21".to_string()).wait().unwrap(), 42);
    assert!(parse_later("x".to_string()).wait().is_err());
}

#[test]
fn test_call_returns_immediately() {
    let started = Instant::now();
    let pending = slow(300);
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(pending.wait().unwrap(), "done");
}

#[test]
fn test_panic_is_task_error() {
    let err = explode().wait().unwrap_err();
    assert!(err.as_task().unwrap().is_panic());
    assert!(err.to_string().contains("kaboom"));
}

#[test]
fn test_early_return() {
    assert_eq!(early(true).wait().unwrap(), 1);
    assert_eq!(early(false).wait().unwrap(), 2);
}

#[test]
fn test_method_binding() {
    let counter = Counter { base: 40 };
    assert_eq!(counter.clone().total(2).wait().unwrap(), 42);
    assert_eq!(counter.total_later(3).wait().unwrap(), 43);
}

#[test]
fn test_shared_instance_binding() {
    let counter = Arc::new(Counter { base: 40 });
    let first = counter.clone().shared_total(1);
    let second = counter.clone().shared_total(2);
    assert_eq!(first.wait().unwrap(), 41);
    assert_eq!(second.wait().unwrap(), 42);
    // The caller keeps its handle on the instance.
    assert_eq!(counter.base, 40);
}

#[test]
fn test_blocking_inside_cooperative_task_is_refused() {
    #[tandem::task]
    async fn impatient() -> bool {
        matches!(slow(50).result(None), Err(Error::UnsafeWait))
    }

    assert!(impatient().wait().unwrap());
}
