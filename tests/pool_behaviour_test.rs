//! Thread pool limits, exclusivity and lifecycle through the public API

mod common;

use anyhow::Result;
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use common::{sample_loader, SAMPLE};
use tandem_config::{
    ConcurrencyConfig, ExecutionSettings, PartialConcurrencyConfig, TandemConfig,
};
use tandem_execution::{ExecutionError, Master, ThreadPool};
use tandem_runtime::ThreadWorkerFactory;

fn pool_with(config: ConcurrencyConfig) -> Result<ThreadPool> {
    let factory = Arc::new(ThreadWorkerFactory::new(sample_loader()));
    Ok(ThreadPool::new(factory, config)?)
}

fn limited(max_threads: usize) -> ConcurrencyConfig {
    ConcurrencyConfig {
        max_threads,
        ..ConcurrencyConfig::default()
    }
}

#[tokio::test]
async fn test_pool_never_exceeds_max_threads() -> Result<()> {
    let master = Master::new(sample_loader());
    master.config(&PartialConcurrencyConfig::default().max_threads(3))?;
    let module = master.load(SAMPLE, ExecutionSettings::parallel()).await?;
    let slow_echo = module.export("slowEcho")?;

    let calls = (0..12).map(|i| {
        let slow_echo = slow_echo.clone();
        async move { slow_echo.invoke(vec![json!(i).into(), json!(20).into()]).await }
    });
    let (results, peak) = futures::join!(join_all(calls), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        master.pool().map_or(0, |pool| pool.thread_count())
    });

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result?, json!(i));
    }
    assert!(peak <= 3, "pool grew to {} threads", peak);

    let pool = master.pool().expect("pool is running");
    assert!(pool.thread_count() <= 3);
    assert_eq!(pool.pending_requests(), 0);
    assert!(pool.stats().iter().all(|stats| !stats.locked));

    master.terminate(false).await;
    Ok(())
}

#[tokio::test]
async fn test_abandoned_parallel_call_frees_thread() -> Result<()> {
    let master = Master::new(sample_loader());
    master.config(&PartialConcurrencyConfig::default().max_threads(1))?;
    let module = master.load(SAMPLE, ExecutionSettings::parallel()).await?;
    let slow_echo = module.export("slowEcho")?;

    let abandoned = tokio::time::timeout(
        Duration::from_millis(5),
        slow_echo.invoke(vec![json!(1).into(), json!(30).into()]),
    )
    .await;
    assert!(abandoned.is_err());

    let pool = master.pool().expect("pool is running");
    assert!(pool.stats().iter().all(|stats| !stats.locked));

    let value = tokio::time::timeout(
        Duration::from_secs(2),
        slow_echo.invoke(vec![json!(2).into(), json!(1).into()]),
    )
    .await??;
    assert_eq!(value, json!(2));

    master.terminate(false).await;
    Ok(())
}

#[tokio::test]
async fn test_exclusive_thread_waits_for_release() -> Result<()> {
    let pool = pool_with(limited(1))?;
    let held = pool.get_thread(true).await?;
    assert!(held.is_locked());

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.get_thread(true).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiter.is_finished());
    assert_eq!(pool.pending_requests(), 1);

    pool.release_thread(&held);
    let next = waiter.await??;
    assert_eq!(next, held);
    assert!(next.is_locked());

    pool.terminate(true).await;
    Ok(())
}

#[tokio::test]
async fn test_allocation_timeout_drops_request() -> Result<()> {
    let pool = pool_with(ConcurrencyConfig {
        max_threads: 1,
        thread_allocation_timeout: Some(Duration::from_millis(40)),
        allocation_interval: Duration::from_millis(5),
        ..ConcurrencyConfig::default()
    })?;
    let _held = pool.get_thread(true).await?;

    let err = pool.get_thread(true).await.unwrap_err();
    assert!(matches!(err, ExecutionError::ThreadAllocationTimeout(_)));
    assert_eq!(pool.pending_requests(), 0);

    pool.terminate(true).await;
    Ok(())
}

#[tokio::test]
async fn test_module_timeout_bounds_the_wait() -> Result<()> {
    let master = Master::new(sample_loader());
    let settings = ExecutionSettings::parallel().with_timeout(Duration::from_millis(30));
    let module = master.load(SAMPLE, settings).await?;

    // The only thread stays reserved while the object lives
    let store = module.export("Store")?.construct(vec![]).await?;
    let echo = module.export("echo")?;
    let err = echo.invoke(vec![json!("hi").into()]).await.unwrap_err();
    assert!(matches!(err, ExecutionError::ThreadAllocationTimeout(_)));

    store.dispose().await?;
    assert_eq!(echo.invoke(vec![json!("hi").into()]).await?, json!("hi"));

    master.terminate(false).await;
    Ok(())
}

#[tokio::test]
async fn test_terminated_pool_rejects_work() -> Result<()> {
    let pool = pool_with(limited(2))?;
    let thread = pool.get_thread(false).await?;

    pool.terminate(false).await;
    assert!(pool.is_terminated());
    assert_eq!(pool.thread_count(), 0);
    assert!(thread.is_terminated());

    assert!(matches!(
        pool.get_thread(false).await,
        Err(ExecutionError::ThreadPoolTerminated)
    ));
    Ok(())
}

#[tokio::test]
async fn test_descale_after_calls_finish() -> Result<()> {
    let master = Master::new(sample_loader());
    master.config(&PartialConcurrencyConfig::default().max_threads(2))?;
    let module = master.load(SAMPLE, ExecutionSettings::parallel()).await?;
    let echo = module.export("echo")?;

    let (a, b) = futures::join!(
        echo.invoke(vec![json!(1).into()]),
        echo.invoke(vec![json!(2).into()])
    );
    assert_eq!((a?, b?), (json!(1), json!(2)));

    let pool = master.pool().expect("pool is running");
    assert_eq!(pool.thread_count(), 2);
    assert_eq!(master.descale(false), 2);
    assert_eq!(pool.thread_count(), 0);

    // The pool grows again on demand
    assert_eq!(echo.invoke(vec![json!(3).into()]).await?, json!(3));
    assert_eq!(pool.thread_count(), 1);

    master.terminate(false).await;
    Ok(())
}

#[tokio::test]
async fn test_disabled_pool_runs_inline() -> Result<()> {
    let master = Master::new(sample_loader());
    master.config(&PartialConcurrencyConfig::default().disabled(true))?;
    let module = master.load(SAMPLE, ExecutionSettings::parallel()).await?;

    let echo = module.export("echo")?;
    assert_eq!(echo.invoke(vec![json!({"a": 1}).into()]).await?, json!({"a": 1}));
    assert!(master.is_started());
    assert!(master.pool().is_none());
    assert_eq!(master.descale(true), 0);

    master.terminate(false).await;
    assert!(!master.is_started());
    Ok(())
}

#[tokio::test]
async fn test_master_from_loaded_config() -> Result<()> {
    let config = TandemConfig {
        concurrency: ConcurrencyConfig {
            max_threads: 4,
            min_threads: 2,
            ..ConcurrencyConfig::default()
        },
        ..TandemConfig::default()
    };
    let master = Master::from_config(sample_loader(), &config)?;
    assert_eq!(master.settings().max_threads, 4);

    master.start()?;
    let pool = master.pool().expect("pool is running");
    assert_eq!(pool.thread_count(), 2);
    assert_eq!(pool.current_config().min_threads, 2);

    master.terminate(true).await;
    Ok(())
}
