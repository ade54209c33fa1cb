//! 订阅管理器的集成测试

use rat_livequery::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn row(status: &str) -> Row {
    [("Status".to_string(), DataValue::String(status.to_string()))]
        .into_iter()
        .collect()
}

fn setup(driver: &MemoryDriver, max_connections: u32) -> (ConnectionPool, SubscriptionManager) {
    let config = DatabaseConfig::builder()
        .alias("subscriptions")
        .sqlite(":memory:", true)
        .pool(PoolConfig {
            min_connections: 0,
            max_connections,
            ..PoolConfig::default()
        })
        .build()
        .expect("数据库配置无效");
    let pool = ConnectionPool::with_driver(config, Arc::new(driver.clone())).expect("创建连接池失败");
    let manager = SubscriptionManager::new(
        OperationExecutor::new(pool.clone()),
        SubscriptionConfig::default(),
    );
    (pool, manager)
}

fn active_orders() -> OperationRequest {
    OperationRequest::procedure("GetActiveOrders")
        .typed_param("deptId", ParamType::Int, 4)
        .build()
        .expect("请求无效")
}

#[tokio::test(start_paused = true)]
async fn test_no_delivery_after_unsubscribe() {
    println!("🔍 测试取消订阅后不再推送");

    let driver = MemoryDriver::new().with_rows("GetActiveOrders", vec![row("open")]);
    let (_pool, manager) = setup(&driver, 2);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let id = manager
        .subscribe("client-a", active_orders(), Some(1000), Arc::new(tx))
        .unwrap();

    // 首次数据 + 一个周期
    for _ in 0..2 {
        match rx.recv().await.unwrap() {
            SubscriptionEvent::Update { subscription_id, rows, .. } => {
                assert_eq!(subscription_id, id);
                assert_eq!(rows, vec![row("open")]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
    let executed = driver.executions().len();

    manager.unsubscribe(id);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(rx.recv().await.is_none());
    assert_eq!(driver.executions().len(), executed);
    println!("✅ 取消订阅后没有新的执行和推送");
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_exhaustive() {
    let driver = MemoryDriver::new();
    let (pool, manager) = setup(&driver, 2);
    let (tx, _rx) = mpsc::unbounded_channel::<SubscriptionEvent>();
    let sink: Arc<dyn SubscriptionSink> = Arc::new(tx);

    for interval in [100, 250, 1000, 5000] {
        manager
            .subscribe("client-a", active_orders(), Some(interval), sink.clone())
            .unwrap();
    }
    let (other_tx, mut other_rx) = mpsc::unbounded_channel();
    manager
        .subscribe("client-b", active_orders(), Some(100), Arc::new(other_tx))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(manager.on_subscriber_disconnect("client-a"), 4);
    assert!(manager.list("client-a").is_empty());

    let executed = driver.executions().len();
    tokio::time::sleep(Duration::from_millis(1000)).await;
    // 只剩 client-b 的订阅在轮询
    let delta = driver.executions().len() - executed;
    assert!((9..=11).contains(&delta), "unexpected executions: {}", delta);
    assert!(other_rx.recv().await.is_some());

    manager.shutdown().await;
    assert_eq!(pool.status().in_use, 0);
}

#[tokio::test(start_paused = true)]
async fn test_ticks_of_one_subscription_never_overlap() {
    // 执行耗时超过间隔：下一次轮询等待上一次结束
    let driver = MemoryDriver::new().with_latency(Duration::from_millis(700));
    let (pool, manager) = setup(&driver, 4);
    let (tx, mut rx) = mpsc::unbounded_channel();

    manager
        .subscribe("slow-client", active_orders(), Some(200), Arc::new(tx))
        .unwrap();

    for _ in 0..3 {
        rx.recv().await.unwrap();
        assert!(pool.status().in_use <= 1);
    }
    assert_eq!(pool.status().total, 1);
}

#[tokio::test(start_paused = true)]
async fn test_pool_failure_is_delivered_as_error_event() {
    let driver = MemoryDriver::new();
    driver.set_unreachable(true);
    let (_pool, manager) = setup(&driver, 1);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let id = manager
        .subscribe("client-a", active_orders(), Some(500), Arc::new(tx))
        .unwrap();

    match rx.recv().await.unwrap() {
        SubscriptionEvent::Error { subscription_id, kind, .. } => {
            assert_eq!(subscription_id, id);
            assert_eq!(kind, "connection_error");
        }
        other => panic!("unexpected event: {:?}", other),
    }

    driver.set_unreachable(false);
    loop {
        if let SubscriptionEvent::Update { .. } = rx.recv().await.unwrap() {
            break;
        }
    }
    assert_eq!(manager.active_count(), 1);
}
