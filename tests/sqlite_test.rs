//! SQLite 文件数据库上的端到端测试
#![cfg(feature = "sqlite-support")]

use rat_livequery::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn file_config(path: &std::path::Path) -> DatabaseConfig {
    DatabaseConfig::builder()
        .alias("sqlite_file")
        .sqlite(path.to_string_lossy(), true)
        .pool(
            PoolConfig::builder()
                .min_connections(1)
                .max_connections(2)
                .acquire_timeout_ms(2000)
                .retry_interval_ms(200)
                .max_retries(3)
                .build()
                .unwrap(),
        )
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_sqlite_file_end_to_end() {
    println!("🔍 测试 SQLite 文件数据库的查询与订阅");

    let dir = tempfile::tempdir().unwrap();
    let pool = ConnectionPool::new(file_config(&dir.path().join("livequery.db"))).unwrap();
    pool.initialize().await.unwrap();
    assert_eq!(pool.status().total, 1);

    let executor = OperationExecutor::new(pool.clone());
    let setup = [
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, dept INTEGER NOT NULL, status TEXT NOT NULL)",
        "INSERT INTO orders (dept, status) VALUES (4, 'open'), (4, 'closed'), (7, 'open')",
    ];
    for sql in setup {
        executor
            .run(&OperationRequest::query(sql).build().unwrap())
            .await
            .unwrap();
    }

    let request = OperationRequest::query(
        "SELECT id, status FROM orders WHERE dept = @dept AND status = @status ORDER BY id",
    )
    .typed_param("dept", ParamType::Int, 4)
    .param("status", "open")
    .build()
    .unwrap();

    let manager = SubscriptionManager::new(executor.clone(), SubscriptionConfig::default());
    let once = manager.execute_once(&request).await.unwrap();
    assert_eq!(once.row_count, 1);
    assert_eq!(once.rows[0].get("status"), Some(&DataValue::String("open".into())));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = manager.subscribe("sqlite-client", request, Some(200), Arc::new(tx)).unwrap();
    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.subscription_id(), id);

    executor
        .run(
            &OperationRequest::query("INSERT INTO orders (dept, status) VALUES (4, 'open')")
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    // 新插入的行出现在之后的推送里
    let mut grown = false;
    for _ in 0..20 {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        if let SubscriptionEvent::Update { rows, .. } = event {
            if rows.len() == 2 {
                grown = true;
                break;
            }
        }
    }
    assert!(grown);

    manager.shutdown().await;
    pool.close_all().await;
    assert_eq!(pool.status().total, 0);
    println!("✅ SQLite 端到端流程正常");
}

#[tokio::test]
async fn test_missing_sqlite_file_without_create_fails_initialize() {
    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig::builder()
        .alias("missing")
        .sqlite(dir.path().join("absent.db").to_string_lossy(), false)
        .pool(PoolConfig {
            min_connections: 1,
            ..PoolConfig::default()
        })
        .build()
        .unwrap();

    let pool = ConnectionPool::new(config).unwrap();
    assert!(pool.initialize().await.is_err());
    assert_eq!(pool.status().total, 0);
}
