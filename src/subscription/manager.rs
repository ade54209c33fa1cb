//! 订阅管理器
//!
//! 每个订阅拥有一个轮询任务：订阅后立即执行一次，随后按间隔周期执行并推送结果。
//! 订阅表由一把互斥锁保护，投递在锁内进行，因此取消与投递不会交错

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rat_logger::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::SubscriptionConfig;
use crate::error::LiveQueryResult;
use crate::executor::OperationExecutor;
use crate::i18n::t;
use crate::operation::{OperationRequest, OperationResult};

use super::types::*;

/// 关闭时等待轮询任务自行退出的时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// 订阅记录，独占其轮询任务
struct Record {
    subscriber: SubscriberId,
    request: OperationRequest,
    interval: Duration,
    cancel: watch::Sender<SubscriptionState>,
    task: JoinHandle<()>,
    created_at: DateTime<Utc>,
}

impl Record {
    /// 通知轮询任务停止，不等待正在执行的轮询
    fn cancel(&self) {
        self.cancel.send_replace(SubscriptionState::Cancelled);
    }
}

struct ManagerInner {
    executor: OperationExecutor,
    config: SubscriptionConfig,
    subscriptions: Mutex<HashMap<SubscriptionId, Record>>,
    closed: AtomicBool,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        for (_, record) in self.subscriptions.get_mut().drain() {
            record.cancel();
            record.task.abort();
        }
    }
}

/// 订阅管理器
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("active", &self.active_count())
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl SubscriptionManager {
    pub fn new(executor: OperationExecutor, config: SubscriptionConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                executor,
                config,
                subscriptions: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// 注册订阅并启动轮询
    ///
    /// 必须在 tokio 运行时中调用。`interval_ms` 为空时使用配置的默认间隔
    pub fn subscribe(
        &self,
        subscriber: impl Into<SubscriberId>,
        request: OperationRequest,
        interval_ms: Option<u64>,
        sink: Arc<dyn SubscriptionSink>,
    ) -> LiveQueryResult<SubscriptionId> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(crate::quick_error!(operation, t("error.manager_closed")));
        }
        request.validate()?;
        let interval = self.inner.config.resolve_interval(interval_ms)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| crate::quick_error!(config, format!("订阅需要在 tokio 运行时中创建: {}", e)))?;

        let subscriber = subscriber.into();
        let id = SubscriptionId::new();
        let (cancel, cancelled) = watch::channel(SubscriptionState::Active);

        // 持锁启动任务，保证首次投递时记录已经存在
        let mut subscriptions = self.inner.subscriptions.lock();
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(crate::quick_error!(operation, t("error.manager_closed")));
        }
        let task = runtime.spawn(poll_loop(
            Arc::downgrade(&self.inner),
            id,
            request.clone(),
            interval,
            sink,
            cancelled,
        ));

        info!(
            "创建订阅: 订阅={}, 订阅者={}, 目标={}, 间隔={}ms",
            id,
            subscriber,
            request.target().log_preview(),
            interval.as_millis()
        );

        subscriptions.insert(
            id,
            Record {
                subscriber,
                request,
                interval,
                cancel,
                task,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    /// 取消订阅，重复取消不是错误
    ///
    /// 返回该订阅此前是否存在
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.subscriptions.lock().remove(&id);
        match removed {
            Some(record) => {
                record.cancel();
                info!("取消订阅: 订阅={}, 订阅者={}", id, record.subscriber);
                true
            }
            None => {
                debug!("取消不存在的订阅: {}", id);
                false
            }
        }
    }

    /// 订阅者断开时取消其全部订阅，返回取消的数量
    pub fn on_subscriber_disconnect(&self, subscriber: &str) -> usize {
        let removed: Vec<(SubscriptionId, Record)> = {
            let mut subscriptions = self.inner.subscriptions.lock();
            let ids: Vec<SubscriptionId> = subscriptions
                .iter()
                .filter(|(_, record)| record.subscriber == subscriber)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| subscriptions.remove(&id).map(|record| (id, record)))
                .collect()
        };

        for (_, record) in &removed {
            record.cancel();
        }

        if !removed.is_empty() {
            info!("订阅者断开: 订阅者={}, 取消订阅数={}", subscriber, removed.len());
        }
        removed.len()
    }

    /// 一次性执行操作，不创建订阅
    pub async fn execute_once(&self, request: &OperationRequest) -> LiveQueryResult<OperationResult> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(crate::quick_error!(operation, t("error.manager_closed")));
        }
        request.validate()?;
        self.inner.executor.run(request).await
    }

    /// 订阅者当前的订阅快照，按创建时间排序
    pub fn list(&self, subscriber: &str) -> Vec<SubscriptionInfo> {
        let subscriptions = self.inner.subscriptions.lock();
        let mut infos: Vec<SubscriptionInfo> = subscriptions
            .iter()
            .filter(|(_, record)| record.subscriber == subscriber)
            .map(|(id, record)| SubscriptionInfo {
                id: *id,
                subscriber: record.subscriber.clone(),
                target: record.request.target().text().to_string(),
                interval_ms: record.interval.as_millis() as u64,
                created_at: record.created_at,
            })
            .collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    /// 活跃订阅数
    pub fn active_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    /// 停止全部订阅，之后的订阅请求直接失败
    ///
    /// 正在执行的轮询有一段宽限时间完成，超时后强制中止
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let records: Vec<Record> = self.inner.subscriptions.lock().drain().map(|(_, r)| r).collect();
        info!("关闭订阅管理器: 取消订阅数={}", records.len());

        let mut tasks = Vec::with_capacity(records.len());
        for record in records {
            record.cancel();
            tasks.push(record.task);
        }

        let drained = tokio::time::timeout(
            SHUTDOWN_GRACE,
            futures::future::join_all(tasks.iter_mut()),
        )
        .await;
        if drained.is_err() {
            warn!("部分订阅轮询未在 {}s 内结束，强制中止", SHUTDOWN_GRACE.as_secs());
            for task in &tasks {
                task.abort();
            }
        }
    }
}

/// 单个订阅的轮询任务
///
/// 只持有管理器的弱引用，管理器释放后任务自然退出
async fn poll_loop(
    manager: Weak<ManagerInner>,
    id: SubscriptionId,
    request: OperationRequest,
    interval: Duration,
    sink: Arc<dyn SubscriptionSink>,
    mut cancelled: watch::Receiver<SubscriptionState>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // 首次数据不等第一个间隔
    if poll_once(&manager, id, &request, sink.as_ref(), &cancelled).await {
        loop {
            tokio::select! {
                biased;
                changed = cancelled.changed() => {
                    if changed.is_err() || *cancelled.borrow() == SubscriptionState::Cancelled {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if !poll_once(&manager, id, &request, sink.as_ref(), &cancelled).await {
                        break;
                    }
                }
            }
        }
    }

    debug!("订阅轮询结束: 订阅={}", id);
}

/// 执行一次轮询并投递，返回是否继续
async fn poll_once(
    manager: &Weak<ManagerInner>,
    id: SubscriptionId,
    request: &OperationRequest,
    sink: &dyn SubscriptionSink,
    cancelled: &watch::Receiver<SubscriptionState>,
) -> bool {
    if *cancelled.borrow() == SubscriptionState::Cancelled {
        return false;
    }
    let Some(executor) = manager.upgrade().map(|inner| inner.executor.clone()) else {
        return false;
    };

    let event = match executor.run(request).await {
        Ok(result) => SubscriptionEvent::Update {
            subscription_id: id,
            timestamp: Utc::now(),
            rows: result.rows,
        },
        Err(e) => {
            warn!("订阅轮询失败，下个周期继续: 订阅={}, 错误={}", id, e);
            SubscriptionEvent::Error {
                subscription_id: id,
                kind: e.kind().to_string(),
                cause: e.to_string(),
            }
        }
    };

    let Some(inner) = manager.upgrade() else {
        return false;
    };
    let mut subscriptions = inner.subscriptions.lock();
    // 轮询期间订阅可能已被取消，此时丢弃结果
    if !subscriptions.contains_key(&id) {
        return false;
    }
    match sink.deliver(event) {
        Ok(()) => true,
        Err(SinkClosed) => {
            if let Some(record) = subscriptions.remove(&id) {
                record.cancel();
                warn!("订阅者已断开，自动取消订阅: 订阅={}, 订阅者={}", id, record.subscriber);
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MemoryDriver, MemoryResponse};
    use crate::operation::Row;
    use crate::pool::ConnectionPool;
    use crate::types::{ConnectionConfig, DataValue, DatabaseConfig, DatabaseType, PoolConfig};
    use tokio::sync::mpsc;

    fn row(n: i64) -> Row {
        [("n".to_string(), DataValue::Int(n))].into_iter().collect()
    }

    fn manager(driver: &MemoryDriver) -> SubscriptionManager {
        let config = DatabaseConfig {
            db_type: DatabaseType::SQLite,
            connection: ConnectionConfig::SQLite {
                path: ":memory:".to_string(),
                create_if_missing: true,
            },
            pool: PoolConfig {
                min_connections: 0,
                max_connections: 4,
                ..PoolConfig::default()
            },
            alias: "subscription".to_string(),
        };
        let pool = ConnectionPool::with_driver(config, Arc::new(driver.clone())).unwrap();
        SubscriptionManager::new(OperationExecutor::new(pool), SubscriptionConfig::default())
    }

    fn channel() -> (Arc<dyn SubscriptionSink>, mpsc::UnboundedReceiver<SubscriptionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(tx), rx)
    }

    fn query() -> OperationRequest {
        OperationRequest::query("SELECT n FROM counters").build().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_update_then_periodic() {
        let driver = MemoryDriver::new().with_rows("SELECT n FROM counters", vec![row(1)]);
        let manager = manager(&driver);
        let (sink, mut rx) = channel();

        let started = Instant::now();
        let id = manager.subscribe("client-1", query(), Some(1000), sink).unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.subscription_id(), id);
        assert!(started.elapsed() < Duration::from_millis(1000));

        let second = rx.recv().await.unwrap();
        assert!(matches!(second, SubscriptionEvent::Update { ref rows, .. } if rows == &vec![row(1)]));
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert_eq!(manager.list("client-1").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_stops_delivery() {
        let driver = MemoryDriver::new();
        let manager = manager(&driver);
        let (sink, mut rx) = channel();

        let id = manager.subscribe("client-1", query(), Some(500), sink).unwrap();
        rx.recv().await.unwrap();

        assert!(manager.unsubscribe(id));
        assert!(!manager.unsubscribe(id));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_removes_only_that_subscriber() {
        let driver = MemoryDriver::new();
        let manager = manager(&driver);
        let (sink_a, _rx_a) = channel();
        let (sink_b, mut rx_b) = channel();

        manager.subscribe("a", query(), None, sink_a.clone()).unwrap();
        manager.subscribe("a", query(), Some(200), sink_a).unwrap();
        manager.subscribe("b", query(), Some(200), sink_b).unwrap();

        assert_eq!(manager.on_subscriber_disconnect("a"), 2);
        assert_eq!(manager.on_subscriber_disconnect("a"), 0);
        assert!(manager.list("a").is_empty());
        assert_eq!(manager.active_count(), 1);

        rx_b.recv().await.unwrap();
        rx_b.recv().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_in_flight_during_disconnect_is_dropped() {
        let driver = MemoryDriver::new().with_latency(Duration::from_millis(300));
        let manager = manager(&driver);
        let (sink, mut rx) = channel();

        manager.subscribe("slow", query(), Some(1000), sink).unwrap();
        // 首次轮询仍在执行
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.on_subscriber_disconnect("slow"), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.active_count(), 0);
        assert_eq!(manager.inner.executor.pool().status().in_use, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_delivered_and_polling_continues() {
        let driver = MemoryDriver::new();
        driver.set_response(
            "SELECT n FROM counters",
            MemoryResponse::Failure {
                rows_before: vec![],
                message: "表不存在".to_string(),
            },
        );
        let manager = manager(&driver);
        let (sink, mut rx) = channel();

        manager.subscribe("client-1", query(), Some(100), sink).unwrap();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SubscriptionEvent::Error { ref kind, .. } if kind == "operation_error"));

        driver.set_response("SELECT n FROM counters", MemoryResponse::Rows(vec![row(7)]));
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SubscriptionEvent::Update { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_sink_cancels_subscription() {
        let driver = MemoryDriver::new();
        let manager = manager(&driver);
        let (sink, rx) = channel();
        drop(rx);

        manager.subscribe("gone", query(), Some(100), sink).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_validation_and_shutdown() {
        let driver = MemoryDriver::new();
        let manager = manager(&driver);
        let (sink, _rx) = channel();

        let err = manager.subscribe("c", query(), Some(10), sink.clone()).unwrap_err();
        assert_eq!(err.kind(), "validation_error");

        manager.subscribe("c", query(), Some(100), sink.clone()).unwrap();
        manager.shutdown().await;
        assert_eq!(manager.active_count(), 0);
        assert!(manager.subscribe("c", query(), Some(100), sink).is_err());
        assert!(manager.execute_once(&query()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_once() {
        let driver = MemoryDriver::new().with_rows("SELECT n FROM counters", vec![row(1), row(2)]);
        let manager = manager(&driver);

        let result = manager.execute_once(&query()).await.unwrap();
        assert_eq!(result.rows.len(), 2);
        assert_eq!(manager.active_count(), 0);
    }
}
