//! 单个数据库连接
//!
//! 包装一个数据库会话，负责 Disconnected → Connecting → Ready / Failed 状态机
//! 以及有界的自动重连

use parking_lot::Mutex;
use rat_logger::{debug, error, info, warn};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::driver::{DatabaseDriver, DatabaseSession, RowSink};
use crate::error::{LiveQueryError, LiveQueryResult};
use crate::i18n::tf;
use crate::operation::{OperationTarget, Parameter};
use crate::types::DatabaseConfig;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// 未连接
    Disconnected,
    /// 正在连接
    Connecting,
    /// 可用
    Ready,
    /// 连接失败（可能仍有待执行的重试）
    Failed,
}

/// 受同步锁保护的控制状态，锁从不跨越 await
struct Control {
    state: ConnectionState,
    /// 连续失败次数
    failures: u32,
    /// close() 之后不再自动重试，也不能重新打开
    closed: bool,
    /// 至多一个待执行的重试任务
    retry_task: Option<JoinHandle<()>>,
}

struct ConnectionInner {
    id: String,
    driver: Arc<dyn DatabaseDriver>,
    config: Arc<DatabaseConfig>,
    max_retries: u32,
    retry_interval: Duration,
    control: Mutex<Control>,
    /// 会话锁同时串行化建连和执行
    session: tokio::sync::Mutex<Option<Box<dyn DatabaseSession>>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if let Some(task) = self.control.get_mut().retry_task.take() {
            task.abort();
        }
    }
}

/// 数据库连接句柄
///
/// 连接池之外拿不到额外的句柄，借用方只能通过 `PooledConnection` 使用它，
/// 归还之后不会留下可继续执行的副本：
///
/// ```compile_fail
/// use rat_livequery::{Connection, PooledConnection};
///
/// fn keep(pooled: &PooledConnection) -> Connection {
///     (**pooled).clone()
/// }
/// ```
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let control = self.inner.control.lock();
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &control.state)
            .field("failures", &control.failures)
            .field("max_retries", &self.inner.max_retries)
            .field("closed", &control.closed)
            .finish()
    }
}

impl Connection {
    /// 创建一个未连接的连接
    pub fn new(
        id: impl Into<String>,
        driver: Arc<dyn DatabaseDriver>,
        config: Arc<DatabaseConfig>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let max_retries = config.pool.max_retries;
        let retry_interval = config.pool.retry_interval();
        Self {
            inner: Arc::new(ConnectionInner {
                id: id.into(),
                driver,
                config,
                max_retries,
                retry_interval,
                control: Mutex::new(Control {
                    state: ConnectionState::Disconnected,
                    failures: 0,
                    closed: false,
                    retry_task: None,
                }),
                session: tokio::sync::Mutex::new(None),
                state_tx,
            }),
        }
    }

    /// 指向同一连接的句柄，仅供连接池内部登记和移交
    pub(crate) fn share(&self) -> Connection {
        Connection {
            inner: Arc::clone(&self.inner),
        }
    }

    /// 连接标识
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// 当前状态
    pub fn state(&self) -> ConnectionState {
        self.inner.control.lock().state
    }

    /// 订阅状态变化
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// 连续失败次数
    pub fn failure_count(&self) -> u32 {
        self.inner.control.lock().failures
    }

    /// 是否有待执行的重试
    pub fn has_pending_retry(&self) -> bool {
        self.inner.control.lock().retry_task.is_some()
    }

    /// 是否已关闭
    pub fn is_closed(&self) -> bool {
        self.inner.control.lock().closed
    }

    /// 是否已终止（重试次数用尽或已关闭），只能由连接池重新创建
    pub fn is_terminal(&self) -> bool {
        let control = self.inner.control.lock();
        control.closed || self.exhausted(&control)
    }

    fn exhausted(&self, control: &Control) -> bool {
        control.state == ConnectionState::Failed && control.failures >= self.inner.max_retries
    }

    /// 打开连接
    ///
    /// 已就绪时直接返回；失败时安排一次延迟重试并立即返回错误；
    /// 重试次数已用尽的连接不再尝试
    pub async fn open(&self) -> LiveQueryResult<()> {
        let mut session = self.inner.session.lock().await;

        {
            let mut control = self.inner.control.lock();
            if control.closed {
                return Err(crate::quick_error!(connection, format!("连接 {} 已关闭", self.inner.id)));
            }
            if control.state == ConnectionState::Ready && session.is_some() {
                return Ok(());
            }
            if self.exhausted(&control) {
                return Err(crate::quick_error!(
                    connection,
                    tf(
                        "error.retries_exhausted",
                        &[
                            ("id", self.inner.id.as_str()),
                            ("retries", self.inner.max_retries.to_string().as_str()),
                        ],
                    )
                ));
            }
            self.transition(&mut control, ConnectionState::Connecting);
        }

        info!(
            "尝试连接数据库: 连接={}, 别名={}, 类型={}",
            self.inner.id,
            self.inner.config.alias,
            self.inner.config.db_type.as_str()
        );

        let result = self.inner.driver.connect(&self.inner.config).await;

        let orphan = {
            let mut control = self.inner.control.lock();
            match result {
                Ok(new_session) if control.closed => Some(new_session),
                Ok(new_session) => {
                    *session = Some(new_session);
                    control.failures = 0;
                    if let Some(task) = control.retry_task.take() {
                        task.abort();
                    }
                    self.transition(&mut control, ConnectionState::Ready);
                    info!("数据库连接成功: 连接={}, 别名={}", self.inner.id, self.inner.config.alias);
                    return Ok(());
                }
                Err(e) => {
                    error!(
                        "数据库连接失败: 连接={}, 第{}次尝试, 错误={}",
                        self.inner.id,
                        control.failures + 1,
                        e
                    );
                    self.record_failure(&mut control, &e);
                    return Err(e);
                }
            }
        };

        // 建连期间连接被关闭：丢弃新会话
        if let Some(mut orphan) = orphan {
            if let Err(e) = orphan.close().await {
                debug!("关闭多余会话失败: 连接={}, 错误={}", self.inner.id, e);
            }
        }
        Err(crate::quick_error!(connection, format!("连接 {} 已关闭", self.inner.id)))
    }

    /// 关闭连接，任意状态下都可调用，之后不再自动重试
    pub async fn close(&self) -> LiveQueryResult<()> {
        {
            let mut control = self.inner.control.lock();
            control.closed = true;
            if let Some(task) = control.retry_task.take() {
                task.abort();
            }
        }

        let mut session = self.inner.session.lock().await;
        let result = match session.take() {
            Some(mut active) => {
                info!("关闭数据库连接: 连接={}, 别名={}", self.inner.id, self.inner.config.alias);
                active.close().await
            }
            None => Ok(()),
        };

        {
            let mut control = self.inner.control.lock();
            self.transition(&mut control, ConnectionState::Disconnected);
        }

        if let Err(e) = &result {
            warn!("关闭数据库连接出错: 连接={}, 错误={}", self.inner.id, e);
        }
        result
    }

    /// 报告一次连接层故障：Ready 连接转入 Failed 并安排有界重试
    pub async fn mark_failed(&self, cause: &LiveQueryError) {
        let mut session = self.inner.session.lock().await;
        let stale = {
            let mut control = self.inner.control.lock();
            if control.closed || control.state != ConnectionState::Ready {
                return;
            }
            warn!("数据库连接出错: 连接={}, 原因={}", self.inner.id, cause);
            self.record_failure(&mut control, cause);
            session.take()
        };

        if let Some(mut stale) = stale {
            if let Err(e) = stale.close().await {
                debug!("关闭失效会话失败: 连接={}, 错误={}", self.inner.id, e);
            }
        }
    }

    /// 在当前会话上执行操作，调用方必须持有该连接的借出
    pub(crate) async fn execute(
        &self,
        target: &OperationTarget,
        params: &[Parameter],
        sink: &mut RowSink<'_>,
    ) -> LiveQueryResult<u64> {
        let mut session = self.inner.session.lock().await;
        match session.as_mut() {
            Some(active) => active.execute(target, params, sink).await,
            None => Err(crate::quick_error!(
                connection,
                format!("连接 {} 未就绪", self.inner.id)
            )),
        }
    }

    fn transition(&self, control: &mut Control, next: ConnectionState) {
        let previous = control.state;
        if previous == next {
            return;
        }
        control.state = next;
        self.inner.state_tx.send_replace(next);
        debug!("连接状态变化: 连接={}, {:?} -> {:?}", self.inner.id, previous, next);
    }

    fn record_failure(&self, control: &mut Control, cause: &LiveQueryError) {
        control.failures = control.failures.saturating_add(1);
        self.transition(control, ConnectionState::Failed);

        if control.closed {
            return;
        }

        if control.failures < self.inner.max_retries {
            warn!(
                "安排数据库重连: 连接={}, 第{}次/最多{}次, {}ms后重试",
                self.inner.id,
                control.failures,
                self.inner.max_retries,
                self.inner.retry_interval.as_millis()
            );
            self.schedule_retry(control);
        } else {
            error!(
                "已达到最大重试次数: 连接={}, 最大重试次数={}, 原因={}",
                self.inner.id, self.inner.max_retries, cause
            );
        }
    }

    /// 安排一次延迟重试；已有待执行的重试时不重复安排
    fn schedule_retry(&self, control: &mut Control) {
        if control.retry_task.is_some() {
            return;
        }

        let weak: Weak<ConnectionInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.retry_interval;
        control.retry_task = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            let connection = Connection { inner };
            {
                let mut control = connection.inner.control.lock();
                control.retry_task = None;
                if control.closed {
                    return;
                }
            }

            debug!("执行自动重连: 连接={}", connection.inner.id);
            // 失败时 open 会自行安排下一次重试
            let _ = connection.open().await;
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use crate::types::{ConnectionConfig, DatabaseType, PoolConfig};

    fn config(max_retries: u32) -> Arc<DatabaseConfig> {
        Arc::new(DatabaseConfig {
            db_type: DatabaseType::SQLite,
            connection: ConnectionConfig::SQLite {
                path: ":memory:".to_string(),
                create_if_missing: true,
            },
            pool: PoolConfig {
                max_retries,
                ..PoolConfig::default()
            },
            alias: "test".to_string(),
        })
    }

    fn connection(driver: &MemoryDriver, max_retries: u32) -> Connection {
        Connection::new("test-conn-1", Arc::new(driver.clone()), config(max_retries))
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_is_idempotent() {
        let driver = MemoryDriver::new();
        let conn = connection(&driver, 5);
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        conn.open().await.unwrap();
        conn.open().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(driver.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_open_schedules_single_retry() {
        let driver = MemoryDriver::new();
        driver.fail_next_connects(1);
        let conn = connection(&driver, 5);

        assert!(conn.open().await.is_err());
        assert_eq!(conn.state(), ConnectionState::Failed);
        assert!(conn.has_pending_retry());

        // 失败后的再次 open 不会叠加重试
        driver.fail_next_connects(1);
        assert!(conn.open().await.is_err());
        assert_eq!(driver.connect_attempts(), 2);
        assert!(conn.has_pending_retry());

        tokio::time::sleep(Duration::from_millis(5001)).await;
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(driver.connect_attempts(), 3);
        assert_eq!(conn.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_stop_after_bound() {
        let driver = MemoryDriver::new();
        driver.set_unreachable(true);
        let conn = connection(&driver, 5);

        assert!(conn.open().await.is_err());
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(5001)).await;
        }

        assert_eq!(driver.connect_attempts(), 5);
        assert!(conn.is_terminal());
        assert!(!conn.has_pending_retry());

        // 终止状态下 open 不再尝试
        assert!(conn.open().await.is_err());
        assert_eq!(driver.connect_attempts(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_retry() {
        let driver = MemoryDriver::new();
        driver.fail_next_connects(1);
        let conn = connection(&driver, 5);

        assert!(conn.open().await.is_err());
        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.has_pending_retry());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(driver.connect_attempts(), 1);
        assert!(conn.open().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_failed_reconnects() {
        let driver = MemoryDriver::new();
        let conn = connection(&driver, 5);
        conn.open().await.unwrap();
        assert_eq!(driver.open_sessions(), 1);

        let mut states = conn.watch_state();
        conn.mark_failed(&crate::quick_error!(connection, "socket reset")).await;
        assert_eq!(*states.borrow_and_update(), ConnectionState::Failed);
        assert_eq!(driver.open_sessions(), 0);

        tokio::time::sleep(Duration::from_millis(5001)).await;
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(driver.open_sessions(), 1);
    }
}
