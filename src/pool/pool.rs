//! 连接池核心模块
//!
//! 有界连接集合 + FIFO 等待队列。池状态由一把同步锁保护，锁从不跨越 await；
//! 建连、关闭等耗时操作都在锁外进行

use parking_lot::Mutex;
use rat_logger::{debug, error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::{Connection, ConnectionState, PoolStatus, PooledConnection};
use crate::driver::{DatabaseDriver, create_driver};
use crate::error::{LiveQueryError, LiveQueryResult};
use crate::types::DatabaseConfig;

type Handoff = oneshot::Sender<LiveQueryResult<Connection>>;

/// 排队中的获取请求
struct Waiter {
    id: u64,
    sender: Handoff,
    deadline: Instant,
    timeout_ms: u64,
}

/// 受锁保护的池状态
#[derive(Default)]
struct PoolState {
    /// 按创建顺序排列的连接
    connections: Vec<Connection>,
    /// 借出中的连接 -> 借出时间
    in_use: HashMap<String, Instant>,
    /// FIFO 等待队列
    waiters: VecDeque<Waiter>,
    /// 已预留名额、正在创建的连接数
    pending_creations: usize,
    closing: bool,
}

impl PoolState {
    fn is_idle(&self, connection: &Connection) -> bool {
        !self.in_use.contains_key(connection.id()) && !connection.is_terminal()
    }

    /// 借出一个空闲连接，`ready` 决定只取 Ready 的还是只取需要重新打开的
    fn take_idle(&mut self, ready: bool) -> Option<Connection> {
        let chosen = self
            .connections
            .iter()
            .find(|c| self.is_idle(c) && (c.state() == ConnectionState::Ready) == ready)?
            .share();
        self.in_use.insert(chosen.id().to_string(), Instant::now());
        Some(chosen)
    }

    /// 移除已终止的空闲连接，释放其名额
    fn evict_terminal(&mut self) -> Vec<Connection> {
        let in_use = &self.in_use;
        let (evicted, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.connections)
            .into_iter()
            .partition(|c| !in_use.contains_key(c.id()) && c.is_terminal());
        self.connections = kept;
        evicted
    }

    /// 从集合和借出表中移除连接
    fn forget(&mut self, connection: &Connection) {
        self.in_use.remove(connection.id());
        self.connections.retain(|c| c.id() != connection.id());
    }

    fn has_room(&self, max_connections: u32) -> bool {
        self.connections.len() + self.pending_creations < max_connections as usize
    }

    fn enqueue(&mut self, id: u64, deadline: Instant, timeout_ms: u64) -> Plan {
        let (sender, receiver) = oneshot::channel();
        self.waiters.push_back(Waiter {
            id,
            sender,
            deadline,
            timeout_ms,
        });
        Plan::Wait(id, receiver)
    }

    /// 把 Ready 连接交给最早的仍在等待的请求；没有可交付的请求时返回连接
    fn hand_off(&mut self, connection: Connection) -> Option<Connection> {
        let now = Instant::now();
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.deadline <= now {
                let _ = waiter.sender.send(Err(LiveQueryError::AcquisitionTimeout {
                    timeout_ms: waiter.timeout_ms,
                }));
                continue;
            }
            match waiter.sender.send(Ok(connection.share())) {
                Ok(()) => {
                    self.in_use.insert(connection.id().to_string(), now);
                    debug!("连接已移交给等待者: 连接={}, 等待者={}", connection.id(), waiter.id);
                    return None;
                }
                Err(_) => continue,
            }
        }
        Some(connection)
    }
}

struct PoolInner {
    config: Arc<DatabaseConfig>,
    driver: Arc<dyn DatabaseDriver>,
    state: Mutex<PoolState>,
    next_connection: AtomicU64,
    next_waiter: AtomicU64,
}

/// 数据库连接池
///
/// 克隆得到同一个连接池
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("alias", &self.inner.config.alias)
            .field("driver", &self.inner.driver.name())
            .field("status", &self.status())
            .finish()
    }
}

/// 创建中的连接名额，离开作用域时归还
struct CreationSlot<'a> {
    pool: &'a ConnectionPool,
}

impl Drop for CreationSlot<'_> {
    fn drop(&mut self) {
        let mut state = self.pool.inner.state.lock();
        state.pending_creations = state.pending_creations.saturating_sub(1);
    }
}

/// 排队中的获取请求，被取消时移除自己的队列项
struct QueueEntry<'a> {
    pool: &'a ConnectionPool,
    id: u64,
    armed: bool,
}

impl Drop for QueueEntry<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.pool.inner.state.lock();
            state.waiters.retain(|w| w.id != self.id);
        }
    }
}

enum Plan {
    Reuse(Connection),
    Reopen(Connection),
    Create,
    Wait(u64, oneshot::Receiver<LiveQueryResult<Connection>>),
    Fail(LiveQueryError),
}

impl ConnectionPool {
    /// 使用数据库配置创建连接池，驱动由数据库类型决定
    pub fn new(config: DatabaseConfig) -> LiveQueryResult<Self> {
        let driver = create_driver(&config.db_type)?;
        Self::with_driver(config, driver)
    }

    /// 使用指定驱动创建连接池
    pub fn with_driver(
        config: DatabaseConfig,
        driver: Arc<dyn DatabaseDriver>,
    ) -> LiveQueryResult<Self> {
        crate::config::validate_pool_config(&config.pool)?;
        info!(
            "创建连接池: 别名={}, 驱动={}, 最小连接数={}, 最大连接数={}",
            config.alias,
            driver.name(),
            config.pool.min_connections,
            config.pool.max_connections
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                config: Arc::new(config),
                driver,
                state: Mutex::new(PoolState::default()),
                next_connection: AtomicU64::new(1),
                next_waiter: AtomicU64::new(1),
            }),
        })
    }

    /// 数据库配置
    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// 默认获取超时
    pub fn default_acquire_timeout(&self) -> Duration {
        self.inner.config.pool.acquire_timeout()
    }

    fn new_connection(&self) -> Connection {
        let seq = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        Connection::new(
            format!("{}-conn-{}", self.inner.config.alias, seq),
            Arc::clone(&self.inner.driver),
            Arc::clone(&self.inner.config),
        )
    }

    /// 预先建立最小连接数，任一连接无法就绪时关闭已建立的连接并返回错误
    pub async fn initialize(&self) -> LiveQueryResult<()> {
        let pool_config = &self.inner.config.pool;
        let count = pool_config.min_connections.min(pool_config.max_connections);
        info!("初始化连接池: 别名={}, 初始连接数={}", self.inner.config.alias, count);

        let mut created = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let connection = self.new_connection();
            if let Err(e) = connection.open().await {
                error!("初始化连接池失败: 别名={}, 错误={}", self.inner.config.alias, e);
                let _ = connection.close().await;
                close_quietly(created).await;
                return Err(e);
            }
            created.push(connection);
        }

        let surplus = {
            let mut state = self.inner.state.lock();
            if state.closing {
                Err(std::mem::take(&mut created))
            } else {
                let room = (pool_config.max_connections as usize)
                    .saturating_sub(state.connections.len() + state.pending_creations);
                let surplus = if created.len() > room {
                    created.split_off(room)
                } else {
                    Vec::new()
                };
                state.connections.extend(created);
                Ok(surplus)
            }
        };

        match surplus {
            Ok(surplus) => {
                close_quietly(surplus).await;
                info!("连接池初始化完成: 别名={}", self.inner.config.alias);
                Ok(())
            }
            Err(created) => {
                close_quietly(created).await;
                Err(LiveQueryError::PoolClosing)
            }
        }
    }

    /// 使用默认超时获取连接
    pub async fn get_connection(&self) -> LiveQueryResult<PooledConnection> {
        self.acquire(self.default_acquire_timeout()).await
    }

    /// 获取连接
    ///
    /// 已有请求在排队时新请求直接排到队尾。否则依次尝试：复用空闲的 Ready 连接、
    /// 重新打开空闲但未就绪的连接、在名额内新建连接、排队等待归还。
    /// 借出的连接总是 Ready。超时的请求会从队列中移除，调用方得到
    /// `AcquisitionTimeout`，不会再收到迟到的连接。超时为零且无法立即满足时
    /// 返回 `PoolExhausted`
    pub async fn acquire(&self, timeout: Duration) -> LiveQueryResult<PooledConnection> {
        let max_connections = self.inner.config.pool.max_connections;
        let timeout_ms = timeout.as_millis() as u64;
        let deadline = Instant::now() + timeout;

        loop {
            let (plan, evicted, refill) = {
                let mut state = self.inner.state.lock();
                if state.closing {
                    return Err(LiveQueryError::PoolClosing);
                }

                let evicted = state.evict_terminal();
                let plan = if !state.waiters.is_empty() {
                    if timeout.is_zero() {
                        Plan::Fail(LiveQueryError::PoolExhausted { max_connections })
                    } else {
                        let id = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
                        state.enqueue(id, deadline, timeout_ms)
                    }
                } else if let Some(connection) = state.take_idle(true) {
                    Plan::Reuse(connection)
                } else if let Some(connection) = state.take_idle(false) {
                    Plan::Reopen(connection)
                } else if state.has_room(max_connections) {
                    state.pending_creations += 1;
                    Plan::Create
                } else if timeout.is_zero() {
                    Plan::Fail(LiveQueryError::PoolExhausted { max_connections })
                } else {
                    let id = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
                    state.enqueue(id, deadline, timeout_ms)
                };
                // 排在前面的请求可能正等着一个刚空出来的名额
                let refill = matches!(plan, Plan::Wait(..)) && state.has_room(max_connections);
                (plan, evicted, refill)
            };

            if !evicted.is_empty() {
                debug!("移除已终止的连接: 数量={}", evicted.len());
                close_quietly(evicted).await;
            }
            if refill {
                self.spawn_fill_waiters();
            }

            match plan {
                Plan::Reuse(connection) => {
                    debug!("复用空闲连接: 连接={}", connection.id());
                    return Ok(PooledConnection::new(self.clone(), connection));
                }
                Plan::Reopen(connection) => match self.reopen(connection).await {
                    Ok(connection) => return Ok(PooledConnection::new(self.clone(), connection)),
                    Err(e) if Instant::now() >= deadline => return Err(e),
                    // 打不开的连接已被移除，换下一种方式
                    Err(_) => continue,
                },
                Plan::Create => return self.create_for_caller().await,
                Plan::Wait(id, receiver) => {
                    return self.wait_for_handoff(id, receiver, deadline, timeout_ms).await;
                }
                Plan::Fail(e) => return Err(e),
            }
        }
    }

    /// 重新打开一个已借出但未就绪的连接；失败时把它移出连接池并为等待者补建
    async fn reopen(&self, connection: Connection) -> LiveQueryResult<Connection> {
        debug!("重新打开空闲连接: 连接={}, 状态={:?}", connection.id(), connection.state());
        if let Err(e) = connection.open().await {
            warn!("空闲连接无法重新打开，已移除: 连接={}, 错误={}", connection.id(), e);
            self.inner.state.lock().forget(&connection);
            let _ = connection.close().await;
            self.spawn_fill_waiters();
            return Err(e);
        }

        if self.inner.state.lock().closing {
            return Err(LiveQueryError::PoolClosing);
        }
        Ok(connection)
    }

    async fn create_for_caller(&self) -> LiveQueryResult<PooledConnection> {
        let slot = CreationSlot { pool: self };
        let connection = self.new_connection();

        if let Err(e) = connection.open().await {
            // 建连失败的连接直接丢弃，不占用名额
            warn!("新建连接失败，已丢弃: 连接={}, 错误={}", connection.id(), e);
            let _ = connection.close().await;
            drop(slot);
            self.spawn_fill_waiters();
            return Err(e);
        }

        let closing = {
            let mut state = self.inner.state.lock();
            if state.closing {
                true
            } else {
                state.connections.push(connection.share());
                state
                    .in_use
                    .insert(connection.id().to_string(), Instant::now());
                false
            }
        };
        drop(slot);

        if closing {
            let _ = connection.close().await;
            return Err(LiveQueryError::PoolClosing);
        }

        info!(
            "新建并借出连接: 连接={}, 连接总数={}",
            connection.id(),
            self.status().total
        );
        Ok(PooledConnection::new(self.clone(), connection))
    }

    async fn wait_for_handoff(
        &self,
        id: u64,
        mut receiver: oneshot::Receiver<LiveQueryResult<Connection>>,
        deadline: Instant,
        timeout_ms: u64,
    ) -> LiveQueryResult<PooledConnection> {
        let mut entry = QueueEntry {
            pool: self,
            id,
            armed: true,
        };
        debug!("进入等待队列: 等待者={}", id);

        let outcome = tokio::time::timeout_at(deadline, &mut receiver).await;

        match outcome {
            Ok(Ok(Ok(connection))) => {
                entry.armed = false;
                Ok(PooledConnection::new(self.clone(), connection))
            }
            Ok(Ok(Err(e))) => {
                entry.armed = false;
                Err(e)
            }
            Ok(Err(_)) => {
                entry.armed = false;
                Err(LiveQueryError::PoolClosing)
            }
            Err(_) => {
                let still_queued = {
                    let mut state = self.inner.state.lock();
                    let before = state.waiters.len();
                    state.waiters.retain(|w| w.id != id);
                    state.waiters.len() != before
                };
                entry.armed = false;

                // 移交与超时竞争：移交在锁内完成，此时接收端必然已有结果
                if !still_queued {
                    if let Ok(Ok(late)) = receiver.try_recv() {
                        debug!("超时后收到连接，立即归还: 连接={}", late.id());
                        self.return_connection(late);
                    }
                }

                warn!("获取连接超时: 等待者={}, 超时={}ms", id, timeout_ms);
                Err(LiveQueryError::AcquisitionTimeout { timeout_ms })
            }
        }
    }

    /// 归还连接
    pub fn release(&self, connection: PooledConnection) {
        connection.release();
    }

    /// 归还连接
    ///
    /// Ready 连接原样交给最早的等待者，没有等待者时置为空闲；
    /// 未就绪的连接在有人等待时先在后台重新打开再移交；已终止的连接被移除
    pub(crate) fn return_connection(&self, connection: Connection) {
        enum Returned {
            Done,
            Evict(Connection),
            Reopen(Connection),
        }

        let returned = {
            let mut state = self.inner.state.lock();
            if state.in_use.remove(connection.id()).is_none() {
                // 连接池已关闭或连接已被移除
                debug!("忽略未借出的连接: 连接={}", connection.id());
                return;
            }

            if connection.is_terminal() {
                state.connections.retain(|c| c.id() != connection.id());
                Returned::Evict(connection)
            } else if connection.state() != ConnectionState::Ready && !state.waiters.is_empty() {
                // 重新打开期间仍算借出，其他请求拿不到它
                state
                    .in_use
                    .insert(connection.id().to_string(), Instant::now());
                Returned::Reopen(connection)
            } else {
                if state.hand_off(connection).is_some() {
                    debug!(
                        "连接已归还: 借出中={}, 等待中={}",
                        state.in_use.len(),
                        state.waiters.len()
                    );
                }
                Returned::Done
            }
        };

        match returned {
            Returned::Done => {}
            Returned::Evict(connection) => {
                warn!("连接已终止，从连接池移除: 连接={}", connection.id());
                let pool = self.clone();
                spawn_detached(async move {
                    let _ = connection.close().await;
                    pool.fill_waiters().await;
                });
            }
            Returned::Reopen(connection) => {
                let pool = self.clone();
                spawn_detached(async move {
                    if let Ok(connection) = pool.reopen(connection).await {
                        pool.return_connection(connection);
                    }
                });
            }
        }
    }

    fn spawn_fill_waiters(&self) {
        let pool = self.clone();
        spawn_detached(async move { pool.fill_waiters().await });
    }

    /// 名额空出后为排队中的请求补建连接
    ///
    /// 补建失败时错误交给队首的请求，和直接建连失败的调用方得到的结果一致
    async fn fill_waiters(&self) {
        let max_connections = self.inner.config.pool.max_connections;
        loop {
            {
                let mut state = self.inner.state.lock();
                if state.closing || state.waiters.is_empty() || !state.has_room(max_connections) {
                    return;
                }
                state.pending_creations += 1;
            }
            let slot = CreationSlot { pool: self };

            let connection = self.new_connection();
            if let Err(e) = connection.open().await {
                warn!("为等待者补建连接失败: 错误={}", e);
                let _ = connection.close().await;
                drop(slot);
                let front = self.inner.state.lock().waiters.pop_front();
                if let Some(waiter) = front {
                    let _ = waiter.sender.send(Err(e));
                }
                continue;
            }

            let leftover = {
                let mut state = self.inner.state.lock();
                if state.closing {
                    Some(connection)
                } else {
                    state.connections.push(connection.share());
                    state.hand_off(connection);
                    None
                }
            };
            drop(slot);

            if let Some(connection) = leftover {
                let _ = connection.close().await;
                return;
            }
        }
    }

    /// 关闭所有连接
    ///
    /// 排队中的请求收到 `PoolClosing`，之后的获取请求立即失败
    pub async fn close_all(&self) {
        info!("关闭所有连接: 别名={}", self.inner.config.alias);

        let (connections, waiters) = {
            let mut state = self.inner.state.lock();
            state.closing = true;
            state.in_use.clear();
            (
                std::mem::take(&mut state.connections),
                std::mem::take(&mut state.waiters),
            )
        };

        for waiter in waiters {
            let _ = waiter.sender.send(Err(LiveQueryError::PoolClosing));
        }

        close_quietly(connections).await;
        info!("所有连接已关闭: 别名={}", self.inner.config.alias);
    }

    /// 状态快照
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        let in_use = state
            .connections
            .iter()
            .filter(|c| state.in_use.contains_key(c.id()))
            .count();
        PoolStatus {
            total: state.connections.len(),
            idle: state.connections.len() - in_use,
            in_use,
            waiting: state.waiters.len(),
            pending_creations: state.pending_creations,
            max_connections: self.inner.config.pool.max_connections,
            closing: state.closing,
            oldest_checkout_ms: state
                .in_use
                .values()
                .min()
                .map(|since| since.elapsed().as_millis() as u64),
        }
    }
}

/// 尽力关闭一组连接，错误只记录日志
async fn close_quietly(connections: Vec<Connection>) {
    let results = futures::future::join_all(connections.iter().map(|c| c.close())).await;
    for (connection, result) in connections.iter().zip(results) {
        if let Err(e) = result {
            error!("关闭连接出错: 连接={}, 错误={}", connection.id(), e);
        }
    }
}

/// 在当前运行时中启动后台任务；没有运行时（例如在运行时外 drop）时跳过
fn spawn_detached<F>(future: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => debug!("没有可用的运行时，跳过后台任务"),
    }
}
