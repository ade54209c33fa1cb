//! 连接池类型定义模块

use serde::Serialize;
use std::ops::Deref;

use super::{Connection, ConnectionPool};

/// 池化连接 - 借出期间独占使用
///
/// 显式 `release()` 或离开作用域都会把连接归还给连接池，且只归还一次
pub struct PooledConnection {
    pool: ConnectionPool,
    connection: Option<Connection>,
}

impl PooledConnection {
    pub(crate) fn new(pool: ConnectionPool, connection: Connection) -> Self {
        Self {
            pool,
            connection: Some(connection),
        }
    }

    /// 归还连接
    pub fn release(mut self) {
        self.give_back();
    }

    fn give_back(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.return_connection(connection);
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // connection 只在 release/drop 时取走，此后不会再被访问
        self.connection
            .as_ref()
            .expect("池化连接已归还")
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection", &self.connection)
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.give_back();
    }
}

/// 连接池状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// 连接总数
    pub total: usize,
    /// 空闲连接数
    pub idle: usize,
    /// 借出中的连接数
    pub in_use: usize,
    /// 排队等待的请求数
    pub waiting: usize,
    /// 正在创建的连接数
    pub pending_creations: usize,
    /// 最大连接数
    pub max_connections: u32,
    /// 是否正在关闭
    pub closing: bool,
    /// 最久一次借出已持续的毫秒数
    pub oldest_checkout_ms: Option<u64>,
}
