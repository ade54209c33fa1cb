//! 数据库驱动模块
//!
//! 外部数据库协议的抽象：connect(config) -> session，
//! session.execute(target, params) 按到达顺序推送结果行，最后返回终止状态

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::LiveQueryResult;
use crate::operation::{OperationTarget, Parameter, Row};
use crate::types::{DatabaseConfig, DatabaseType};

pub mod memory;
pub(crate) mod placeholder;
#[cfg(any(
    feature = "sqlite-support",
    feature = "postgres-support",
    feature = "mysql-support"
))]
pub mod sqlx_driver;

pub use memory::{MemoryDriver, MemoryResponse};
#[cfg(any(
    feature = "sqlite-support",
    feature = "postgres-support",
    feature = "mysql-support"
))]
pub use sqlx_driver::SqlxDriver;

/// 行接收器：驱动每收到一行调用一次
pub type RowSink<'a> = dyn FnMut(Row) + Send + 'a;

/// 数据库驱动 - 负责建立会话
#[async_trait]
pub trait DatabaseDriver: Send + Sync + 'static {
    /// 驱动名称（日志用）
    fn name(&self) -> &'static str;

    /// 建立一个新的数据库会话
    async fn connect(&self, config: &DatabaseConfig) -> LiveQueryResult<Box<dyn DatabaseSession>>;
}

/// 单个数据库会话
///
/// 同一会话上不会有两个操作并发执行（由连接池的独占借出保证）
#[async_trait]
pub trait DatabaseSession: Send {
    /// 执行查询或存储过程
    ///
    /// 每到达一行就推送给 `sink`；返回值是终止状态：成功时为行数，
    /// 失败时调用方丢弃已推送的行。连接层错误应返回 `ConnectionError`
    async fn execute(
        &mut self,
        target: &OperationTarget,
        params: &[Parameter],
        sink: &mut RowSink<'_>,
    ) -> LiveQueryResult<u64>;

    /// 关闭会话，释放底层连接
    async fn close(&mut self) -> LiveQueryResult<()>;
}

/// 根据数据库类型创建驱动
pub fn create_driver(db_type: &DatabaseType) -> LiveQueryResult<Arc<dyn DatabaseDriver>> {
    match db_type {
        #[cfg(feature = "sqlite-support")]
        DatabaseType::SQLite => Ok(Arc::new(SqlxDriver::new(*db_type))),
        #[cfg(feature = "postgres-support")]
        DatabaseType::PostgreSQL => Ok(Arc::new(SqlxDriver::new(*db_type))),
        #[cfg(feature = "mysql-support")]
        DatabaseType::MySQL => Ok(Arc::new(SqlxDriver::new(*db_type))),
        #[allow(unreachable_patterns)]
        other => Err(crate::quick_error!(
            config,
            crate::i18n::tf("error.driver_not_enabled", &[("db_type", other.as_str())])
        )),
    }
}
