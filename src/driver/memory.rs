//! 内存驱动
//!
//! 按目标文本预置结果的脚本化驱动，不依赖任何数据库。
//! 用于单元测试、集成测试以及没有启用 sqlx 特性时的演示

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{DatabaseDriver, DatabaseSession, RowSink};
use crate::error::LiveQueryResult;
use crate::operation::{OperationTarget, Parameter, Row};
use crate::types::DatabaseConfig;

/// 预置的执行结果
#[derive(Debug, Clone)]
pub enum MemoryResponse {
    /// 逐行返回，成功结束
    Rows(Vec<Row>),
    /// 先返回若干行，然后以执行错误结束
    Failure { rows_before: Vec<Row>, message: String },
    /// 连接在执行过程中断开
    ConnectionLost(String),
}

#[derive(Debug, Default)]
struct MemoryState {
    responses: HashMap<String, MemoryResponse>,
    failing_connects: u32,
    always_fail_connect: bool,
    remaining_successes: Option<u32>,
    connect_attempts: u32,
    failing_closes: u32,
    close_calls: u32,
    open_sessions: usize,
    latency: Duration,
    executions: Vec<(OperationTarget, Vec<Parameter>)>,
}

/// 脚本化的内存驱动，克隆后共享同一份脚本和计数
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为目标文本（查询文本或存储过程名）预置结果行
    pub fn with_rows(self, target: impl Into<String>, rows: Vec<Row>) -> Self {
        self.set_response(target, MemoryResponse::Rows(rows));
        self
    }

    /// 为目标文本预置执行错误
    pub fn with_error(self, target: impl Into<String>, message: impl Into<String>) -> Self {
        self.set_response(
            target,
            MemoryResponse::Failure {
                rows_before: Vec::new(),
                message: message.into(),
            },
        );
        self
    }

    /// 每次执行前的模拟延迟
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    /// 设置或替换某个目标的结果
    pub fn set_response(&self, target: impl Into<String>, response: MemoryResponse) {
        self.state.lock().responses.insert(target.into(), response);
    }

    /// 让接下来 `count` 次建连失败
    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().failing_connects = count;
    }

    /// 让所有建连都失败（数据库不可达）
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().always_fail_connect = unreachable;
    }

    /// 之后只允许 `count` 次建连成功，其余都失败
    pub fn allow_connects(&self, count: u32) {
        self.state.lock().remaining_successes = Some(count);
    }

    /// 让接下来 `count` 次关闭会话报错，会话本身仍然结束
    pub fn fail_next_closes(&self, count: u32) {
        self.state.lock().failing_closes = count;
    }

    /// 累计的会话关闭次数（含报错的）
    pub fn close_calls(&self) -> u32 {
        self.state.lock().close_calls
    }

    /// 累计的建连尝试次数
    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    /// 当前未关闭的会话数
    pub fn open_sessions(&self) -> usize {
        self.state.lock().open_sessions
    }

    /// 已执行的操作记录
    pub fn executions(&self) -> Vec<(OperationTarget, Vec<Parameter>)> {
        self.state.lock().executions.clone()
    }
}

#[async_trait]
impl DatabaseDriver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, config: &DatabaseConfig) -> LiveQueryResult<Box<dyn DatabaseSession>> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;

        if state.always_fail_connect {
            return Err(crate::quick_error!(
                connection,
                format!("无法连接到内存数据库 {}", config.alias)
            ));
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(crate::quick_error!(
                connection,
                format!("无法连接到内存数据库 {}（模拟故障）", config.alias)
            ));
        }

        match state.remaining_successes {
            Some(0) => {
                return Err(crate::quick_error!(
                    connection,
                    format!("内存数据库 {} 拒绝新连接", config.alias)
                ));
            }
            Some(n) => state.remaining_successes = Some(n - 1),
            None => {}
        }

        state.open_sessions += 1;
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            open: true,
        }))
    }
}

struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
    open: bool,
}

#[async_trait]
impl DatabaseSession for MemorySession {
    async fn execute(
        &mut self,
        target: &OperationTarget,
        params: &[Parameter],
        sink: &mut RowSink<'_>,
    ) -> LiveQueryResult<u64> {
        if !self.open {
            return Err(crate::quick_error!(connection, "会话已关闭"));
        }

        let (latency, response) = {
            let mut state = self.state.lock();
            state.executions.push((target.clone(), params.to_vec()));
            (state.latency, state.responses.get(target.text()).cloned())
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match response {
            None => Ok(0),
            Some(MemoryResponse::Rows(rows)) => {
                let count = rows.len() as u64;
                for row in rows {
                    sink(row);
                }
                Ok(count)
            }
            Some(MemoryResponse::Failure { rows_before, message }) => {
                for row in rows_before {
                    sink(row);
                }
                Err(crate::quick_error!(operation, message))
            }
            Some(MemoryResponse::ConnectionLost(message)) => {
                self.close().await?;
                Err(crate::quick_error!(connection, message))
            }
        }
    }

    async fn close(&mut self) -> LiveQueryResult<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;

        let mut state = self.state.lock();
        state.open_sessions = state.open_sessions.saturating_sub(1);
        state.close_calls += 1;
        if state.failing_closes > 0 {
            state.failing_closes -= 1;
            return Err(crate::quick_error!(connection, "关闭会话时连接已断开（模拟故障）"));
        }
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if self.open {
            let mut state = self.state.lock();
            state.open_sessions = state.open_sessions.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataValue;

    fn config() -> DatabaseConfig {
        crate::config::DatabaseConfigBuilder::new()
            .alias("memory")
            .sqlite(":memory:", true)
            .pool(crate::types::PoolConfig::default())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_scripted_rows_and_failures() {
        let row: Row = [("Id".to_string(), DataValue::Int(1))].into_iter().collect();
        let driver = MemoryDriver::new()
            .with_rows("SELECT 1", vec![row.clone()])
            .with_error("SELECT bad", "语法错误");

        let mut session = driver.connect(&config()).await.unwrap();
        let mut rows = Vec::new();
        let count = session
            .execute(&OperationTarget::Query("SELECT 1".into()), &[], &mut |r| rows.push(r))
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(rows, vec![row]);

        let err = session
            .execute(&OperationTarget::Query("SELECT bad".into()), &[], &mut |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "operation_error");
        assert_eq!(driver.executions().len(), 2);

        session.close().await.unwrap();
        assert_eq!(driver.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_connect_failures_are_counted() {
        let driver = MemoryDriver::new();
        driver.fail_next_connects(1);
        assert!(driver.connect(&config()).await.is_err());
        assert!(driver.connect(&config()).await.is_ok());
        assert_eq!(driver.connect_attempts(), 2);
        assert_eq!(driver.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_failed_close_still_ends_session() {
        let driver = MemoryDriver::new();
        let mut session = driver.connect(&config()).await.unwrap();
        driver.fail_next_closes(1);

        let err = session.close().await.unwrap_err();
        assert_eq!(err.kind(), "connection_error");
        assert_eq!(driver.open_sessions(), 0);
        // 已结束的会话再次关闭不再计数
        session.close().await.unwrap();
        assert_eq!(driver.close_calls(), 1);
    }
}
