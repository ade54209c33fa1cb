//! 操作执行器
//!
//! 在借出的连接上执行一次查询或存储过程调用，收集结果行并给出终止状态

use rat_logger::{error, info, warn};
use std::time::Instant;

use crate::error::{LiveQueryError, LiveQueryResult};
use crate::i18n::tf;
use crate::operation::{OperationRequest, OperationResult};
use crate::pool::{ConnectionPool, ConnectionState, PooledConnection};

/// 操作执行器
#[derive(Debug, Clone)]
pub struct OperationExecutor {
    pool: ConnectionPool,
}

impl OperationExecutor {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// 所使用的连接池
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// 获取连接 → 执行 → 归还
    pub async fn run(&self, request: &OperationRequest) -> LiveQueryResult<OperationResult> {
        let connection = self.pool.get_connection().await?;
        let result = self.execute(&connection, request).await;
        connection.release();
        result
    }

    /// 在借出的连接上执行操作
    ///
    /// 结果行按到达顺序收集；失败时丢弃已收到的行，只返回错误。
    /// 连接未就绪时先尝试打开；连接层错误会让连接进入 Failed 状态
    pub async fn execute(
        &self,
        connection: &PooledConnection,
        request: &OperationRequest,
    ) -> LiveQueryResult<OperationResult> {
        let operation_id = uuid::Uuid::new_v4().simple().to_string();
        let target = request.target();
        let kind = if target.is_procedure() { "存储过程" } else { "查询" };
        let started = Instant::now();

        info!(
            "执行{}: 操作ID={}, 连接={}, 目标={}, 参数数量={}",
            kind,
            operation_id,
            connection.id(),
            target.log_preview(),
            request.params().len()
        );

        let work = async {
            // 先按声明类型检查参数，类型错误不占用数据库往返
            for param in request.params() {
                param.coerce()?;
            }
            if connection.state() != ConnectionState::Ready {
                warn!("连接未就绪，执行前重新连接: 连接={}", connection.id());
                connection.open().await?;
            }

            let mut rows = Vec::new();
            let row_count = connection
                .execute(target, request.params(), &mut |row| rows.push(row))
                .await?;
            Ok::<_, LiveQueryError>((rows, row_count))
        };

        let outcome = match request.timeout() {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let timeout_ms = limit.as_millis().to_string();
                    let err = crate::quick_error!(
                        operation,
                        tf("error.operation_timeout", &[("timeout_ms", timeout_ms.as_str())])
                    );
                    // 被中断的会话状态不可信，丢弃后重连
                    connection.mark_failed(&err).await;
                    Err(err)
                }
            },
            None => work.await,
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok((rows, row_count)) => {
                info!(
                    "{}执行成功: 操作ID={}, 行数={}, 耗时={}ms",
                    kind, operation_id, row_count, elapsed_ms
                );
                Ok(OperationResult {
                    rows,
                    row_count,
                    elapsed_ms,
                })
            }
            Err(e) => {
                error!(
                    "{}执行失败: 操作ID={}, 目标={}, 耗时={}ms, 错误={}",
                    kind,
                    operation_id,
                    target.log_preview(),
                    elapsed_ms,
                    e
                );
                if e.is_connection_error() {
                    connection.mark_failed(&e).await;
                }
                Err(e)
            }
        }
    }
}
