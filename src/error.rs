//! 错误类型定义
//!
//! 统一的错误枚举，所有错误消息经由 i18n 模块本地化

use thiserror::Error;

use crate::i18n::tf;

/// 库统一错误类型
#[derive(Error, Debug)]
pub enum LiveQueryError {
    /// 数据库连接失败（网络、认证等），会触发有界的自动重试
    #[error("{}", tf("error.connection", &[("message", .message.as_str())]))]
    ConnectionError { message: String },

    /// 等待连接超时
    #[error("{}", tf("error.acquisition_timeout", &[("timeout_ms", .timeout_ms.to_string().as_str())]))]
    AcquisitionTimeout { timeout_ms: u64 },

    /// 连接池已满且调用方不愿等待
    #[error("{}", tf("error.pool_exhausted", &[("max", .max_connections.to_string().as_str())]))]
    PoolExhausted { max_connections: u32 },

    /// 连接池正在关闭
    #[error("{}", tf("error.pool_closing", &[]))]
    PoolClosing,

    /// 查询或存储过程执行失败
    #[error("{}", tf("error.operation", &[("message", .message.as_str())]))]
    OperationError { message: String },

    /// 配置错误
    #[error("{}", tf("error.config", &[("message", .message.as_str())]))]
    ConfigError { message: String },

    /// 参数校验失败
    #[error("{}", tf("error.validation", &[("field", .field.as_str()), ("message", .message.as_str())]))]
    ValidationError { field: String, message: String },

    /// 序列化失败
    #[error("{}", tf("error.serialization", &[("message", .message.as_str())]))]
    SerializationError { message: String },

    /// IO 错误
    #[error("{}", tf("error.io", &[("message", .0.to_string().as_str())]))]
    IoError(#[from] std::io::Error),
}

/// 库统一结果类型
pub type LiveQueryResult<T> = Result<T, LiveQueryError>;

impl LiveQueryError {
    /// 错误分类代码，推送给客户端时使用
    pub fn kind(&self) -> &'static str {
        match self {
            LiveQueryError::ConnectionError { .. } => "connection_error",
            LiveQueryError::AcquisitionTimeout { .. } => "acquisition_timeout",
            LiveQueryError::PoolExhausted { .. } => "pool_exhausted",
            LiveQueryError::PoolClosing => "pool_closing",
            LiveQueryError::OperationError { .. } => "operation_error",
            LiveQueryError::ConfigError { .. } => "config_error",
            LiveQueryError::ValidationError { .. } => "validation_error",
            LiveQueryError::SerializationError { .. } => "serialization_error",
            LiveQueryError::IoError(_) => "io_error",
        }
    }

    /// 是否属于连接层错误（会让连接进入 Failed 状态）
    pub fn is_connection_error(&self) -> bool {
        matches!(self, LiveQueryError::ConnectionError { .. } | LiveQueryError::IoError(_))
    }
}

impl From<serde_json::Error> for LiveQueryError {
    fn from(e: serde_json::Error) -> Self {
        LiveQueryError::SerializationError {
            message: e.to_string(),
        }
    }
}

#[cfg(any(
    feature = "sqlite-support",
    feature = "postgres-support",
    feature = "mysql-support"
))]
impl From<sqlx::Error> for LiveQueryError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => LiveQueryError::ConnectionError {
                message: e.to_string(),
            },
            sqlx::Error::Configuration(_) => LiveQueryError::ConfigError {
                message: e.to_string(),
            },
            _ => LiveQueryError::OperationError {
                message: e.to_string(),
            },
        }
    }
}

/// 快速构造常用错误
///
/// ```ignore
/// return Err(quick_error!(config, "最大连接数必须设置"));
/// return Err(quick_error!(validation, "interval_ms", "订阅间隔过短"));
/// ```
#[macro_export]
macro_rules! quick_error {
    (connection, $msg:expr) => {
        $crate::error::LiveQueryError::ConnectionError {
            message: ($msg).to_string(),
        }
    };
    (operation, $msg:expr) => {
        $crate::error::LiveQueryError::OperationError {
            message: ($msg).to_string(),
        }
    };
    (config, $msg:expr) => {
        $crate::error::LiveQueryError::ConfigError {
            message: ($msg).to_string(),
        }
    };
    (serialization, $msg:expr) => {
        $crate::error::LiveQueryError::SerializationError {
            message: ($msg).to_string(),
        }
    };
    (validation, $field:expr, $msg:expr) => {
        $crate::error::LiveQueryError::ValidationError {
            field: ($field).to_string(),
            message: ($msg).to_string(),
        }
    };
}
