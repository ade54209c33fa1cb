//! rat_livequery - 数据库实时查询推送库
//!
//! 提供有界数据库连接池（FIFO 排队获取、有界自动重连）、查询与存储过程执行器，
//! 以及按订阅者管理的周期查询订阅。可选的 WebSocket 网关把订阅结果推送给客户端

// 导出所有公共模块
pub mod error;
pub mod i18n;
pub mod types;
pub mod operation;
pub mod driver;
pub mod pool;
pub mod executor;
pub mod subscription;
pub mod config;

// WebSocket 网关（仅在启用 websocket 特性时编译）
#[cfg(feature = "websocket")]
pub mod gateway;

// 重新导出常用类型和函数
pub use error::{LiveQueryError, LiveQueryResult};
pub use types::*;
pub use operation::{
    OperationBuilder, OperationRequest, OperationResult, OperationTarget, ParamType, Parameter,
    Row,
};
pub use driver::{DatabaseDriver, DatabaseSession, MemoryDriver, MemoryResponse, create_driver};
pub use pool::{Connection, ConnectionPool, ConnectionState, PoolStatus, PooledConnection};
pub use executor::OperationExecutor;
pub use subscription::{
    SinkClosed, SubscriberId, SubscriptionEvent, SubscriptionId, SubscriptionInfo,
    SubscriptionManager, SubscriptionSink, SubscriptionState,
};
pub use config::{
    DatabaseConfigBuilder, GatewayConfig, LiveQueryConfig, LogLevel, LoggingConfig,
    LoggingConfigBuilder, PoolConfigBuilder, SubscriptionConfig, init_logging,
};

#[cfg(feature = "websocket")]
pub use gateway::{ClientMessage, ServerMessage, SubscriptionGateway};

// 条件编译调试宏 - 只有在 debug 模式下才输出调试信息
#[cfg(debug_assertions)]
#[macro_export]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        rat_logger::debug!($($arg)*);
    };
}

#[cfg(not(debug_assertions))]
#[macro_export]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        // 在 release 模式下不输出调试信息
    };
}

/// 初始化rat_livequery库
///
/// 这个函数会初始化多语言错误消息系统
///
/// 注意：日志系统由调用者自行初始化（见 [`init_logging`]），本库不自动初始化日志
pub fn init() {
    i18n::ErrorMessageI18n::init();
}

/// 库版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 库名称
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// 获取库信息
pub fn get_info() -> String {
    format!("{} v{}", NAME, VERSION)
}
