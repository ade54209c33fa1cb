//! # 配置管理模块
//!
//! 提供统一的配置管理系统，支持构建器模式和链式配置
//! 严格遵循项目规范：构建器中的配置项必须显式设置，严禁使用默认值

pub mod builders;
pub mod core;

pub use builders::{DatabaseConfigBuilder, LoggingConfigBuilder, PoolConfigBuilder};
pub use core::{
    GatewayConfig, LiveQueryConfig, LogLevel, LoggingConfig, SubscriptionConfig, init_logging,
    validate_pool_config,
};
