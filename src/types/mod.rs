//! 数据库类型定义和配置
//!
//! 定义支持的数据库类型、连接配置和通用数据类型

pub mod data_value;
pub mod database_config;

// 重新导出所有公共类型
pub use data_value::{DataValue, json_value_to_data_value, row_to_json};
pub use database_config::{
    AuthConfig, ConnectionConfig, DatabaseConfig, DatabaseType, PoolConfig, TlsConfig,
};
