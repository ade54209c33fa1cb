//! 操作模块
//!
//! 查询与存储过程调用的请求、参数与结果定义

pub mod builder;
pub mod types;

// 重新导出主要类型
pub use builder::OperationBuilder;
pub use types::*;
