//! 连接池模块
//!
//! 有界连接集合、FIFO 获取队列，以及单个连接的重连状态机

pub mod connection;
pub mod pool;
pub mod types;

// 重新导出主要的公共类型和结构体
pub use connection::{Connection, ConnectionState};
pub use pool::ConnectionPool;
pub use types::{PoolStatus, PooledConnection};
