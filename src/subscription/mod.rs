//! 订阅模块
//!
//! 按订阅者管理周期性执行的操作，并把结果推送给订阅者

pub mod manager;
pub mod types;

pub use manager::SubscriptionManager;
pub use types::*;
