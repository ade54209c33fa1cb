//! # 连接池配置构建器模块
//!
//! 提供连接池配置的构建器实现，支持链式调用和严格验证

use crate::error::LiveQueryResult;
use crate::types::PoolConfig;
use rat_logger::info;

/// 连接池配置构建器
///
/// 严格要求所有配置项必须显式设置，严禁使用默认值
#[derive(Debug)]
pub struct PoolConfigBuilder {
    min_connections: Option<u32>,
    max_connections: Option<u32>,
    acquire_timeout_ms: Option<u64>,
    retry_interval_ms: Option<u64>,
    max_retries: Option<u32>,
}

impl PoolConfig {
    /// 创建连接池配置构建器
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }
}

impl PoolConfigBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self {
            min_connections: None,
            max_connections: None,
            acquire_timeout_ms: None,
            retry_interval_ms: None,
            max_retries: None,
        }
    }

    /// 设置启动时预建的连接数
    ///
    /// # 参数
    ///
    /// * `min_connections` - 最小连接数
    pub fn min_connections(mut self, min_connections: u32) -> Self {
        self.min_connections = Some(min_connections);
        self
    }

    /// 设置最大连接数
    ///
    /// # 参数
    ///
    /// * `max_connections` - 最大连接数
    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = Some(max_connections);
        self
    }

    /// 设置获取连接的默认等待时间（毫秒）
    pub fn acquire_timeout_ms(mut self, timeout: u64) -> Self {
        self.acquire_timeout_ms = Some(timeout);
        self
    }

    /// 设置重试间隔（毫秒）
    ///
    /// # 参数
    ///
    /// * `interval` - 重试间隔（毫秒）
    pub fn retry_interval_ms(mut self, interval: u64) -> Self {
        self.retry_interval_ms = Some(interval);
        self
    }

    /// 设置最大重试次数
    ///
    /// # 参数
    ///
    /// * `retries` - 连续失败多少次后放弃
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// 构建连接池配置
    ///
    /// # 错误
    ///
    /// 如果任何必需的配置项未设置或取值不合理，将返回错误
    pub fn build(self) -> LiveQueryResult<PoolConfig> {
        let min_connections = self
            .min_connections
            .ok_or_else(|| crate::quick_error!(config, "最小连接数必须设置"))?;

        let max_connections = self
            .max_connections
            .ok_or_else(|| crate::quick_error!(config, "最大连接数必须设置"))?;

        let acquire_timeout_ms = self
            .acquire_timeout_ms
            .ok_or_else(|| crate::quick_error!(config, "获取连接超时时间必须设置"))?;

        let retry_interval_ms = self
            .retry_interval_ms
            .ok_or_else(|| crate::quick_error!(config, "重试间隔必须设置"))?;

        let max_retries = self
            .max_retries
            .ok_or_else(|| crate::quick_error!(config, "最大重试次数必须设置"))?;

        let config = PoolConfig {
            min_connections,
            max_connections,
            acquire_timeout_ms,
            retry_interval_ms,
            max_retries,
        };
        crate::config::validate_pool_config(&config)?;

        info!(
            "创建连接池配置: 最小连接数={}, 最大连接数={}, 获取超时={}ms",
            min_connections, max_connections, acquire_timeout_ms
        );

        Ok(config)
    }
}

impl Default for PoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
