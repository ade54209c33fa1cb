//! # 配置管理模块 - 核心配置类型
//!
//! 启动时一次性加载的静态配置，不支持热更新

use crate::error::LiveQueryResult;
use crate::types::*;
use rat_logger::{LevelFilter, LoggerBuilder, handler::term::TermConfig, info};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 服务整体配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveQueryConfig {
    /// 数据库配置
    pub database: DatabaseConfig,
    /// 订阅配置
    #[serde(default)]
    pub subscription: SubscriptionConfig,
    /// 日志配置
    pub logging: LoggingConfig,
    /// 网关配置
    pub gateway: GatewayConfig,
}

/// 订阅配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// 客户端未指定时使用的轮询间隔（毫秒）
    pub default_interval_ms: u64,
    /// 允许的最小轮询间隔（毫秒）
    pub min_interval_ms: u64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: 5000,
            min_interval_ms: 100,
        }
    }
}

impl SubscriptionConfig {
    /// 解析客户端请求的轮询间隔
    pub fn resolve_interval(&self, requested_ms: Option<u64>) -> LiveQueryResult<Duration> {
        let interval_ms = requested_ms.unwrap_or(self.default_interval_ms);
        if interval_ms < self.min_interval_ms {
            return Err(crate::quick_error!(
                validation,
                "interval_ms",
                format!("轮询间隔 {}ms 小于允许的最小值 {}ms", interval_ms, self.min_interval_ms)
            ));
        }
        Ok(Duration::from_millis(interval_ms))
    }
}

/// 网关配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// 监听地址，例如 "0.0.0.0:3000"
    pub bind_addr: String,
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别
    pub level: LogLevel,
    /// 是否输出到控制台
    pub console: bool,
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    /// 错误级别
    Error,
    /// 警告级别
    Warn,
    /// 信息级别
    Info,
    /// 调试级别
    Debug,
    /// 跟踪级别
    Trace,
}

impl LogLevel {
    /// 转换为 rat_logger 的级别过滤器
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = crate::error::LiveQueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(crate::quick_error!(config, format!("无效的日志级别: {}", s))),
        }
    }
}

/// 按日志配置初始化 rat_logger
///
/// 库本身不初始化日志系统，由调用者（例如服务端程序）决定
pub fn init_logging(config: &LoggingConfig) -> LiveQueryResult<()> {
    if !config.console {
        return Ok(());
    }

    LoggerBuilder::new()
        .with_level(config.level.to_level_filter())
        .add_terminal_with_config(TermConfig::default())
        .init()
        .map_err(|e| crate::quick_error!(config, format!("日志初始化失败: {}", e)))
}

/// 校验连接池配置
pub fn validate_pool_config(pool: &PoolConfig) -> LiveQueryResult<()> {
    if pool.max_connections == 0 {
        return Err(crate::quick_error!(config, "最大连接数不能为零"));
    }
    if pool.min_connections > pool.max_connections {
        return Err(crate::quick_error!(config, "最小连接数不能大于最大连接数"));
    }
    if pool.acquire_timeout_ms == 0 {
        return Err(crate::quick_error!(config, "获取连接超时时间不能为零"));
    }
    if pool.retry_interval_ms == 0 {
        return Err(crate::quick_error!(config, "重试间隔不能为零"));
    }
    Ok(())
}

impl LiveQueryConfig {
    /// 从配置文件加载配置，扩展名为 .toml 时按 TOML 解析，否则按 JSON 解析
    ///
    /// # 参数
    ///
    /// * `config_path` - 配置文件路径
    pub fn from_file<P: AsRef<std::path::Path>>(config_path: P) -> LiveQueryResult<Self> {
        let content = std::fs::read_to_string(config_path.as_ref())?;

        let config: LiveQueryConfig = if is_toml(config_path.as_ref()) {
            toml::from_str(&content)
                .map_err(|e| crate::quick_error!(config, format!("解析TOML配置文件失败: {}", e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| crate::quick_error!(config, format!("解析JSON配置文件失败: {}", e)))?
        };

        config.validate()?;
        info!("从文件加载配置: {:?}", config_path.as_ref());
        Ok(config)
    }

    /// 保存配置到文件
    ///
    /// # 参数
    ///
    /// * `config_path` - 配置文件路径
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, config_path: P) -> LiveQueryResult<()> {
        let content = if is_toml(config_path.as_ref()) {
            toml::to_string_pretty(self)
                .map_err(|e| crate::quick_error!(config, format!("序列化TOML配置失败: {}", e)))?
        } else {
            serde_json::to_string_pretty(self)?
        };

        std::fs::write(config_path.as_ref(), content)?;

        info!("保存配置到文件: {:?}", config_path.as_ref());
        Ok(())
    }

    /// 校验配置的一致性
    pub fn validate(&self) -> LiveQueryResult<()> {
        super::builders::DatabaseConfigBuilder::validate_config(
            &self.database.db_type,
            &self.database.connection,
        )?;
        validate_pool_config(&self.database.pool)?;

        if self.subscription.min_interval_ms == 0 {
            return Err(crate::quick_error!(config, "最小轮询间隔不能为零"));
        }
        self.subscription
            .resolve_interval(None)
            .map_err(|_| crate::quick_error!(config, "默认轮询间隔不能小于最小轮询间隔"))?;

        if self.gateway.bind_addr.trim().is_empty() {
            return Err(crate::quick_error!(config, "网关监听地址必须设置"));
        }
        Ok(())
    }
}

fn is_toml(path: &std::path::Path) -> bool {
    path.extension().and_then(|s| s.to_str()) == Some("toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[database]
db_type = "SQLite"
alias = "main"

[database.connection.SQLite]
path = "./data/live.db"
create_if_missing = true

[database.pool]
min_connections = 2
max_connections = 10
acquire_timeout_ms = 5000
retry_interval_ms = 5000
max_retries = 5

[logging]
level = "Info"
console = true

[gateway]
bind_addr = "127.0.0.1:3000"
"#;

    #[test]
    fn test_load_toml_with_default_subscription_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("livequery.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = LiveQueryConfig::from_file(&path).unwrap();
        assert_eq!(config.database.alias, "main");
        assert_eq!(config.database.pool, PoolConfig::default());
        assert_eq!(config.subscription.default_interval_ms, 5000);
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_json_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let toml_path = dir.path().join("livequery.toml");
        std::fs::write(&toml_path, SAMPLE).unwrap();
        let config = LiveQueryConfig::from_file(&toml_path).unwrap();

        let json_path = dir.path().join("livequery.json");
        config.save_to_file(&json_path).unwrap();
        let reloaded = LiveQueryConfig::from_file(&json_path).unwrap();
        assert_eq!(reloaded.gateway, config.gateway);
        assert_eq!(reloaded.database.pool, config.database.pool);
    }

    #[test]
    fn test_invalid_pool_is_rejected() {
        let pool = PoolConfig {
            min_connections: 5,
            max_connections: 2,
            ..PoolConfig::default()
        };
        assert!(validate_pool_config(&pool).is_err());
    }

    #[test]
    fn test_interval_resolution() {
        let config = SubscriptionConfig::default();
        assert_eq!(config.resolve_interval(None).unwrap(), Duration::from_millis(5000));
        assert_eq!(config.resolve_interval(Some(250)).unwrap(), Duration::from_millis(250));
        assert!(config.resolve_interval(Some(10)).is_err());
    }
}
