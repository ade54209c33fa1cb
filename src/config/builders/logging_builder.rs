//! # 日志配置构建器模块
//!
//! 在配置文件给出的日志配置之上叠加命令行覆盖项，级别名称在 build 时统一校验

use crate::config::core::{LogLevel, LoggingConfig};
use crate::error::LiveQueryResult;

/// 日志配置构建器
#[derive(Debug, Default)]
pub struct LoggingConfigBuilder {
    level: Option<LogLevel>,
    /// 尚未解析的级别名称，例如来自命令行参数
    level_name: Option<String>,
    console: Option<bool>,
}

impl LoggingConfigBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self::default()
    }

    /// 以已有配置为基础，之后的设置会覆盖对应项
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self {
            level: Some(config.level),
            level_name: None,
            console: Some(config.console),
        }
    }

    /// 设置日志级别
    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = Some(level);
        self.level_name = None;
        self
    }

    /// 按名称设置日志级别（不区分大小写），无效名称在 build 时报错
    pub fn level_name(mut self, name: impl Into<String>) -> Self {
        self.level_name = Some(name.into());
        self
    }

    /// 设置是否输出到控制台
    pub fn console(mut self, console: bool) -> Self {
        self.console = Some(console);
        self
    }

    /// 构建日志配置
    ///
    /// # 错误
    ///
    /// 级别或控制台选项未设置、级别名称无效时返回配置错误
    pub fn build(self) -> LiveQueryResult<LoggingConfig> {
        let level = match self.level_name {
            Some(name) => name.parse::<LogLevel>()?,
            None => self
                .level
                .ok_or_else(|| crate::quick_error!(config, "日志级别必须设置"))?,
        };

        let console = self
            .console
            .ok_or_else(|| crate::quick_error!(config, "控制台输出选项必须设置"))?;

        Ok(LoggingConfig { level, console })
    }
}

impl LoggingConfig {
    /// 创建日志配置构建器
    pub fn builder() -> LoggingConfigBuilder {
        LoggingConfigBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_are_rejected() {
        let err = LoggingConfig::builder().console(true).build().unwrap_err();
        assert_eq!(err.kind(), "config_error");

        let err = LoggingConfig::builder().level(LogLevel::Info).build().unwrap_err();
        assert_eq!(err.kind(), "config_error");
    }

    #[test]
    fn test_overrides_on_top_of_file_config() {
        let base = LoggingConfig {
            level: LogLevel::Info,
            console: true,
        };

        let config = LoggingConfigBuilder::from_config(&base)
            .level_name("DEBUG")
            .build()
            .unwrap();
        assert_eq!(config.level, LogLevel::Debug);
        assert!(config.console);

        let quiet = LoggingConfigBuilder::from_config(&base)
            .console(false)
            .build()
            .unwrap();
        assert_eq!(quiet.level, LogLevel::Info);
        assert!(!quiet.console);
    }

    #[test]
    fn test_invalid_level_name_fails_at_build() {
        let err = LoggingConfig::builder()
            .level_name("verbose")
            .console(true)
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), "config_error");
    }
}
