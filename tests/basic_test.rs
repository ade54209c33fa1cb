#[cfg(test)]
mod tests {
    use rat_livequery::*;
    use std::io::Write;

    /// 基础的配置文件加载测试
    #[test]
    fn test_load_toml_config() {
        println!("🔍 测试TOML配置加载");

        let toml = r#"
[database]
db_type = "PostgreSQL"
alias = "reporting"

[database.connection.Server]
host = "10.0.0.12"
port = 5432
database = "reporting"

[database.connection.Server.auth.Password]
username = "svc_reader"
password = "secret"

[database.connection.Server.tls]
encrypt = true
trust_server_certificate = true

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
bind_addr = "0.0.0.0:3000"
"#;
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(toml.as_bytes()).unwrap();

        let config = LiveQueryConfig::from_file(file.path()).unwrap();
        assert_eq!(config.database.db_type, DatabaseType::PostgreSQL);
        assert_eq!(config.database.pool, PoolConfig::default());
        // 未配置订阅时使用默认间隔
        assert_eq!(config.subscription.default_interval_ms, 5000);
        assert_eq!(config.gateway.bind_addr, "0.0.0.0:3000");

        println!("✅ 配置加载成功: {}", get_info());
    }

    /// 错误消息跟随语言设置
    #[test]
    fn test_error_messages_are_localised() {
        init();
        i18n::set_language("en-US");
        let err = LiveQueryError::PoolClosing;
        assert_eq!(err.to_string(), "Connection pool is closing");

        i18n::set_language("zh-CN");
        assert_eq!(err.to_string(), "连接池正在关闭");
    }
}
