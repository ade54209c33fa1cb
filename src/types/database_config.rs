use serde::{Deserialize, Serialize};

/// 支持的数据库类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatabaseType {
    /// SQLite 数据库
    SQLite,
    /// PostgreSQL 数据库
    PostgreSQL,
    /// MySQL 数据库
    MySQL,
}

impl DatabaseType {
    /// 获取数据库类型的字符串表示
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::SQLite => "sqlite",
            DatabaseType::PostgreSQL => "postgresql",
            DatabaseType::MySQL => "mysql",
        }
    }

    /// 默认端口
    pub fn default_port(&self) -> u16 {
        match self {
            DatabaseType::SQLite => 0,
            DatabaseType::PostgreSQL => 5432,
            DatabaseType::MySQL => 3306,
        }
    }
}

impl std::str::FromStr for DatabaseType {
    type Err = crate::error::LiveQueryError;

    /// 从字符串解析数据库类型
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(DatabaseType::SQLite),
            "postgresql" | "postgres" | "pg" => Ok(DatabaseType::PostgreSQL),
            "mysql" => Ok(DatabaseType::MySQL),
            _ => Err(crate::quick_error!(config, format!("不支持的数据库类型: {}", s))),
        }
    }
}

/// 数据库连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// 数据库类型
    pub db_type: DatabaseType,
    /// 连接参数
    pub connection: ConnectionConfig,
    /// 连接池配置
    pub pool: PoolConfig,
    /// 数据库别名，用于日志和连接标识
    pub alias: String,
}

/// 连接参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConnectionConfig {
    /// SQLite 文件路径
    SQLite {
        /// 数据库文件路径，":memory:" 表示内存数据库
        path: String,
        /// 是否创建数据库文件（如果不存在）
        create_if_missing: bool,
    },
    /// 网络数据库服务器
    Server {
        /// 服务器地址（IP或域名）
        host: String,
        /// 端口号
        port: u16,
        /// 数据库名
        database: String,
        /// 认证方式
        auth: AuthConfig,
        /// 传输加密配置
        tls: TlsConfig,
    },
}

/// 认证方式
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuthConfig {
    /// 用户名密码认证
    Password {
        /// 用户名
        username: String,
        /// 密码
        password: String,
    },
    /// 受信任连接（由服务器侧信任当前用户，不发送密码）
    Trusted {
        /// 连接使用的用户名
        username: String,
    },
}

impl AuthConfig {
    /// 连接使用的用户名
    pub fn username(&self) -> &str {
        match self {
            AuthConfig::Password { username, .. } | AuthConfig::Trusted { username } => username,
        }
    }
}

/// 传输加密配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// 是否加密传输
    pub encrypt: bool,
    /// 是否信任服务器证书（跳过证书校验）
    pub trust_server_certificate: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            encrypt: true,
            trust_server_certificate: true,
        }
    }
}

/// 连接池配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// 启动时预先建立的连接数
    pub min_connections: u32,
    /// 最大连接数
    pub max_connections: u32,
    /// 获取连接的默认等待时间（毫秒）
    pub acquire_timeout_ms: u64,
    /// 连接失败后的重试间隔（毫秒）
    pub retry_interval_ms: u64,
    /// 连续失败的最大重试次数
    pub max_retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            acquire_timeout_ms: 5000,
            retry_interval_ms: 5000,
            max_retries: 5,
        }
    }
}

impl PoolConfig {
    /// 获取连接的默认等待时间
    pub fn acquire_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.acquire_timeout_ms)
    }

    /// 连接重试间隔
    pub fn retry_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.retry_interval_ms)
    }
}
