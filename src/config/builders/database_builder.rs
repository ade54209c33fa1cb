//! # 数据库配置构建器模块
//!
//! 提供数据库配置的构建器实现，支持链式调用和严格验证

use crate::error::LiveQueryResult;
use crate::types::*;
use rat_logger::info;

/// 数据库配置构建器
///
/// 严格要求所有配置项必须显式设置，严禁使用默认值
#[derive(Debug)]
pub struct DatabaseConfigBuilder {
    db_type: Option<DatabaseType>,
    connection: Option<ConnectionConfig>,
    pool: Option<PoolConfig>,
    alias: Option<String>,
}

impl DatabaseConfig {
    /// 创建数据库配置构建器
    pub fn builder() -> DatabaseConfigBuilder {
        DatabaseConfigBuilder::new()
    }
}

impl DatabaseConfigBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self {
            db_type: None,
            connection: None,
            pool: None,
            alias: None,
        }
    }

    /// 设置数据库类型
    ///
    /// # 参数
    ///
    /// * `db_type` - 数据库类型
    pub fn db_type(mut self, db_type: DatabaseType) -> Self {
        self.db_type = Some(db_type);
        self
    }

    /// 设置连接配置
    ///
    /// # 参数
    ///
    /// * `connection` - 连接配置
    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = Some(connection);
        self
    }

    /// SQLite 数据库文件，同时设置数据库类型
    pub fn sqlite<P: Into<String>>(self, path: P, create_if_missing: bool) -> Self {
        self.db_type(DatabaseType::SQLite)
            .connection(ConnectionConfig::SQLite {
                path: path.into(),
                create_if_missing,
            })
    }

    /// 网络数据库服务器（PostgreSQL / MySQL）
    pub fn server<S: Into<String>>(
        self,
        host: S,
        port: u16,
        database: S,
        auth: AuthConfig,
        tls: TlsConfig,
    ) -> Self {
        self.connection(ConnectionConfig::Server {
            host: host.into(),
            port,
            database: database.into(),
            auth,
            tls,
        })
    }

    /// 设置连接池配置
    ///
    /// # 参数
    ///
    /// * `pool` - 连接池配置
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = Some(pool);
        self
    }

    /// 设置数据库别名
    ///
    /// # 参数
    ///
    /// * `alias` - 数据库别名
    pub fn alias<S: Into<String>>(mut self, alias: S) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// 构建数据库配置
    ///
    /// # 错误
    ///
    /// 如果任何必需的配置项未设置，将返回错误
    pub fn build(self) -> LiveQueryResult<DatabaseConfig> {
        let db_type = self
            .db_type
            .ok_or_else(|| crate::quick_error!(config, "数据库类型必须设置"))?;

        let connection = self
            .connection
            .ok_or_else(|| crate::quick_error!(config, "连接配置必须设置"))?;

        let pool = self
            .pool
            .ok_or_else(|| crate::quick_error!(config, "连接池配置必须设置"))?;

        let alias = self
            .alias
            .ok_or_else(|| crate::quick_error!(config, "数据库别名必须设置"))?;

        // 验证配置的一致性
        Self::validate_config(&db_type, &connection)?;
        crate::config::validate_pool_config(&pool)?;

        info!("创建数据库配置: 别名={}, 类型={:?}", alias, db_type);

        Ok(DatabaseConfig {
            db_type,
            connection,
            pool,
            alias,
        })
    }

    /// 验证数据库类型与连接参数是否匹配
    pub(crate) fn validate_config(
        db_type: &DatabaseType,
        connection: &ConnectionConfig,
    ) -> LiveQueryResult<()> {
        match (db_type, connection) {
            (DatabaseType::SQLite, ConnectionConfig::SQLite { path, .. }) => {
                if path.trim().is_empty() {
                    return Err(crate::quick_error!(config, "SQLite 数据库路径不能为空"));
                }
                Ok(())
            }
            (DatabaseType::PostgreSQL | DatabaseType::MySQL, ConnectionConfig::Server { host, auth, .. }) => {
                if host.trim().is_empty() {
                    return Err(crate::quick_error!(config, "服务器地址不能为空"));
                }
                if auth.username().trim().is_empty() {
                    return Err(crate::quick_error!(config, "用户名不能为空"));
                }
                Ok(())
            }
            _ => Err(crate::quick_error!(
                config,
                format!("数据库类型 {:?} 与连接配置不匹配", db_type)
            )),
        }
    }
}

impl Default for DatabaseConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
