//! 基于 sqlx 的数据库驱动
//!
//! 每个会话持有一条独立的 sqlx 连接（不使用 sqlx 自带的连接池，
//! 池化由本库的连接池负责）

use async_trait::async_trait;
use futures::TryStreamExt;
use rat_logger::{debug, info, warn};
use sqlx::{Column, Connection as _, Row as _, TypeInfo};
use std::collections::HashMap;

use super::placeholder::{Dialect, procedure_call, rewrite_named};
use super::{DatabaseDriver, DatabaseSession, RowSink};
use crate::error::{LiveQueryError, LiveQueryResult};
use crate::i18n::tf;
use crate::operation::{OperationTarget, Parameter, Row};
use crate::types::{AuthConfig, ConnectionConfig, DataValue, DatabaseConfig, DatabaseType, TlsConfig};

/// 按声明类型绑定参数值
///
/// `$uuid_as_text` 为 true 时 UUID 以文本绑定（SQLite、MySQL 通常以文本列存储 UUID）
macro_rules! bind_value {
    ($query:expr, $value:expr, $uuid_as_text:expr) => {
        match $value {
            DataValue::Null => $query.bind(Option::<String>::None),
            DataValue::Bool(b) => $query.bind(b),
            DataValue::Int(i) => $query.bind(i),
            DataValue::UInt(u) => match i64::try_from(u) {
                Ok(i) => $query.bind(i),
                Err(_) => $query.bind(u.to_string()),
            },
            DataValue::Float(f) => $query.bind(f),
            DataValue::String(s) => $query.bind(s),
            DataValue::Bytes(b) => $query.bind(b),
            DataValue::DateTime(dt) => $query.bind(dt.with_timezone(&chrono::Utc)),
            DataValue::Uuid(u) => {
                if $uuid_as_text {
                    $query.bind(u.to_string())
                } else {
                    $query.bind(u)
                }
            }
            DataValue::Json(j) => $query.bind(j),
        }
    };
}

/// 消费 fetch_many 结果流：行推送给接收器，返回行数
///
/// 有结果行时行数为返回行数，否则为影响行数
macro_rules! drain_results {
    ($stream:expr, $sink:expr, $convert:path) => {{
        let mut stream = $stream;
        let mut streamed: u64 = 0;
        let mut affected: u64 = 0;
        while let Some(item) = stream.try_next().await? {
            match item {
                sqlx::Either::Left(done) => affected += done.rows_affected(),
                sqlx::Either::Right(row) => {
                    ($sink)($convert(&row)?);
                    streamed += 1;
                }
            }
        }
        Ok(if streamed > 0 { streamed } else { affected })
    }};
}

/// 读取可空列
macro_rules! read_column {
    ($row:expr, $idx:expr, $ty:ty, $map:expr) => {
        $row.try_get::<Option<$ty>, _>($idx)
            .map(|value| value.map($map).unwrap_or(DataValue::Null))
    };
}

/// 不做类型兼容检查地读取可空列
macro_rules! read_column_unchecked {
    ($row:expr, $idx:expr, $ty:ty, $map:expr) => {
        $row.try_get_unchecked::<Option<$ty>, _>($idx)
            .map(|value| value.map($map).unwrap_or(DataValue::Null))
    };
}

/// sqlx 驱动
#[derive(Debug, Clone)]
pub struct SqlxDriver {
    db_type: DatabaseType,
}

impl SqlxDriver {
    pub fn new(db_type: DatabaseType) -> Self {
        Self { db_type }
    }
}

#[async_trait]
impl DatabaseDriver for SqlxDriver {
    fn name(&self) -> &'static str {
        "sqlx"
    }

    async fn connect(&self, config: &DatabaseConfig) -> LiveQueryResult<Box<dyn DatabaseSession>> {
        if config.db_type != self.db_type {
            return Err(crate::quick_error!(
                config,
                format!(
                    "驱动类型 {} 与配置类型 {} 不匹配",
                    self.db_type.as_str(),
                    config.db_type.as_str()
                )
            ));
        }

        let session = match config.db_type {
            #[cfg(feature = "sqlite-support")]
            DatabaseType::SQLite => {
                let url = prepare_sqlite(config).await?;
                let conn = sqlx::SqliteConnection::connect(&url)
                    .await
                    .map_err(connect_error)?;
                SqlxSession::SQLite(Some(conn))
            }
            #[cfg(feature = "postgres-support")]
            DatabaseType::PostgreSQL => {
                let url = connection_url(config)?;
                let conn = sqlx::PgConnection::connect(&url)
                    .await
                    .map_err(connect_error)?;
                SqlxSession::PostgreSQL(Some(conn))
            }
            #[cfg(feature = "mysql-support")]
            DatabaseType::MySQL => {
                let url = connection_url(config)?;
                let conn = sqlx::MySqlConnection::connect(&url)
                    .await
                    .map_err(connect_error)?;
                SqlxSession::MySQL(Some(conn))
            }
            #[allow(unreachable_patterns)]
            other => {
                return Err(crate::quick_error!(
                    config,
                    tf("error.driver_not_enabled", &[("db_type", other.as_str())])
                ));
            }
        };

        debug!("数据库会话已建立: 别名={}, 类型={}", config.alias, config.db_type.as_str());
        Ok(Box::new(session))
    }
}

/// 建连阶段的错误一律视为连接错误，交给重试逻辑处理
fn connect_error(e: sqlx::Error) -> LiveQueryError {
    match e {
        sqlx::Error::Configuration(_) => LiveQueryError::from(e),
        other => crate::quick_error!(connection, other),
    }
}

/// 构造网络数据库的连接 URL
pub(crate) fn connection_url(config: &DatabaseConfig) -> LiveQueryResult<String> {
    let (host, port, database, auth, tls) = match &config.connection {
        ConnectionConfig::Server {
            host,
            port,
            database,
            auth,
            tls,
        } => (host, port, database, auth, tls),
        ConnectionConfig::SQLite { .. } => {
            return Err(crate::quick_error!(
                config,
                format!("数据库 {} 的连接参数不是服务器配置", config.alias)
            ));
        }
    };

    let scheme = match config.db_type {
        DatabaseType::PostgreSQL => "postgresql",
        DatabaseType::MySQL => "mysql",
        DatabaseType::SQLite => {
            return Err(crate::quick_error!(config, "SQLite 不使用服务器连接 URL"));
        }
    };

    // 对用户名和密码进行 URL 编码以处理特殊字符
    let credentials = match auth {
        AuthConfig::Password { username, password } => format!(
            "{}:{}",
            urlencoding::encode(username),
            urlencoding::encode(password)
        ),
        AuthConfig::Trusted { username } => urlencoding::encode(username).into_owned(),
    };

    Ok(format!(
        "{}://{}@{}:{}/{}?{}",
        scheme,
        credentials,
        host,
        port,
        urlencoding::encode(database),
        tls_query(&config.db_type, tls)
    ))
}

fn tls_query(db_type: &DatabaseType, tls: &TlsConfig) -> String {
    match db_type {
        DatabaseType::PostgreSQL => {
            let mode = match (tls.encrypt, tls.trust_server_certificate) {
                (false, _) => "disable",
                (true, true) => "require",
                (true, false) => "verify-full",
            };
            format!("sslmode={}", mode)
        }
        _ => {
            let mode = match (tls.encrypt, tls.trust_server_certificate) {
                (false, _) => "DISABLED",
                (true, true) => "REQUIRED",
                (true, false) => "VERIFY_IDENTITY",
            };
            format!("ssl-mode={}", mode)
        }
    }
}

/// 准备 SQLite 数据库文件，返回连接字符串
#[cfg(feature = "sqlite-support")]
async fn prepare_sqlite(config: &DatabaseConfig) -> LiveQueryResult<String> {
    let (path, create_if_missing) = match &config.connection {
        ConnectionConfig::SQLite {
            path,
            create_if_missing,
        } => (path.clone(), *create_if_missing),
        ConnectionConfig::Server { .. } => {
            return Err(crate::quick_error!(
                config,
                format!("数据库 {} 的连接参数不是 SQLite 配置", config.alias)
            ));
        }
    };

    // 内存数据库：直接连接，不创建文件
    if path == ":memory:" {
        info!("连接SQLite内存数据库: 别名={}", config.alias);
        return Ok("sqlite::memory:".to_string());
    }

    let file_exists = std::path::Path::new(&path).exists();
    if !file_exists && !create_if_missing {
        return Err(crate::quick_error!(
            connection,
            format!("SQLite 数据库文件不存在: {}", path)
        ));
    }

    if create_if_missing && !file_exists {
        if let Some(parent) = std::path::Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::File::create(&path).await?;
        info!("已创建SQLite数据库文件: {}", path);
    }

    Ok(format!("sqlite:{}", path))
}

/// 单条 sqlx 连接
enum SqlxSession {
    #[cfg(feature = "sqlite-support")]
    SQLite(Option<sqlx::SqliteConnection>),
    #[cfg(feature = "postgres-support")]
    PostgreSQL(Option<sqlx::PgConnection>),
    #[cfg(feature = "mysql-support")]
    MySQL(Option<sqlx::MySqlConnection>),
}

fn session_closed() -> LiveQueryError {
    crate::quick_error!(connection, "会话已关闭")
}

/// 按绑定顺序转换参数值
fn coerce_all(order: &[&Parameter]) -> LiveQueryResult<Vec<DataValue>> {
    order.iter().map(|param| param.coerce()).collect()
}

#[async_trait]
impl DatabaseSession for SqlxSession {
    async fn execute(
        &mut self,
        target: &OperationTarget,
        params: &[Parameter],
        sink: &mut RowSink<'_>,
    ) -> LiveQueryResult<u64> {
        match self {
            #[cfg(feature = "sqlite-support")]
            SqlxSession::SQLite(conn) => {
                let conn = conn.as_mut().ok_or_else(session_closed)?;
                execute_sqlite(conn, target, params, sink).await
            }
            #[cfg(feature = "postgres-support")]
            SqlxSession::PostgreSQL(conn) => {
                let conn = conn.as_mut().ok_or_else(session_closed)?;
                execute_postgres(conn, target, params, sink).await
            }
            #[cfg(feature = "mysql-support")]
            SqlxSession::MySQL(conn) => {
                let conn = conn.as_mut().ok_or_else(session_closed)?;
                execute_mysql(conn, target, params, sink).await
            }
        }
    }

    async fn close(&mut self) -> LiveQueryResult<()> {
        match self {
            #[cfg(feature = "sqlite-support")]
            SqlxSession::SQLite(conn) => {
                if let Some(conn) = conn.take() {
                    conn.close().await?;
                }
            }
            #[cfg(feature = "postgres-support")]
            SqlxSession::PostgreSQL(conn) => {
                if let Some(conn) = conn.take() {
                    conn.close().await?;
                }
            }
            #[cfg(feature = "mysql-support")]
            SqlxSession::MySQL(conn) => {
                if let Some(conn) = conn.take() {
                    conn.close().await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(feature = "sqlite-support")]
async fn execute_sqlite(
    conn: &mut sqlx::SqliteConnection,
    target: &OperationTarget,
    params: &[Parameter],
    sink: &mut RowSink<'_>,
) -> LiveQueryResult<u64> {
    let (sql, order) = match target {
        OperationTarget::Query(text) => rewrite_named(text, params, Dialect::Question)?,
        OperationTarget::Procedure(_) => {
            return Err(crate::quick_error!(
                operation,
                tf("error.unsupported_procedure", &[("db_type", "sqlite")])
            ));
        }
    };
    let values = coerce_all(&order)?;
    debug!("执行SQLite语句: {}", sql);

    let mut query = sqlx::query(&sql);
    for value in values {
        query = bind_value!(query, value, true);
    }

    #[allow(deprecated)]
    let stream = query.fetch_many(&mut *conn);
    drain_results!(stream, sink, sqlite_row_to_map)
}

#[cfg(feature = "postgres-support")]
async fn execute_postgres(
    conn: &mut sqlx::PgConnection,
    target: &OperationTarget,
    params: &[Parameter],
    sink: &mut RowSink<'_>,
) -> LiveQueryResult<u64> {
    let (sql, order) = match target {
        OperationTarget::Query(text) => rewrite_named(text, params, Dialect::Dollar)?,
        OperationTarget::Procedure(name) => (
            procedure_call(name, params, Dialect::Dollar),
            params.iter().collect(),
        ),
    };
    let values = coerce_all(&order)?;
    debug!("执行PostgreSQL语句: {}", sql);

    let mut query = sqlx::query(&sql);
    for value in values {
        query = bind_value!(query, value, false);
    }

    #[allow(deprecated)]
    let stream = query.fetch_many(&mut *conn);
    drain_results!(stream, sink, postgres_row_to_map)
}

#[cfg(feature = "mysql-support")]
async fn execute_mysql(
    conn: &mut sqlx::MySqlConnection,
    target: &OperationTarget,
    params: &[Parameter],
    sink: &mut RowSink<'_>,
) -> LiveQueryResult<u64> {
    let (sql, order) = match target {
        OperationTarget::Query(text) => rewrite_named(text, params, Dialect::Question)?,
        OperationTarget::Procedure(name) => (
            procedure_call(name, params, Dialect::Question),
            params.iter().collect(),
        ),
    };
    let values = coerce_all(&order)?;
    debug!("执行MySQL语句: {}", sql);

    let mut query = sqlx::query(&sql);
    for value in values {
        query = bind_value!(query, value, true);
    }

    #[allow(deprecated)]
    let stream = query.fetch_many(&mut *conn);
    drain_results!(stream, sink, mysql_row_to_map)
}

fn decode_error(column: &str, e: sqlx::Error) -> LiveQueryError {
    crate::quick_error!(operation, format!("列 {} 解码失败: {}", column, e))
}

/// 将SQLite行转换为列名映射
///
/// SQLite 是动态类型，按声明类型读取且不做兼容检查，由 SQLite 自行转换
#[cfg(feature = "sqlite-support")]
fn sqlite_row_to_map(row: &sqlx::sqlite::SqliteRow) -> LiveQueryResult<Row> {
    let mut map = HashMap::with_capacity(row.len());

    for column in row.columns() {
        let idx = column.ordinal();
        let value = match column.type_info().name() {
            "NULL" => Ok(DataValue::Null),
            "INTEGER" | "INT" | "BIGINT" | "INT8" => {
                read_column_unchecked!(row, idx, i64, DataValue::Int)
            }
            "BOOLEAN" => read_column_unchecked!(row, idx, bool, DataValue::Bool),
            "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => {
                read_column_unchecked!(row, idx, f64, DataValue::Float)
            }
            "BLOB" => read_column_unchecked!(row, idx, Vec<u8>, DataValue::Bytes),
            _ => read_column_unchecked!(row, idx, String, DataValue::String),
        }
        .map_err(|e| decode_error(column.name(), e))?;

        map.insert(column.name().to_string(), value);
    }

    Ok(map)
}

/// 将PostgreSQL行转换为列名映射
#[cfg(feature = "postgres-support")]
fn postgres_row_to_map(row: &sqlx::postgres::PgRow) -> LiveQueryResult<Row> {
    let mut map = HashMap::with_capacity(row.len());

    for column in row.columns() {
        let idx = column.ordinal();
        let type_name = column.type_info().name();
        let value = match type_name {
            "INT2" => read_column!(row, idx, i16, |v| DataValue::Int(v as i64)),
            "INT4" => read_column!(row, idx, i32, |v| DataValue::Int(v as i64)),
            "INT8" => read_column!(row, idx, i64, DataValue::Int),
            "FLOAT4" => read_column!(row, idx, f32, |v| DataValue::Float(v as f64)),
            "FLOAT8" => read_column!(row, idx, f64, DataValue::Float),
            "BOOL" => read_column!(row, idx, bool, DataValue::Bool),
            "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => {
                read_column!(row, idx, String, DataValue::String)
            }
            "UUID" => read_column!(row, idx, uuid::Uuid, DataValue::Uuid),
            "JSON" | "JSONB" => read_column!(
                row,
                idx,
                serde_json::Value,
                crate::types::json_value_to_data_value
            ),
            "TIMESTAMPTZ" => read_column!(row, idx, chrono::DateTime<chrono::Utc>, |v| {
                DataValue::DateTime(v.fixed_offset())
            }),
            "TIMESTAMP" => read_column!(row, idx, chrono::NaiveDateTime, |v| {
                DataValue::DateTime(v.and_utc().fixed_offset())
            }),
            "DATE" => read_column!(row, idx, chrono::NaiveDate, |v| DataValue::String(
                v.to_string()
            )),
            "BYTEA" => read_column!(row, idx, Vec<u8>, DataValue::Bytes),
            other => match row.try_get::<Option<String>, _>(idx) {
                Ok(value) => Ok(value.map(DataValue::String).unwrap_or(DataValue::Null)),
                Err(_) => {
                    warn!("PostgreSQL列 {} 的类型 {} 无法转换，返回空值", column.name(), other);
                    Ok(DataValue::Null)
                }
            },
        }
        .map_err(|e| decode_error(column.name(), e))?;

        map.insert(column.name().to_string(), value);
    }

    Ok(map)
}

/// 将MySQL行转换为列名映射
#[cfg(feature = "mysql-support")]
fn mysql_row_to_map(row: &sqlx::mysql::MySqlRow) -> LiveQueryResult<Row> {
    let mut map = HashMap::with_capacity(row.len());

    for column in row.columns() {
        let idx = column.ordinal();
        let type_name = column.type_info().name();
        let value = match type_name {
            "BOOLEAN" => read_column!(row, idx, bool, DataValue::Bool),
            "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
                read_column!(row, idx, i64, DataValue::Int)
            }
            name if name.ends_with("UNSIGNED") => read_column!(row, idx, u64, DataValue::UInt),
            "FLOAT" => read_column!(row, idx, f32, |v| DataValue::Float(v as f64)),
            "DOUBLE" => read_column!(row, idx, f64, DataValue::Float),
            "DECIMAL" => read_column_unchecked!(row, idx, String, DataValue::String),
            "JSON" => read_column!(
                row,
                idx,
                serde_json::Value,
                crate::types::json_value_to_data_value
            ),
            "DATETIME" | "TIMESTAMP" => read_column!(row, idx, chrono::NaiveDateTime, |v| {
                DataValue::DateTime(v.and_utc().fixed_offset())
            }),
            "DATE" => read_column!(row, idx, chrono::NaiveDate, |v| DataValue::String(
                v.to_string()
            )),
            "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" => {
                read_column!(row, idx, Vec<u8>, DataValue::Bytes)
            }
            other => match row.try_get_unchecked::<Option<String>, _>(idx) {
                Ok(value) => Ok(value.map(DataValue::String).unwrap_or(DataValue::Null)),
                Err(_) => {
                    warn!("MySQL列 {} 的类型 {} 无法转换，返回空值", column.name(), other);
                    Ok(DataValue::Null)
                }
            },
        }
        .map_err(|e| decode_error(column.name(), e))?;

        map.insert(column.name().to_string(), value);
    }

    Ok(map)
}
