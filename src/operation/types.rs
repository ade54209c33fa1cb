//! 操作类型定义

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::LiveQueryResult;
use crate::types::DataValue;

/// 结果行：列名 -> 值
pub type Row = HashMap<String, DataValue>;

/// 参数声明类型
///
/// 未声明类型的参数按 NVarChar 绑定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ParamType {
    /// 通用文本（默认）
    #[default]
    NVarChar,
    /// 非 Unicode 文本
    VarChar,
    /// 32 位整数
    Int,
    /// 64 位整数
    BigInt,
    /// 布尔位
    Bit,
    /// 浮点数
    Float,
    /// 日期时间
    DateTime,
    /// UUID
    UniqueIdentifier,
    /// JSON 文档
    Json,
    /// 二进制
    VarBinary,
}

/// 命名参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// 参数名（不含 @ 前缀）
    pub name: String,
    /// 声明类型
    #[serde(default, rename = "type")]
    pub param_type: ParamType,
    /// 参数值
    #[serde(default = "null_value")]
    pub value: DataValue,
}

fn null_value() -> DataValue {
    DataValue::Null
}

impl Parameter {
    /// 创建参数，类型默认为 NVarChar
    pub fn new(name: impl Into<String>, value: impl Into<DataValue>) -> Self {
        let name = name.into();
        Self {
            name: name.trim_start_matches('@').to_string(),
            param_type: ParamType::default(),
            value: value.into(),
        }
    }

    /// 创建带显式类型的参数
    pub fn typed(name: impl Into<String>, param_type: ParamType, value: impl Into<DataValue>) -> Self {
        Self {
            param_type,
            ..Self::new(name, value)
        }
    }

    /// 按声明类型转换参数值，用于绑定
    pub fn coerce(&self) -> LiveQueryResult<DataValue> {
        if self.value.is_null() {
            return Ok(DataValue::Null);
        }

        let mismatch = || {
            crate::quick_error!(
                validation,
                self.name.as_str(),
                format!("值 {} 无法转换为 {:?}", self.value, self.param_type)
            )
        };

        let coerced = match self.param_type {
            ParamType::NVarChar | ParamType::VarChar => match &self.value {
                DataValue::String(s) => DataValue::String(s.clone()),
                other => DataValue::String(other.to_string()),
            },
            ParamType::Int => {
                let value = self.value.as_i64().ok_or_else(mismatch)?;
                i32::try_from(value).map_err(|_| mismatch())?;
                DataValue::Int(value)
            }
            ParamType::BigInt => DataValue::Int(self.value.as_i64().ok_or_else(mismatch)?),
            ParamType::Bit => DataValue::Bool(self.value.as_bool().ok_or_else(mismatch)?),
            ParamType::Float => DataValue::Float(self.value.as_f64().ok_or_else(mismatch)?),
            ParamType::DateTime => match &self.value {
                DataValue::DateTime(dt) => DataValue::DateTime(*dt),
                DataValue::String(s) => chrono::DateTime::parse_from_rfc3339(s)
                    .map(DataValue::DateTime)
                    .map_err(|_| mismatch())?,
                DataValue::Int(secs) => chrono::DateTime::from_timestamp(*secs, 0)
                    .map(DataValue::from)
                    .ok_or_else(mismatch)?,
                _ => return Err(mismatch()),
            },
            ParamType::UniqueIdentifier => match &self.value {
                DataValue::Uuid(u) => DataValue::Uuid(*u),
                DataValue::String(s) => s
                    .parse::<uuid::Uuid>()
                    .map(DataValue::Uuid)
                    .map_err(|_| mismatch())?,
                _ => return Err(mismatch()),
            },
            ParamType::Json => DataValue::Json(self.value.to_json_value()),
            ParamType::VarBinary => match &self.value {
                DataValue::Bytes(b) => DataValue::Bytes(b.clone()),
                DataValue::String(s) => BASE64
                    .decode(s.as_bytes())
                    .map(DataValue::Bytes)
                    .map_err(|_| mismatch())?,
                _ => return Err(mismatch()),
            },
        };

        Ok(coerced)
    }
}

/// 操作目标：查询文本或存储过程名
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationTarget {
    /// SQL 查询文本，参数以 @name 引用
    Query(String),
    /// 存储过程名（可带 schema 前缀）
    Procedure(String),
}

impl OperationTarget {
    /// 目标文本
    pub fn text(&self) -> &str {
        match self {
            OperationTarget::Query(text) => text,
            OperationTarget::Procedure(name) => name,
        }
    }

    /// 是否为存储过程调用
    pub fn is_procedure(&self) -> bool {
        matches!(self, OperationTarget::Procedure(_))
    }

    /// 日志用的截断文本（最多 200 个字符）
    pub fn log_preview(&self) -> String {
        const PREVIEW_CHARS: usize = 200;
        let text = self.text();
        if text.chars().count() > PREVIEW_CHARS {
            let head: String = text.chars().take(PREVIEW_CHARS).collect();
            format!("{}...", head)
        } else {
            text.to_string()
        }
    }
}

/// 操作请求，提交后不可变
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub(crate) target: OperationTarget,
    pub(crate) params: Vec<Parameter>,
    pub(crate) timeout: Option<Duration>,
}

impl OperationRequest {
    /// 创建查询请求构建器
    pub fn query(text: impl Into<String>) -> super::OperationBuilder {
        super::OperationBuilder::new(OperationTarget::Query(text.into()))
    }

    /// 创建存储过程请求构建器
    pub fn procedure(name: impl Into<String>) -> super::OperationBuilder {
        super::OperationBuilder::new(OperationTarget::Procedure(name.into()))
    }

    /// 操作目标
    pub fn target(&self) -> &OperationTarget {
        &self.target
    }

    /// 有序参数列表
    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    /// 执行时限
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// 操作执行结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OperationResult {
    /// 按到达顺序排列的结果行
    pub rows: Vec<Row>,
    /// 驱动报告的行数（查询为返回行数，写操作为影响行数）
    pub row_count: u64,
    /// 执行耗时（毫秒）
    pub elapsed_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untyped_parameter_binds_as_text() {
        let param: Parameter = serde_json::from_str(r#"{"name": "deptId", "value": 1}"#).unwrap();
        assert_eq!(param.param_type, ParamType::NVarChar);
        assert_eq!(param.coerce().unwrap(), DataValue::String("1".to_string()));
    }

    #[test]
    fn test_typed_parameter_coercion() {
        let param = Parameter::typed("@userId", ParamType::Int, "123");
        assert_eq!(param.name, "userId");
        assert_eq!(param.coerce().unwrap(), DataValue::Int(123));

        let flag = Parameter::typed("includeInactive", ParamType::Bit, false);
        assert_eq!(flag.coerce().unwrap(), DataValue::Bool(false));

        let overflow = Parameter::typed("n", ParamType::Int, i64::MAX);
        assert!(overflow.coerce().is_err());

        let bad = Parameter::typed("id", ParamType::UniqueIdentifier, "not-a-uuid");
        assert!(bad.coerce().is_err());
    }

    #[test]
    fn test_target_wire_format() {
        let target: OperationTarget = serde_json::from_str(r#"{"procedure": "GetUserDetails"}"#).unwrap();
        assert!(target.is_procedure());
        assert_eq!(target.text(), "GetUserDetails");

        let long = OperationTarget::Query("x".repeat(300));
        assert_eq!(long.log_preview().chars().count(), 203);
    }
}
