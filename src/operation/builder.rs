//! 操作请求构建与校验

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::time::Duration;

use super::types::*;
use crate::error::LiveQueryResult;
use crate::types::DataValue;

/// 存储过程名：标识符，可带 schema 前缀（结构化校验，避免拼接注入）
static PROCEDURE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("存储过程名正则无效")
});

/// 参数名
static PARAM_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("参数名正则无效"));

/// 操作请求构建器
#[derive(Debug, Clone)]
pub struct OperationBuilder {
    request: OperationRequest,
}

impl OperationBuilder {
    /// 创建新的构建器
    pub fn new(target: OperationTarget) -> Self {
        Self {
            request: OperationRequest {
                target,
                params: Vec::new(),
                timeout: None,
            },
        }
    }

    /// 添加 NVarChar 参数
    pub fn param(mut self, name: &str, value: impl Into<DataValue>) -> Self {
        self.request.params.push(Parameter::new(name, value));
        self
    }

    /// 添加带类型的参数
    pub fn typed_param(mut self, name: &str, param_type: ParamType, value: impl Into<DataValue>) -> Self {
        self.request.params.push(Parameter::typed(name, param_type, value));
        self
    }

    /// 批量添加参数
    pub fn params(mut self, params: impl IntoIterator<Item = Parameter>) -> Self {
        self.request.params.extend(params);
        self
    }

    /// 设置执行时限
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.request.timeout = Some(timeout);
        self
    }

    /// 校验并构建请求
    pub fn build(self) -> LiveQueryResult<OperationRequest> {
        self.request.validate()?;
        Ok(self.request)
    }
}

impl OperationRequest {
    /// 验证请求是否有效
    pub fn validate(&self) -> LiveQueryResult<()> {
        match &self.target {
            OperationTarget::Query(text) if text.trim().is_empty() => {
                return Err(crate::quick_error!(validation, "query", "查询文本不能为空"));
            }
            OperationTarget::Procedure(name) if !PROCEDURE_NAME.is_match(name) => {
                return Err(crate::quick_error!(
                    validation,
                    "procedure_name",
                    format!("存储过程名称无效: {}", name)
                ));
            }
            _ => {}
        }

        let mut seen = HashSet::new();
        for param in &self.params {
            if !PARAM_NAME.is_match(&param.name) {
                return Err(crate::quick_error!(
                    validation,
                    "parameters",
                    format!("参数名称无效: {}", param.name)
                ));
            }
            if !seen.insert(param.name.to_ascii_lowercase()) {
                return Err(crate::quick_error!(
                    validation,
                    "parameters",
                    format!("参数重复: {}", param.name)
                ));
            }
        }

        if self.timeout == Some(Duration::ZERO) {
            return Err(crate::quick_error!(validation, "timeout", "执行时限不能为零"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_collects_params_in_order() {
        let request = OperationRequest::procedure("dbo.GetUserDetails")
            .typed_param("userId", ParamType::Int, 123)
            .typed_param("includeInactive", ParamType::Bit, false)
            .build()
            .unwrap();

        let names: Vec<_> = request.params().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["userId", "includeInactive"]);
    }

    #[test]
    fn test_rejects_injected_procedure_name() {
        let result = OperationRequest::procedure("GetUser; DROP TABLE users").build();
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_duplicate_and_blank() {
        assert!(OperationRequest::query("   ").build().is_err());
        assert!(
            OperationRequest::query("SELECT @a")
                .param("a", 1)
                .param("A", 2)
                .build()
                .is_err()
        );
    }
}
