//! 命名参数改写
//!
//! 查询文本中以 @name 引用参数，执行前改写成目标方言的位置占位符，
//! 并给出按占位符顺序排列的参数列表。字符串字面量、带引号的标识符、
//! 行注释和 @@系统变量 保持原样

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use crate::error::LiveQueryResult;
use crate::operation::Parameter;

static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"'(?:[^']|'')*'|"(?:[^"]|"")*"|--[^\n]*|@@[A-Za-z_][A-Za-z0-9_]*|@[A-Za-z_][A-Za-z0-9_]*"#)
        .expect("占位符正则无效")
});

/// 占位符方言
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dialect {
    /// `?`，每次出现都单独绑定（SQLite、MySQL）
    Question,
    /// `$n`，同名参数复用同一位置（PostgreSQL）
    Dollar,
}

/// 改写查询文本，返回 (新文本, 绑定顺序)
pub(crate) fn rewrite_named<'p>(
    sql: &str,
    params: &'p [Parameter],
    dialect: Dialect,
) -> LiveQueryResult<(String, Vec<&'p Parameter>)> {
    let lookup: HashMap<String, &Parameter> = params
        .iter()
        .map(|p| (p.name.to_ascii_lowercase(), p))
        .collect();

    let mut output = String::with_capacity(sql.len());
    let mut order: Vec<&Parameter> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut last = 0;

    for token in TOKEN.find_iter(sql) {
        let text = token.as_str();
        output.push_str(&sql[last..token.start()]);
        last = token.end();

        if !text.starts_with('@') || text.starts_with("@@") {
            output.push_str(text);
            continue;
        }

        let key = text[1..].to_ascii_lowercase();
        let param = *lookup.get(&key).ok_or_else(|| {
            crate::quick_error!(
                validation,
                "parameters",
                crate::i18n::tf("error.unknown_parameter", &[("name", &text[1..])])
            )
        })?;

        match dialect {
            Dialect::Question => {
                order.push(param);
                output.push('?');
            }
            Dialect::Dollar => {
                let position = match positions.get(&key) {
                    Some(position) => *position,
                    None => {
                        order.push(param);
                        positions.insert(key, order.len());
                        order.len()
                    }
                };
                output.push('$');
                output.push_str(&position.to_string());
            }
        }
    }
    output.push_str(&sql[last..]);

    crate::debug_log!("命名参数改写完成: 绑定数量={}, SQL={}", order.len(), output);
    Ok((output, order))
}

/// 生成存储过程调用文本，参数按声明顺序绑定
pub(crate) fn procedure_call(name: &str, params: &[Parameter], dialect: Dialect) -> String {
    match dialect {
        Dialect::Question => {
            let marks = vec!["?"; params.len()].join(", ");
            format!("CALL {}({})", name, marks)
        }
        Dialect::Dollar => {
            let args: Vec<String> = params
                .iter()
                .enumerate()
                .map(|(i, p)| format!("{} => ${}", p.name, i + 1))
                .collect();
            format!("SELECT * FROM {}({})", name, args.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Vec<Parameter> {
        vec![Parameter::new("deptId", 1), Parameter::new("name", "x")]
    }

    #[test]
    fn test_question_dialect_binds_each_occurrence() {
        let params = params();
        let (sql, order) = rewrite_named(
            "SELECT * FROM Users WHERE DepartmentId = @deptId OR ParentId = @DEPTID AND Name = @name",
            &params,
            Dialect::Question,
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM Users WHERE DepartmentId = ? OR ParentId = ? AND Name = ?"
        );
        let names: Vec<_> = order.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["deptId", "deptId", "name"]);
    }

    #[test]
    fn test_dollar_dialect_reuses_positions() {
        let params = params();
        let (sql, order) = rewrite_named(
            "SELECT @name, @deptId, @name",
            &params,
            Dialect::Dollar,
        )
        .unwrap();
        assert_eq!(sql, "SELECT $1, $2, $1");
        assert_eq!(order.len(), 2);
    }

    #[test]
    fn test_literals_comments_and_system_variables_untouched() {
        let params = params();
        let (sql, order) = rewrite_named(
            "SELECT 'a@deptId', @@VERSION -- @name\nFROM t WHERE x = @deptId",
            &params,
            Dialect::Question,
        )
        .unwrap();
        assert_eq!(sql, "SELECT 'a@deptId', @@VERSION -- @name\nFROM t WHERE x = ?");
        assert_eq!(order.len(), 1);
    }

    #[test]
    fn test_unknown_parameter_is_rejected() {
        let params = params();
        assert!(rewrite_named("SELECT @missing", &params, Dialect::Question).is_err());
    }

    #[test]
    fn test_procedure_call_text() {
        let params = params();
        assert_eq!(
            procedure_call("GetUserDetails", &params, Dialect::Question),
            "CALL GetUserDetails(?, ?)"
        );
        assert_eq!(
            procedure_call("get_user_details", &params, Dialect::Dollar),
            "SELECT * FROM get_user_details(deptId => $1, name => $2)"
        );
    }
}
