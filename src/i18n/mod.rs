//! 多语言错误消息模块
//!
//! 使用rat_embed_lang框架提供统一的错误消息多语言支持

use once_cell::sync::OnceCell;
use rat_embed_lang::register_translations;
use std::collections::HashMap;

static REGISTERED: OnceCell<()> = OnceCell::new();

/// 错误消息翻译注册器
pub struct ErrorMessageI18n;

impl ErrorMessageI18n {
    /// 注册所有错误消息翻译
    pub fn register_all_translations() {
        let entries: &[(&str, &str, &str, &str)] = &[
            (
                "error.connection",
                "数据库连接失败: {message}",
                "Database connection failed: {message}",
                "データベース接続に失敗しました: {message}",
            ),
            (
                "error.acquisition_timeout",
                "等待可用连接超时 ({timeout_ms}ms)",
                "Timed out waiting for a connection ({timeout_ms}ms)",
                "接続の待機がタイムアウトしました ({timeout_ms}ms)",
            ),
            (
                "error.pool_exhausted",
                "连接池已满: 最大连接数={max}",
                "Connection pool exhausted: max connections={max}",
                "接続プールが枯渇しました: 最大接続数={max}",
            ),
            (
                "error.pool_closing",
                "连接池正在关闭",
                "Connection pool is closing",
                "接続プールはクローズ中です",
            ),
            (
                "error.operation",
                "操作执行失败: {message}",
                "Operation failed: {message}",
                "操作の実行に失敗しました: {message}",
            ),
            (
                "error.config",
                "配置错误: {message}",
                "Configuration error: {message}",
                "設定エラー: {message}",
            ),
            (
                "error.validation",
                "参数校验失败: {field} - {message}",
                "Validation failed: {field} - {message}",
                "検証に失敗しました: {field} - {message}",
            ),
            (
                "error.serialization",
                "数据序列化失败: {message}",
                "Data serialization failed: {message}",
                "データシリアライズが失敗しました: {message}",
            ),
            (
                "error.io",
                "IO错误: {message}",
                "IO error: {message}",
                "IOエラー: {message}",
            ),
            (
                "error.retries_exhausted",
                "连接 {id} 已连续失败 {retries} 次，需要重新创建",
                "Connection {id} failed {retries} consecutive times and must be recreated",
                "接続 {id} は {retries} 回連続で失敗したため再作成が必要です",
            ),
            (
                "error.unsupported_procedure",
                "{db_type} 不支持存储过程调用",
                "{db_type} does not support stored procedure calls",
                "{db_type} はストアドプロシージャ呼び出しをサポートしていません",
            ),
            (
                "error.unknown_parameter",
                "查询引用了未提供的参数 @{name}",
                "Query references parameter @{name} which was not supplied",
                "クエリが未指定のパラメータ @{name} を参照しています",
            ),
            (
                "error.operation_timeout",
                "操作执行超时 ({timeout_ms}ms)",
                "Operation timed out ({timeout_ms}ms)",
                "操作がタイムアウトしました ({timeout_ms}ms)",
            ),
            (
                "error.driver_not_enabled",
                "{db_type} 驱动未启用（需要开启相应的feature）",
                "{db_type} driver is not enabled (enable the matching feature)",
                "{db_type} ドライバーが有効ではありません（対応するfeatureを有効にしてください）",
            ),
            (
                "error.manager_closed",
                "订阅管理器已关闭",
                "Subscription manager has been shut down",
                "購読マネージャーは停止済みです",
            ),
        ];

        let mut translations = HashMap::new();
        for (key, zh, en, ja) in entries {
            let mut messages = HashMap::new();
            messages.insert("zh-CN".to_string(), zh.to_string());
            messages.insert("en-US".to_string(), en.to_string());
            messages.insert("ja-JP".to_string(), ja.to_string());
            translations.insert(key.to_string(), messages);
        }

        register_translations(translations);
    }

    /// 初始化错误消息多语言支持
    pub fn init() {
        ensure_registered();

        // 从环境变量获取语言设置，默认为zh-CN
        let lang = std::env::var("RAT_LANG")
            .or_else(|_| std::env::var("LANG"))
            .unwrap_or_else(|_| "zh-CN".to_string());

        use rat_embed_lang::normalize_language_code;
        let normalized_lang = normalize_language_code(&lang);
        set_language(&normalized_lang);
    }
}

/// 确保翻译表只注册一次
fn ensure_registered() {
    REGISTERED.get_or_init(ErrorMessageI18n::register_all_translations);
}

/// 翻译带参数的消息，首次调用时自动注册翻译表
pub fn tf(key: &str, args: &[(&str, &str)]) -> String {
    ensure_registered();
    rat_embed_lang::tf(key, args)
}

/// 翻译无参数的消息
pub fn t(key: &str) -> String {
    ensure_registered();
    rat_embed_lang::t(key)
}

/// 重新导出rat_embed_lang的语言控制函数
pub use rat_embed_lang::{current_language, set_language};
