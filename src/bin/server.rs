//! rat_livequery 独立服务端
//!
//! 读取配置文件，初始化连接池与订阅管理器，并在 WebSocket 上提供订阅推送

use anyhow::Context;
use clap::Parser;
use rat_logger::{error, info};
use std::path::PathBuf;

use rat_livequery::{
    ConnectionPool, LiveQueryConfig, LoggingConfigBuilder, OperationExecutor, SubscriptionGateway,
    SubscriptionManager, init_logging,
};

#[derive(Parser, Debug)]
#[command(name = "rat_livequery_server")]
#[command(about = "数据库实时查询推送服务", long_about = None)]
struct Args {
    /// 配置文件路径（.toml 或 .json）
    #[arg(short, long, default_value = "livequery.toml")]
    config: PathBuf,

    /// 覆盖配置中的监听地址
    #[arg(long)]
    bind: Option<String>,

    /// 覆盖配置中的日志级别（error/warn/info/debug/trace）
    #[arg(long)]
    log_level: Option<String>,

    /// 不输出日志到控制台
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    rat_livequery::init();

    let config = LiveQueryConfig::from_file(&args.config)
        .with_context(|| format!("无法加载配置文件 {}", args.config.display()))?;
    let mut logging = LoggingConfigBuilder::from_config(&config.logging);
    if let Some(level) = &args.log_level {
        logging = logging.level_name(level);
    }
    if args.quiet {
        logging = logging.console(false);
    }
    init_logging(&logging.build()?)?;
    info!("启动 {}", rat_livequery::get_info());

    let pool = ConnectionPool::new(config.database.clone())?;
    pool.initialize().await.context("连接池初始化失败")?;

    let manager = SubscriptionManager::new(OperationExecutor::new(pool.clone()), config.subscription.clone());
    let gateway = SubscriptionGateway::new(manager.clone());

    let bind_addr = args.bind.unwrap_or_else(|| config.gateway.bind_addr.clone());
    let listener = SubscriptionGateway::bind(&bind_addr).await?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("监听退出信号失败: {}", e);
        }
    };
    gateway.serve(listener, shutdown).await?;

    info!("正在关闭服务");
    manager.shutdown().await;
    pool.close_all().await;
    info!("服务已停止");
    Ok(())
}
