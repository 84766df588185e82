use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use datasync::app::Application;
use datasync::shutdown::spawn_signal_handler;
use datasync_core::AppConfig;
use datasync_infrastructure::{init_logging, init_metrics};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = Command::new("datasync")
        .version(env!("CARGO_PKG_VERSION"))
        .about("数据同步作业调度系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时依次查找默认位置"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);

    // 加载配置
    let mut config = AppConfig::load(config_path).context("加载配置失败")?;
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format.clone();
    }
    if config.scheduler.instance_id.is_empty() {
        config.scheduler.instance_id = default_instance_id();
    }

    // 初始化日志系统
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;
    if config.observability.metrics_enabled {
        init_metrics(&config.observability.metrics_bind_address)?;
        info!(
            "Prometheus指标端点: {}",
            config.observability.metrics_bind_address
        );
    }

    info!("启动数据同步调度系统");
    info!("配置文件: {}", config_path.unwrap_or("<默认位置>"));
    info!(
        "调度器实例: {}，最大并发: {}",
        config.scheduler.instance_id, config.scheduler.max_workers
    );

    let app = Application::new(config).await?;

    let shutdown = CancellationToken::new();
    let signals = spawn_signal_handler(shutdown.clone());

    let run = app.run(shutdown.clone());
    tokio::pin!(run);

    let finished = tokio::select! {
        result = &mut run => Some(result),
        _ = shutdown.cancelled() => None,
    };
    let result = match finished {
        Some(result) => result,
        // 收到关闭信号后等待各组件退出
        None => match tokio::time::timeout(Duration::from_secs(30), run).await {
            Ok(result) => result,
            Err(_) => {
                warn!("应用关闭超时，强制退出");
                Ok(())
            }
        },
    };

    shutdown.cancel();
    if let Err(e) = signals.await {
        error!("信号监听任务异常退出: {}", e);
    }

    match &result {
        Ok(()) => info!("数据同步调度系统已退出"),
        Err(e) => error!("应用运行失败: {:#}", e),
    }
    result
}

fn default_instance_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{}-{}", host, std::process::id())
}
