use anyhow::{anyhow, Result};
use clap::Parser;
use drivesync_lib::core::Direction;
use drivesync_lib::logging::{LogConfig, SizeRotatingWriter};
use drivesync_lib::storage::create_remote;
use drivesync_lib::{SyncConfig, SyncEngine};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// 在云端存储和本地目录之间同步文件
#[derive(Debug, Parser)]
#[command(name = "drivesync", version)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// 同步方向: down, up, both
    #[arg(short, long, default_value = "down")]
    direction: Direction,

    /// 只统计，不做任何修改
    #[arg(long)]
    dry_run: bool,

    /// 只输出同步计划（JSON）
    #[arg(long)]
    plan_only: bool,
}

/// 初始化日志系统，返回的 guard 需要保持到程序退出
fn init_logging(config: &LogConfig) -> Option<WorkerGuard> {
    if !config.enabled {
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return None;
    }

    // 创建日志级别过滤器
    let mut env_filter = EnvFilter::from_default_env().add_directive(config.tracing_level().into());
    for directive in ["opendal=warn", "hyper=warn"] {
        if let Ok(d) = directive.parse() {
            env_filter = env_filter.add_directive(d);
        }
    }

    let file_writer = match SizeRotatingWriter::new(&config.log_dir(), config.max_size_mb) {
        Ok(writer) => writer,
        Err(e) => {
            // 文件日志创建失败，回退到控制台
            eprintln!("无法创建日志文件: {}", e);
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            return None;
        }
    };

    let (writer, guard) = tracing_appender::non_blocking(file_writer);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    // 在 debug 模式下也输出到控制台
    #[cfg(debug_assertions)]
    {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false);

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer);

        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    #[cfg(not(debug_assertions))]
    {
        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer);

        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    Some(guard)
}

async fn run(cli: Cli, config: SyncConfig) -> Result<bool> {
    let remote_config = config
        .remote
        .clone()
        .ok_or_else(|| anyhow!("config file has no \"remote\" section"))?;
    let remote = create_remote(&remote_config).await?;
    info!("远程存储: {}", remote.name());

    let engine = SyncEngine::new(config, remote)?;

    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，正在取消同步...");
            cancel.cancel();
        }
    });

    let plan = engine.create_sync_plan().await?;
    println!("同步计划: {}", plan.summary());

    if cli.plan_only {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(true);
    }

    for conflict in &plan.conflicts {
        println!(
            "冲突: {} <-> {} (较新: {})",
            conflict.remote.path,
            conflict.local.path,
            conflict.newer_side()
        );
    }

    for conflict in &plan.type_conflicts {
        println!(
            "类型冲突（未处理）: {} <-> {}",
            conflict.remote.path(),
            conflict.local.path()
        );
    }

    let stats = engine.execute_plan(&plan, cli.direction, cli.dry_run).await;
    println!("[{}] {}", stats.run_id, stats);

    for phase in &stats.skipped_phases {
        eprintln!("  跳过阶段: {}", phase.name());
    }

    for item in stats.failed_items() {
        if let drivesync_lib::core::ItemOutcome::Failed(e) = &item.outcome {
            eprintln!("  失败 {} {}: {}", item.action, item.path, e);
        }
    }

    Ok(stats.is_success())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match SyncConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("配置错误: {}", e);
            return ExitCode::from(2);
        }
    };

    // 初始化日志系统
    let _guard = init_logging(&config.log);

    match run(cli, config).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("同步失败: {:#}", e);
            eprintln!("同步失败: {:#}", e);
            ExitCode::from(2)
        }
    }
}
