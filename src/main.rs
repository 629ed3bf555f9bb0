//! Prowl 命令行入口
//!
//! 初始化日志、加载配置、创建会话与编排器并运行到终止；无论结果如何都写出运行报告。
//! 退出码：verified / exhausted / strategic-failure 为 0，编排错误为 1。

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;

use prowl::config::load_config;
use prowl::core::{new_session, write_report, Collaborators, Objective, Orchestrator, SessionSupervisor};
use prowl::react::LoopEvent;

#[derive(Debug, Parser)]
#[command(name = "prowl", version, about = "Orchestrates an LLM-driven penetration-testing loop against one target")]
struct Cli {
    /// 目标标识（URL、主机等）
    #[arg(long, env = "PROWL_TARGET")]
    target: String,

    /// 任务目标描述
    #[arg(long, default_value = "Find and submit the flag")]
    goal: String,

    /// 外部引用 id（题目编号等）
    #[arg(long)]
    reference_id: Option<String>,

    #[arg(long)]
    max_attempts: Option<u32>,

    /// 日志级别（RUST_LOG 优先）
    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long)]
    config: Option<PathBuf>,

    /// 运行报告目录
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    prowl::observability::init(&cli.log_level).context("Failed to initialise logging")?;

    let mut cfg = load_config(cli.config.clone()).context("Failed to load configuration")?;
    if let Some(n) = cli.max_attempts {
        cfg.control.max_attempts = n;
    }
    if let Some(dir) = cli.output_dir.clone() {
        cfg.app.output_dir = dir;
    }

    let mut objective = Objective::new(cli.target, cli.goal);
    if let Some(id) = cli.reference_id {
        objective = objective.with_reference_id(id);
    }
    let mut session = new_session(objective, &cfg);

    let collaborators = Collaborators::from_config(&cfg).context("Failed to set up collaborators")?;
    let supervisor = SessionSupervisor::new();
    supervisor.install_ctrl_c();

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<LoopEvent>();
    let event_log = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                tracing::debug!(event = %json, "loop event");
            }
        }
    });

    let orchestrator = Orchestrator::new(&cfg, collaborators)
        .with_cancel_token(supervisor.cancel_token())
        .with_events(event_tx);
    let outcome = orchestrator.run(&mut session.state).await;
    drop(orchestrator);
    let _ = event_log.await;

    let report = write_report(&cfg.app.output_dir, &session, &outcome).context("Failed to write run report")?;

    tracing::info!(
        status = %outcome.status,
        reason = %outcome.reason,
        result = outcome.result.as_deref().unwrap_or("-"),
        steps = outcome.steps,
        attempts = outcome.attempts,
        tokens = outcome.total_tokens().total,
        report = %report.display(),
        "run finished"
    );
    println!("status: {}", outcome.status);
    if let Some(result) = &outcome.result {
        println!("result: {result}");
    }
    println!("report: {}", report.display());

    Ok(ExitCode::from(outcome.status.exit_code()))
}
