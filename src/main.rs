//! 入口：初始化日志与配置，执行单个目标
//!
//! 交互式界面与 REPL 是独立的消费端；这个二进制只提供最小 CLI：
//! --goal 一次性执行并打印总结。目标失败退出码仍为 0（失败体现在
//! 输出里），只有初始化失败才非零退出。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use open_harness::config::load_config;
use open_harness::core::GoalOrchestrator;
use open_harness::events::EventBus;
use open_harness::llm::{HttpLlmClient, ModelRouter};
use open_harness::observability;

#[derive(Parser, Debug)]
#[command(name = "open-harness", about = "Self-driving agent harness for weak local LLMs")]
struct Args {
    /// 配置文件路径（默认按 open_harness.yaml 发现规则查找）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 模型分层：small / medium / large
    #[arg(long)]
    tier: Option<String>,

    /// 要执行的目标
    #[arg(long)]
    goal: Option<String>,

    #[arg(long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    observability::init(args.verbose);

    let mut config = load_config(args.config.clone()).context("failed to load configuration")?;
    if let Some(tier) = &args.tier {
        config.llm.default_tier = tier.clone();
    }

    let workspace = std::env::current_dir().context("cannot resolve working directory")?;
    let bus = EventBus::new();
    let cancel = CancellationToken::new();

    // Ctrl-C 触发取消：循环在下一个检查点停下，子进程被终止
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling current goal");
                cancel.cancel();
            }
        });
    }

    let router = ModelRouter::new(config.llm.tiers.clone());
    let client = HttpLlmClient::new(
        config.llm.base_url.clone(),
        config.llm.api_key.clone(),
        router,
        std::time::Duration::from_secs(config.llm.request_timeout_secs),
        bus.clone(),
        cancel.clone(),
    )
    .context("failed to build LLM client")?;

    let Some(goal) = args.goal else {
        eprintln!("nothing to do: pass --goal \"...\" (the interactive shells live in their own binaries)");
        return Ok(());
    };

    let mut orchestrator =
        GoalOrchestrator::new(config, workspace, Arc::new(client), bus, cancel);
    let report = orchestrator.run_goal(&goal).await;
    println!("{}", report.summary);

    Ok(())
}
