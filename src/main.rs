//! agentic-hub 命令行入口
//!
//! 初始化日志、加载配置、组装运行时并启动调度循环；标准输入每一行作为一轮用户输入。
//! 本地没有接入真实模型时使用 MockLlmClient（回显）。
//!
//! 命令：/reset 清空上下文栈，/stats 查看任务统计，/tasks 列出本线程任务，/quit 退出。

use std::path::PathBuf;
use std::sync::Arc;

use agentic_hub::agent::AgentRuntime;
use agentic_hub::config::load_config;
use agentic_hub::core::{AgentError, ShutdownManager, ShutdownReason};
use agentic_hub::llm::{MockLlmClient, ModelRegistry};
use agentic_hub::observability;
use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load configuration")?;

    let models = ModelRegistry::uniform(Arc::new(MockLlmClient));
    let runtime = AgentRuntime::from_config(&cfg, models)
        .await
        .context("Failed to create agent runtime")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    runtime.start_scheduler().await;

    let thread_id = std::env::var("HUB_THREAD").unwrap_or_else(|_| "cli".to_string());
    tracing::info!(thread_id = %thread_id, "ready, reading turns from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else {
            shutdown.shutdown(ShutdownReason::UserInitiated);
            break;
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        match text {
            "/quit" => {
                shutdown.shutdown(ShutdownReason::UserInitiated);
                break;
            }
            "/reset" => {
                runtime.machine.reset_thread(&thread_id).await;
                continue;
            }
            "/stats" => {
                let stats = runtime.scheduler.get_stats().await?;
                println!("{}", serde_json::to_string(&stats)?);
                continue;
            }
            "/tasks" => {
                for task in runtime.scheduler.tasks_for_thread(&thread_id).await? {
                    println!(
                        "{} {} {} {}",
                        task.id, task.task_type, task.status, task.scheduled_for
                    );
                }
                continue;
            }
            _ => {}
        }

        match runtime
            .process_message(&thread_id, text, None, shutdown.child_token())
            .await
        {
            Ok(turn) => {
                if let Some(e) = &turn.model_error {
                    eprintln!("model error: {e}");
                }
                println!("{}", turn.reply.unwrap_or_default());
            }
            Err(AgentError::Cancelled) => break,
            Err(e) => eprintln!("error: {e}"),
        }
    }

    tracing::info!(reason = ?shutdown.reason(), "stopping scheduler");
    runtime.shutdown().await;
    Ok(())
}
