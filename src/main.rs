//! Hive 命令行入口
//!
//! ```text
//! hive run <文本 | workflow.json | workflow.toml> [--config path]
//! hive plan <文本 | workflow.json | workflow.toml> [--config path]
//! hive agents [--config path]
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use hive::config::load_config;
use hive::core::ExecutionContext;
use hive::planner::IntentModel;
use hive::{observability, Director};

const USAGE: &str = "usage: hive <run|plan|agents> [input] [--config path]";

struct Cli {
    command: String,
    input: Option<String>,
    config: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Cli> {
    let mut args = std::env::args().skip(1);
    let command = args.next().context(USAGE)?;
    let mut input = None;
    let mut config = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config = Some(PathBuf::from(args.next().context("--config needs a path")?));
            }
            _ if input.is_none() => input = Some(arg),
            other => bail!("unexpected argument '{}'\n{}", other, USAGE),
        }
    }
    Ok(Cli { command, input, config })
}

enum Submission {
    Text(String),
    Workflow(IntentModel),
}

/// 输入是已存在的文件时读取内容；`.toml` 文件按声明式工作流解析
fn read_submission(input: &str) -> anyhow::Result<Submission> {
    let path = Path::new(input);
    if !path.is_file() {
        return Ok(Submission::Text(input.to_string()));
    }
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", input))?;
    if path.extension().and_then(|e| e.to_str()) == Some("toml") {
        let intent = IntentModel::from_toml_str(&content).map_err(anyhow::Error::msg)?;
        return Ok(Submission::Workflow(intent));
    }
    Ok(Submission::Text(content))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cli = parse_args()?;
    let config = load_config(cli.config).context("Failed to load config")?;
    let director = Director::builder(config)
        .build()
        .await
        .context("Failed to build director")?;
    director.shutdown_manager().listen_for_signals();
    let background = director.start_background();

    let context = ExecutionContext::for_user("cli");
    let outcome = run_command(&director, &context, cli.command.as_str(), cli.input).await;

    director.shutdown().await;
    let _ = background.await;
    outcome
}

async fn run_command(
    director: &Director,
    context: &ExecutionContext,
    command: &str,
    input: Option<String>,
) -> anyhow::Result<()> {
    match command {
        "run" => {
            let input = input.context(USAGE)?;
            let report = match read_submission(&input)? {
                Submission::Text(text) => director.submit_task(&text, context).await,
                Submission::Workflow(intent) => director.submit_workflow(&intent, context).await,
            }
            .context("Task failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        "plan" => {
            let input = input.context(USAGE)?;
            let plan = match read_submission(&input)? {
                Submission::Text(text) => director.plan(&text, context).await?,
                Submission::Workflow(intent) => director.plan_workflow(&intent, context).await?,
            };
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(())
        }
        "agents" => {
            for agent in director.agents().await {
                let capabilities: Vec<&str> = agent
                    .descriptor
                    .capabilities
                    .iter()
                    .map(|c| c.name.as_str())
                    .collect();
                println!(
                    "{}\t{:?}\tin_flight={}\tsuccess_rate={:.2}\t{}",
                    agent.descriptor.agent_id,
                    agent.health,
                    agent.in_flight,
                    agent.success_rate,
                    capabilities.join(",")
                );
            }
            Ok(())
        }
        other => bail!("unknown command '{}'\n{}", other, USAGE),
    }
}
