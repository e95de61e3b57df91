//! MealMind 命令行入口
//!
//! 用法：`mealmind [--config <path>] [--image <url>] <message...>`
//! 运行一轮对话并把响应 JSON 打印到 stdout。MEALMIND_USER / MEALMIND_CONVERSATION 选择用户与会话。

use std::path::PathBuf;

use anyhow::{bail, Context};
use mealmind::config::load_config_or_default;
use mealmind::core::OrchestratorBuilder;
use serde_json::json;

struct CliArgs {
    config: Option<PathBuf>,
    image: Option<String>,
    message: String,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut config = None;
    let mut image = None;
    let mut words = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config = Some(PathBuf::from(args.next().context("--config needs a path")?)),
            "--image" => image = Some(args.next().context("--image needs a URL")?),
            _ => words.push(arg),
        }
    }
    let message = words.join(" ");
    if message.trim().is_empty() {
        bail!("usage: mealmind [--config <path>] [--image <url>] <message...>");
    }
    Ok(CliArgs { config, image, message })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mealmind::observability::init();

    let args = parse_args()?;
    let cfg = load_config_or_default(args.config);
    let orchestrator = OrchestratorBuilder::new(cfg)
        .build()
        .await
        .context("Failed to build orchestrator")?;

    let user_id = std::env::var("MEALMIND_USER").unwrap_or_else(|_| "local-user".to_string());
    let conversation_id = std::env::var("MEALMIND_CONVERSATION").ok().filter(|c| !c.is_empty());
    let mut ctx = orchestrator
        .build_context(&user_id, conversation_id.as_deref())
        .await
        .context("Failed to load user context")?;
    if let Some(url) = args.image {
        ctx = ctx.with_metadata("image", json!({ "url": url }));
    }

    let response = orchestrator.process(&args.message, &ctx).await;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
