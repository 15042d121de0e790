//! mega-api 命令行
//!
//! 入口：加载配置、初始化日志，逐条发送命令并打印响应；若通知循环在运行，
//! 持续打印动作批次直到 Ctrl+C / SIGTERM 或通知流中断，最后关闭会话。
//!
//! ```bash
//! mega-api --sid <SID> --keepalive '{"a":"ug"}'
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use mega_api::api::{ApiSession, NotificationEvent};
use mega_api::config::load_config;
use mega_api::observability;
use mega_api::shutdown::{ShutdownReason, ShutdownSignal};
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(name = "mega-api", version, about = "Send MEGA API commands and follow action packets")]
struct Arguments {
    /// 额外的 TOML 配置文件
    #[arg(long)]
    config: Option<PathBuf>,

    /// 会话标识（覆盖配置）
    #[arg(long)]
    sid: Option<String>,

    /// 命令响应带 sn 时自动跟随通知流
    #[arg(long)]
    keepalive: bool,

    /// 直接从该游标开始跟随通知流
    #[arg(long)]
    sn: Option<String>,

    /// JSON 命令，按顺序发送
    commands: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Arguments::parse();

    let mut cfg = load_config(args.config.clone()).context("Failed to load config")?;
    if args.sid.is_some() {
        cfg.api.sid = args.sid.clone();
    }
    if args.keepalive {
        cfg.api.keepalive = true;
    }
    observability::init(&cfg.log.filter);

    let session = ApiSession::from_config(&cfg);
    // 先订阅，避免错过首条命令触发的批次
    let mut events = session.subscribe();

    let mut failed_commands = 0usize;
    for raw in &args.commands {
        let command: Value = serde_json::from_str(raw)
            .with_context(|| format!("Invalid command JSON: {raw}"))?;
        match session.request(&command).await {
            Ok(response) => println!("{response}"),
            Err(e) => {
                tracing::error!("command {} failed: {}", raw, e);
                failed_commands += 1;
            }
        }
    }

    if let Some(sn) = args.sn {
        session.start_notifications(sn).await;
    }

    let shutdown = ShutdownSignal::new();
    if session.is_notifying().await {
        shutdown.listen_for_signals();
        tracing::info!("Following action packets, press Ctrl+C to stop");

        loop {
            tokio::select! {
                reason = shutdown.triggered() => {
                    if let Some(reason) = reason {
                        tracing::info!("Stopping notification stream: {}", reason);
                    }
                    break;
                }
                event = events.recv() => match event {
                    Some(NotificationEvent::Actions(batch)) => {
                        println!("{}", serde_json::to_string(&batch)?);
                    }
                    Some(NotificationEvent::Failed(err)) => {
                        shutdown.trigger(ShutdownReason::StreamFailed(err.to_string()));
                        break;
                    }
                    None => break,
                },
            }
        }
    }

    session.close().await;

    match shutdown.reason() {
        Some(reason) if reason.is_failure() => anyhow::bail!("{reason}"),
        Some(reason) => tracing::info!("Session closed: {}", reason),
        None => {}
    }
    if failed_commands > 0 {
        anyhow::bail!("{failed_commands} command(s) failed");
    }
    Ok(())
}
