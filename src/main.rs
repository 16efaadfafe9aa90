//! Agora 演示程序
//!
//! 入口：加载配置、初始化日志、打开一个会话，从 stdin 读指令 / 输入，把发给前端的消息打印到 stdout。
//!
//! 指令：`/cancel`、`/add <id>`、`/remove <id>`、`/switch <id>`、`/accept [id]`、`/reject`、`/status`、`/quit`；
//! 其余行作为用户输入（`@id` 开头即提及）。

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use agora::config::load_config;
use agora::core::{serve_until_shutdown, Shutdown, ShutdownReason};
use agora::message::{Body, Control, Envelope, Notice};
use agora::observability;
use agora::session::Session;
use agora::{FrontendPort, SessionHub};
use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

enum Flow {
    Continue,
    Quit,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖（写 stderr）
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;

    let shutdown = Shutdown::new();
    shutdown.listen_for_signals();
    let hub = SessionHub::from_config(&config).with_shutdown(shutdown.token());
    let session = hub
        .open(&config.app.session_id)
        .await
        .context("Failed to open session")?;
    let mut port = session.frontend().await.context("Failed to attach frontend")?;
    port.open(Vec::new()).await.context("Failed to request session open")?;

    println!(
        "{} session '{}' (/quit to exit, /status for state)",
        config.app.name,
        session.session_id()
    );

    let app = async {
        if let Err(e) = repl(&session, &mut port).await {
            tracing::error!("demo loop failed: {:#}", e);
            shutdown.trigger(ShutdownReason::Fatal(e.to_string()));
        }
    };
    let reason = serve_until_shutdown(&shutdown, &hub, Duration::from_secs(5), app).await;
    tracing::info!(%reason, "agora stopped");

    Ok(())
}

async fn repl(session: &Session, port: &mut FrontendPort) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            env = port.recv() => match env {
                Some(env) => print_envelope(&env),
                None => break,
            },
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if let Flow::Quit = handle_line(session, port, line.trim()).await? {
                    close_gracefully(port).await?;
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn handle_line(session: &Session, port: &mut FrontendPort, line: &str) -> anyhow::Result<Flow> {
    if line.is_empty() {
        return Ok(Flow::Continue);
    }
    let (cmd, arg) = match line.split_once(' ') {
        Some((cmd, arg)) => (cmd, Some(arg.trim()).filter(|a| !a.is_empty())),
        None => (line, None),
    };
    match (cmd, arg) {
        ("/quit", _) => return Ok(Flow::Quit),
        ("/cancel", reason) => port.cancel(reason.map(str::to_string)).await?,
        ("/add", Some(id)) => port.add_agent(id).await?,
        ("/remove", Some(id)) => port.remove_agent(id).await?,
        ("/switch", Some(id)) => port.switch_agent(id).await?,
        ("/accept", to) => port.accept_handover(to.map(str::to_string)).await?,
        ("/reject", reason) => port.reject_handover(reason.map(str::to_string)).await?,
        ("/status", _) => {
            let snapshot = session.snapshot();
            println!(
                "phase={:?} active={:?} speaking={:?} members={:?} pending={:?}",
                snapshot.phase,
                snapshot.active_agent_id,
                snapshot.speaking_agent_id,
                snapshot.members,
                snapshot.pending_transactions
            );
        }
        (c @ ("/add" | "/remove" | "/switch"), None) => {
            println!("usage: {} <agent_id>", c);
        }
        _ => {
            port.say(line).await?;
        }
    }
    Ok(Flow::Continue)
}

/// 走一遍 REQUEST_SESSION_CLOSE，最多等 3 秒
async fn close_gracefully(port: &mut FrontendPort) -> anyhow::Result<()> {
    port.close(Some("user quit".to_string())).await?;
    let wait = async {
        while let Some(env) = port.recv().await {
            print_envelope(&env);
            if matches!(env.body, Body::Control(Control::SessionClosed | Control::SessionFailed(_))) {
                break;
            }
        }
    };
    if tokio::time::timeout(Duration::from_secs(3), wait).await.is_err() {
        println!("session did not confirm close, shutting down anyway");
    }
    Ok(())
}

fn print_envelope(env: &Envelope) {
    match &env.body {
        Body::AgentOutput(chunk) => {
            print!("{}", chunk.text);
            if chunk.is_final {
                println!();
            }
            let _ = std::io::stdout().flush();
        }
        Body::Event(Notice::AgentStarted { .. }) => {}
        Body::Event(notice) => println!("· {}", describe_notice(notice)),
        Body::Error(report) => println!("! {}: {}", report.code, report.message),
        Body::Control(Control::SwitchAgent { .. }) => {}
        Body::Control(Control::HandoverUiPrompt {
            from_agent,
            to_agent,
            reason,
            summary,
        }) => {
            println!(
                "? {} wants to hand over to {} ({}){} - /accept or /reject",
                from_agent,
                to_agent,
                reason.as_deref().unwrap_or("no reason"),
                summary.as_deref().map(|s| format!(": {}", s)).unwrap_or_default()
            );
        }
        Body::Control(Control::SessionOpened { agents, active_agent_id }) => {
            let ids: Vec<&str> = agents.iter().map(|a| a.agent_id.as_str()).collect();
            println!("· session opened with [{}], active {:?}", ids.join(", "), active_agent_id);
        }
        Body::Control(Control::SessionClosed) => println!("· session closed"),
        Body::Control(Control::SessionFailed(failure)) => println!("! session failed: {}", failure.reason),
        other => println!("· {}:{}", other.event(), other.subtype()),
    }
}

fn describe_notice(notice: &Notice) -> String {
    match notice {
        Notice::TurnAccepted { target_agent_id } => format!("-> {}", target_agent_id),
        Notice::TurnCanceled { agent_id, forced } => {
            format!("{} canceled{}", agent_id, if *forced { " (forced)" } else { "" })
        }
        Notice::AgentAdded { profile } => format!("{} joined", profile.display_name),
        Notice::AgentRemoved { agent_id } => format!("{} left", agent_id),
        Notice::ActiveAgentChanged { from, to } => format!("active {:?} -> {:?}", from, to),
        Notice::NoSpeakingAgent => "nobody is speaking".to_string(),
        Notice::AgentStarted { agent_id } => format!("{} started", agent_id),
    }
}
