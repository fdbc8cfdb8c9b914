//! Itinera CLI
//!
//! 用法：`itinera <video-url> [--session ID --owner ID] [--aggressive] [--config PATH]`
//! 运行一个回合：初始化日志与配置、装配编排器，打印过程事件，并把渲染的文档写入预览路径。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use itinera::config::load_config;
use itinera::core::{ShutdownManager, TurnRequest};
use itinera::memory::{CompactionMode, Message};
use itinera::session::SessionStatus;
use itinera::{Orchestrator, TurnEvent};
use tokio_util::sync::CancellationToken;

struct CliArgs {
    url: String,
    session: Option<String>,
    owner: Option<String>,
    aggressive: bool,
    config: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut url = None;
    let mut session = None;
    let mut owner = None;
    let mut aggressive = false;
    let mut config = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--session" => session = Some(args.next().context("--session needs a value")?),
            "--owner" => owner = Some(args.next().context("--owner needs a value")?),
            "--config" => config = Some(PathBuf::from(args.next().context("--config needs a value")?)),
            "--aggressive" => aggressive = true,
            flag if flag.starts_with("--") => bail!("unknown flag {flag}"),
            _ if url.is_none() => url = Some(arg),
            _ => bail!("unexpected argument {arg}"),
        }
    }
    let url = url.context("usage: itinera <video-url> [--session ID --owner ID] [--aggressive]")?;
    if session.is_some() != owner.is_some() {
        bail!("--session and --owner must be given together");
    }
    Ok(CliArgs {
        url,
        session,
        owner,
        aggressive,
        config,
    })
}

fn print_event(ev: &TurnEvent) {
    match ev {
        TurnEvent::StepUpdate { step, max_steps } => eprintln!("[step {}/{}]", step + 1, max_steps),
        TurnEvent::Thinking => eprintln!("  thinking..."),
        TurnEvent::Compacted { dropped } => eprintln!("  (compacted {dropped} earlier messages)"),
        TurnEvent::FallbackModel { model } => eprintln!("  switching to fallback model {model}"),
        TurnEvent::ToolCall { tool, args } => eprintln!("  -> {tool} {args}"),
        TurnEvent::Observation { tool, preview } => eprintln!("  <- {tool}: {preview}"),
        TurnEvent::ToolFailure { tool, reason } => eprintln!("  !! {tool}: {reason}"),
        TurnEvent::MessageChunk { text } => print!("{text}"),
        TurnEvent::MessageDone => println!(),
        TurnEvent::Stopped => eprintln!("Stopped."),
        TurnEvent::Error { text } => eprintln!("Error: {text}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    itinera::observability::init();
    let args = parse_args()?;

    let cfg = load_config(args.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        Default::default()
    });

    let mut builder = Orchestrator::builder(cfg.clone()).with_system_prompt_from_file();
    if args.session.is_some() {
        builder = attach_store(builder, &cfg).await?;
    }
    let orchestrator = builder.build();

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let cancel = shutdown.turn_token(&CancellationToken::new());

    let mut request = TurnRequest::new(vec![Message::user(format!(
        "Turn this travel video into an illustrated itinerary: {}",
        args.url
    ))]);
    if let (Some(session), Some(owner)) = (args.session, args.owner) {
        request = request.with_session(session, owner);
    }
    if args.aggressive {
        request = request.with_compaction(CompactionMode::Aggressive);
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            print_event(&ev);
        }
    });

    let result = orchestrator.run_turn(request, &cancel, Some(&tx)).await;
    drop(tx);
    let _ = printer.await;

    let outcome = result.map_err(|e| anyhow::anyhow!(e.user_message()))?;
    if outcome.status == SessionStatus::Cancelled {
        return Ok(());
    }
    if let Some(doc) = &outcome.document {
        let path = PathBuf::from(&doc.preview_path);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        std::fs::write(&path, &doc.markdown)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        eprintln!("Document v{} written to {}", doc.version, path.display());
    }
    let (prompt, completion, total) = orchestrator.executor().backends().token_usage();
    tracing::info!(prompt, completion, total, model = %outcome.model_used.label, "Token usage");
    Ok(())
}

#[cfg(feature = "async-sqlite")]
async fn attach_store(
    builder: itinera::OrchestratorBuilder,
    cfg: &itinera::config::AppConfig,
) -> anyhow::Result<itinera::OrchestratorBuilder> {
    use itinera::session::{MemorySessionStore, SqliteSessionStore};
    Ok(match &cfg.store.sqlite_path {
        Some(path) => builder.with_store(Arc::new(
            SqliteSessionStore::new(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?,
        )),
        None => builder.with_store(Arc::new(MemorySessionStore::new())),
    })
}

#[cfg(not(feature = "async-sqlite"))]
async fn attach_store(
    builder: itinera::OrchestratorBuilder,
    cfg: &itinera::config::AppConfig,
) -> anyhow::Result<itinera::OrchestratorBuilder> {
    use itinera::session::MemorySessionStore;
    if cfg.store.sqlite_path.is_some() {
        tracing::warn!("store.sqlite_path is set but the async-sqlite feature is off; using memory store");
    }
    Ok(builder.with_store(Arc::new(MemorySessionStore::new())))
}
