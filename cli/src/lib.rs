mod cli;
mod event_processor;
mod prompter;

use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::Context;
pub use cli::Cli;
use event_processor::Control;
use event_processor::EventProcessor;
use prompter::TtyPrompter;
use sable_core::approval::UserPrompter;
use sable_core::config::Config;
use sable_core::config::ConfigOverrides;
use sable_core::runloop::Op;
use sable_core::runloop::Sable;
use sable_core::session_index::SessionIndex;
use sable_core::util::notify_on_sigint;
use sable_protocol::workspace_key;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tracing::debug;
use tracing_subscriber::EnvFilter;

pub async fn run_main(cli: Cli) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let workspace = match &cli.workspace {
        Some(dir) => Some(dir.canonicalize().with_context(|| {
            format!("workspace directory {} does not exist", dir.display())
        })?),
        None => None,
    };

    let overrides = ConfigOverrides {
        workspace,
        app_name: cli.app.clone(),
        model: cli.model.clone(),
        provider_id: cli.provider.clone(),
        permission_mode: cli.permission_mode.map(Into::into),
        sandbox_type: cli.sandbox_type.clone(),
        safe_commands: cli.safe_commands.clone(),
        stream: cli.stream.map(Into::into),
        thinking_mode: cli.thinking_mode.map(Into::into),
        thinking_budget: cli.thinking_budget,
        reasoning_effort: cli.reasoning_effort.map(Into::into),
        compact_watermark: cli.compact_watermark,
        context_window_tokens: cli.context_window,
        session_id: cli.session.clone(),
    };
    let config = Config::load(overrides)?;
    let index_path = config.session_index_path();
    let key = workspace_key(&config.workspace);

    let prompter: Option<Arc<dyn UserPrompter>> = if std::io::stdin().is_terminal() {
        Some(Arc::new(TtyPrompter))
    } else {
        None
    };

    let (agent, session) = Sable::spawn(config, prompter).await?;
    debug!("session {session} ready");

    let sigint = notify_on_sigint();
    let agent = Arc::new(agent);
    {
        let agent = Arc::clone(&agent);
        let sigint = Arc::clone(&sigint);
        tokio::spawn(async move {
            loop {
                sigint.notified().await;
                let _ = agent.submit(Op::Interrupt).await;
            }
        });
    }

    match cli.input {
        Some(input) => run_one_shot(&agent, input).await,
        None => run_interactive(&agent, &index_path, &key).await,
    }
}

async fn run_one_shot(agent: &Sable, input: String) -> anyhow::Result<()> {
    agent.submit(Op::UserTurn { text: input }).await?;
    let mut processor = EventProcessor::default();
    loop {
        let event = agent.next_event().await?;
        match processor.process(event) {
            Control::Continue => {}
            Control::TurnDone => break,
            Control::Shutdown => break,
        }
    }
    agent.submit(Op::Shutdown).await?;
    drain_until_shutdown(agent).await
}

async fn run_interactive(
    agent: &Sable,
    index_path: &std::path::Path,
    workspace_key: &str,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut processor = EventProcessor::default();

    loop {
        eprint!("> ");
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        match line.as_str() {
            "/quit" | "/exit" => break,
            "/sessions" => {
                list_sessions(index_path, workspace_key);
                continue;
            }
            "/compact" => {
                agent.submit(Op::Compact).await?;
            }
            _ => {
                agent.submit(Op::UserTurn { text: line }).await?;
            }
        }

        loop {
            let event = agent.next_event().await?;
            match processor.process(event) {
                Control::Continue => {}
                Control::TurnDone => break,
                Control::Shutdown => return Ok(()),
            }
        }
    }

    agent.submit(Op::Shutdown).await?;
    drain_until_shutdown(agent).await
}

async fn drain_until_shutdown(agent: &Sable) -> anyhow::Result<()> {
    let mut processor = EventProcessor::default();
    loop {
        let event = agent.next_event().await?;
        if processor.process(event) == Control::Shutdown {
            return Ok(());
        }
    }
}

/// `/sessions`: read the index directly; it is advisory metadata, not run
/// state.
fn list_sessions(index_path: &std::path::Path, workspace_key: &str) {
    match SessionIndex::open(index_path) {
        Ok(index) => {
            let sessions = index.list(workspace_key);
            if sessions.is_empty() {
                eprintln!("no recorded sessions for this workspace");
            }
            for session in sessions {
                eprintln!(
                    "{}  {}  {} events  {}",
                    session.session_id,
                    session.last_event_at,
                    session.event_count,
                    session.last_user_message
                );
            }
        }
        Err(e) => eprintln!("session index unavailable: {e}"),
    }
}
