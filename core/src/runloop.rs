//! Run loop orchestrator: drives model → tool → model cycles for one
//! session, streaming chunks out as they arrive and recording every step in
//! the event log. Operates as a queue pair: submissions in, run events out.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_channel::Receiver;
use async_channel::Sender;
use futures::StreamExt;
use sable_protocol::Event;
use sable_protocol::EventMeta;
use sable_protocol::Lifecycle;
use sable_protocol::Message;
use sable_protocol::SessionId;
use sable_protocol::meta;
use sable_protocol::workspace_key;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::approval::ApprovalBroker;
use crate::approval::UserPrompter;
use crate::client_common::Prompt;
use crate::client_common::ReasoningControls;
use crate::client_common::ResponseChunk;
use crate::compact;
use crate::config::Config;
use crate::context;
use crate::error::Result;
use crate::error::SableErr;
use crate::exec::ExecRouter;
use crate::exec::build_candidates;
use crate::policy::ExecutionPolicy;
use crate::providers::ModelClient;
use crate::session_index::SessionIndex;
use crate::store::EventStore;
use crate::tools::ToolContext;
use crate::tools::ToolRegistry;

/// Base instructions prepended to every model request.
const BASE_INSTRUCTIONS: &str = include_str!("prompt.md");

/// Requests from the front-end.
#[derive(Debug, Clone)]
pub struct Submission {
    pub id: String,
    pub op: Op,
}

#[derive(Debug, Clone)]
pub enum Op {
    /// One user turn of input text.
    UserTurn { text: String },
    /// Explicit `/compact`.
    Compact,
    /// Abort the in-flight turn.
    Interrupt,
    Shutdown,
}

/// Events streamed back to the front-end renderer.
#[derive(Debug, Clone)]
pub struct RunEvent {
    pub id: String,
    pub msg: RunEventMsg,
}

#[derive(Debug, Clone)]
pub enum RunEventMsg {
    SessionConfigured { model: String, session_id: String },
    TurnStarted,
    AnswerDelta(String),
    ReasoningDelta(String),
    ToolCallBegin { call_id: String, name: String },
    ToolCallEnd { call_id: String, name: String, ok: bool },
    TurnComplete { text: String },
    Compacted { skipped: bool },
    Canceled,
    Error { message: String, code: String },
    ShutdownComplete,
}

/// The high-level interface to one session runtime: send submissions,
/// receive run events.
pub struct Sable {
    next_id: AtomicU64,
    tx_sub: Sender<Submission>,
    rx_event: Receiver<RunEvent>,
}

impl Sable {
    /// Build the whole runtime for `config` and start the submission loop.
    pub async fn spawn(
        config: Config,
        prompter: Option<Arc<dyn UserPrompter>>,
    ) -> Result<(Sable, SessionId)> {
        let session = SessionId::new(
            config.app_name.clone(),
            "local",
            config
                .session_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        )
        .map_err(|e| SableErr::StoreWrite(e.to_string()))?;

        let key = workspace_key(&config.workspace);
        let store = EventStore::new(config.sessions_dir(), &key);
        store.get_or_create(&session).await?;

        let policy = ExecutionPolicy::new(
            config.permission_mode,
            config.sandbox_type.clone(),
            config.safe_commands.clone(),
        );
        let broker = Arc::new(ApprovalBroker::new(&config.safe_commands, prompter));
        let candidates =
            build_candidates(config.sandbox_type.as_deref(), &config.workspace, &policy)?;
        let router = Arc::new(
            ExecRouter::new(policy, candidates, broker, config.workspace.clone()).await,
        );

        let index = match SessionIndex::open(&config.session_index_path()) {
            Ok(index) => Some(index),
            Err(e) => {
                warn!("session index unavailable: {e}");
                None
            }
        };

        let inner = Arc::new(RuntimeInner {
            client: ModelClient::new(config.provider.clone(), config.model.clone()),
            store,
            session: session.clone(),
            registry: Arc::new(ToolRegistry::builtin()),
            router,
            index,
            workspace_key: key,
            config,
            current_turn: Mutex::new(None),
        });

        let (tx_sub, rx_sub) = async_channel::bounded(64);
        let (tx_event, rx_event) = async_channel::bounded(64);
        tokio::spawn(submission_loop(inner, rx_sub, tx_event));

        Ok((
            Sable {
                next_id: AtomicU64::new(0),
                tx_sub,
                rx_event,
            },
            session,
        ))
    }

    pub async fn submit(&self, op: Op) -> Result<String> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let sub = Submission { id: id.clone(), op };
        self.tx_sub
            .send(sub)
            .await
            .map_err(|_| SableErr::InternalRunLoopDied)?;
        Ok(id)
    }

    pub async fn next_event(&self) -> Result<RunEvent> {
        self.rx_event
            .recv()
            .await
            .map_err(|_| SableErr::InternalRunLoopDied)
    }
}

struct RuntimeInner {
    client: ModelClient,
    store: EventStore,
    session: SessionId,
    registry: Arc<ToolRegistry>,
    router: Arc<ExecRouter>,
    index: Option<SessionIndex>,
    workspace_key: String,
    config: Config,
    /// `(submission id, cancel token)` while a turn is running. One turn at
    /// a time per session; the lock is not reentrant.
    current_turn: Mutex<Option<(String, CancellationToken)>>,
}

impl RuntimeInner {
    fn try_claim_turn(&self, sub_id: &str) -> Result<CancellationToken> {
        let mut guard = self
            .current_turn
            .lock()
            .map_err(|_| SableErr::InternalRunLoopDied)?;
        if guard.is_some() {
            return Err(SableErr::SessionBusy);
        }
        let cancel = CancellationToken::new();
        *guard = Some((sub_id.to_string(), cancel.clone()));
        Ok(cancel)
    }

    fn release_turn(&self, sub_id: &str) {
        if let Ok(mut guard) = self.current_turn.lock()
            && guard.as_ref().is_some_and(|(id, _)| id == sub_id)
        {
            guard.take();
        }
    }

    fn interrupt(&self) {
        if let Ok(guard) = self.current_turn.lock()
            && let Some((_, cancel)) = guard.as_ref()
        {
            cancel.cancel();
        }
    }

    async fn append(&self, event: &Event) -> Result<()> {
        self.store.append_event(&self.session, event).await
    }

    async fn append_lifecycle(&self, lifecycle: Lifecycle) -> Result<()> {
        let event =
            Event::new(&self.session, Message::system("")).with_meta(lifecycle.into_meta());
        self.append(&event).await
    }

    fn reasoning_controls(&self) -> ReasoningControls {
        ReasoningControls {
            mode: self.config.thinking_mode,
            budget_tokens: self.config.thinking_budget,
            effort: self.config.reasoning_effort,
        }
    }

    /// Window messages with the base instructions up front.
    async fn build_prompt(&self, stream: bool) -> Result<Prompt> {
        let events = self
            .store
            .list_context_window_events(&self.session)
            .await?;
        let mut messages = vec![Message::system(BASE_INSTRUCTIONS)];
        messages.extend(context::build_messages(&events));
        Ok(Prompt {
            messages,
            tools: self.registry.definitions(),
            stream,
            reasoning: self.reasoning_controls(),
        })
    }

    async fn update_index(&self, last_user_message: &str) {
        let Some(index) = &self.index else {
            return;
        };
        let event_count = self
            .store
            .list_events(&self.session)
            .await
            .map(|events| events.len())
            .unwrap_or(0);
        index.record_turn(
            &self.workspace_key,
            &self.session,
            &self.config.workspace.to_string_lossy(),
            last_user_message,
            event_count as u64,
        );
    }
}

async fn submission_loop(
    inner: Arc<RuntimeInner>,
    rx_sub: Receiver<Submission>,
    tx_event: Sender<RunEvent>,
) {
    let _ = tx_event
        .send(RunEvent {
            id: "session".to_string(),
            msg: RunEventMsg::SessionConfigured {
                model: inner.client.model().to_string(),
                session_id: inner.session.id.clone(),
            },
        })
        .await;

    while let Ok(sub) = rx_sub.recv().await {
        match sub.op {
            Op::Interrupt => inner.interrupt(),
            Op::Shutdown => {
                if let Err(e) = inner.router.close().await {
                    warn!("failed to close sandbox: {e}");
                }
                let _ = tx_event
                    .send(RunEvent {
                        id: sub.id,
                        msg: RunEventMsg::ShutdownComplete,
                    })
                    .await;
                break;
            }
            Op::Compact => {
                let inner = Arc::clone(&inner);
                let tx_event = tx_event.clone();
                tokio::spawn(async move {
                    let skipped = match compact::run(
                        &inner.store,
                        &inner.session,
                        &inner.client,
                        inner.reasoning_controls(),
                    )
                    .await
                    {
                        Ok(event) => event.is_none(),
                        Err(e) => {
                            send_error(&tx_event, &sub.id, &e).await;
                            return;
                        }
                    };
                    let _ = tx_event
                        .send(RunEvent {
                            id: sub.id,
                            msg: RunEventMsg::Compacted { skipped },
                        })
                        .await;
                });
            }
            Op::UserTurn { text } => {
                let cancel = match inner.try_claim_turn(&sub.id) {
                    Ok(cancel) => cancel,
                    Err(e) => {
                        send_error(&tx_event, &sub.id, &e).await;
                        continue;
                    }
                };
                let inner = Arc::clone(&inner);
                let tx_event = tx_event.clone();
                tokio::spawn(async move {
                    let sub_id = sub.id.clone();
                    run_turn(&inner, &tx_event, &sub_id, text, cancel).await;
                    inner.release_turn(&sub_id);
                });
            }
        }
    }
    info!("submission loop exited");
}

async fn send_error(tx_event: &Sender<RunEvent>, sub_id: &str, e: &SableErr) {
    let _ = tx_event
        .send(RunEvent {
            id: sub_id.to_string(),
            msg: RunEventMsg::Error {
                message: e.to_string(),
                code: e.code().to_string(),
            },
        })
        .await;
}

/// One user turn: compact if the window is over the watermark, append the
/// user event, then cycle model → tools → model until the model stops
/// calling tools or the turn dies.
async fn run_turn(
    inner: &Arc<RuntimeInner>,
    tx_event: &Sender<RunEvent>,
    sub_id: &str,
    text: String,
    cancel: CancellationToken,
) {
    if let Err(e) = turn_body(inner, tx_event, sub_id, &text, &cancel).await {
        if cancel.is_cancelled() {
            record_canceled(inner, tx_event, sub_id).await;
            return;
        }
        error!("turn failed: {e}");
        let lifecycle = match &e {
            SableErr::ApprovalRequired { .. } | SableErr::ApprovalAborted { .. } => {
                Lifecycle::waiting_approval(e.to_string(), e.code())
            }
            _ => Lifecycle::failed(e.to_string(), e.code()),
        };
        if let Err(log_err) = inner.append_lifecycle(lifecycle).await {
            error!("failed to record failed lifecycle: {log_err}");
        }
        send_error(tx_event, sub_id, &e).await;
    }
}

async fn record_canceled(inner: &Arc<RuntimeInner>, tx_event: &Sender<RunEvent>, sub_id: &str) {
    if let Err(e) = inner.append_lifecycle(Lifecycle::canceled()).await {
        error!("failed to record canceled lifecycle: {e}");
    }
    let _ = tx_event
        .send(RunEvent {
            id: sub_id.to_string(),
            msg: RunEventMsg::Canceled,
        })
        .await;
}

async fn turn_body(
    inner: &Arc<RuntimeInner>,
    tx_event: &Sender<RunEvent>,
    sub_id: &str,
    text: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    // Compaction check before the turn grows the window further.
    let prompt = inner.build_prompt(inner.config.stream).await?;
    let usage = context::usage(&prompt.messages, inner.config.context_window_tokens);
    if usage.over_watermark(inner.config.compact_watermark) {
        info!(
            "window at {:.0}% of budget, compacting",
            usage.ratio * 100.0
        );
        compact::run(
            &inner.store,
            &inner.session,
            &inner.client,
            inner.reasoning_controls(),
        )
        .await?;
    }

    inner
        .append(&Event::new(&inner.session, Message::user(text)))
        .await?;
    inner.append_lifecycle(Lifecycle::running()).await?;
    let _ = tx_event
        .send(RunEvent {
            id: sub_id.to_string(),
            msg: RunEventMsg::TurnStarted,
        })
        .await;

    let final_text = tool_loop(inner, tx_event, sub_id, cancel).await?;

    inner.append_lifecycle(Lifecycle::completed()).await?;
    inner.update_index(text).await;
    let _ = tx_event
        .send(RunEvent {
            id: sub_id.to_string(),
            msg: RunEventMsg::TurnComplete { text: final_text },
        })
        .await;
    Ok(())
}

/// The model/tool cycle. Returns the text of the final assistant message.
async fn tool_loop(
    inner: &Arc<RuntimeInner>,
    tx_event: &Sender<RunEvent>,
    sub_id: &str,
    cancel: &CancellationToken,
) -> Result<String> {
    loop {
        let prompt = inner.build_prompt(inner.config.stream).await?;
        let mut stream = inner.client.generate(&prompt).await?;

        let mut completed: Option<Message> = None;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    // Dropping the stream aborts the HTTP request.
                    return Err(SableErr::Stream("turn canceled".into(), None));
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            match chunk? {
                ResponseChunk::TextDelta(delta) => {
                    inner
                        .append(&partial_event(&inner.session, &delta, meta::CHANNEL_ANSWER))
                        .await?;
                    let _ = tx_event
                        .send(RunEvent {
                            id: sub_id.to_string(),
                            msg: RunEventMsg::AnswerDelta(delta),
                        })
                        .await;
                }
                ResponseChunk::ReasoningDelta(delta) => {
                    inner
                        .append(&partial_event(
                            &inner.session,
                            &delta,
                            meta::CHANNEL_REASONING,
                        ))
                        .await?;
                    let _ = tx_event
                        .send(RunEvent {
                            id: sub_id.to_string(),
                            msg: RunEventMsg::ReasoningDelta(delta),
                        })
                        .await;
                }
                ResponseChunk::TurnComplete { message, .. } => {
                    completed = Some(message);
                }
            }
        }

        let Some(message) = completed else {
            return Err(SableErr::ProviderDecode(
                "stream ended without a final message".into(),
            ));
        };

        // The merged message, stripped of the partial flag.
        inner
            .append(&Event::new(&inner.session, message.clone()))
            .await?;

        let tool_calls = message.tool_calls().to_vec();
        if tool_calls.is_empty() {
            return Ok(message.text().to_string());
        }

        // Dispatch sequentially in emission order; the next model call sees
        // every response.
        for call in &tool_calls {
            let _ = tx_event
                .send(RunEvent {
                    id: sub_id.to_string(),
                    msg: RunEventMsg::ToolCallBegin {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                    },
                })
                .await;

            let mut ctx = ToolContext::new(inner.config.workspace.clone());
            ctx.router = Some(Arc::clone(&inner.router));
            ctx.cancel = cancel.clone();
            ctx.registry = Arc::downgrade(&inner.registry);
            let response = inner.registry.dispatch(&ctx, call).await;
            let ok = !response.result.contains_key("error");

            inner
                .append(&Event::new(
                    &inner.session,
                    Message::tool(response.clone()),
                ))
                .await?;
            let _ = tx_event
                .send(RunEvent {
                    id: sub_id.to_string(),
                    msg: RunEventMsg::ToolCallEnd {
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        ok,
                    },
                })
                .await;

            if cancel.is_cancelled() {
                return Err(SableErr::Stream("turn canceled".into(), None));
            }
        }
    }
}

fn partial_event(session: &SessionId, delta: &str, channel: &str) -> Event {
    let mut meta_map = EventMeta::new();
    meta_map.insert(meta::PARTIAL.to_string(), Value::Bool(true));
    meta_map.insert(
        meta::CHANNEL.to_string(),
        Value::String(channel.to_string()),
    );
    meta_map.insert(
        meta::CONTRACT_VERSION.to_string(),
        Value::String(meta::CONTRACT_V1.to_string()),
    );
    let message = match channel {
        meta::CHANNEL_REASONING => Message::Assistant {
            text: String::new(),
            reasoning: delta.to_string(),
            tool_calls: Vec::new(),
        },
        _ => Message::assistant(delta),
    };
    Event::new(session, message).with_meta(meta_map)
}

/// True when the log obeys the pairing invariant: every tool response id
/// matches exactly one earlier assistant tool call.
pub fn tool_responses_are_paired(events: &[Event]) -> bool {
    let mut call_ids = std::collections::HashSet::new();
    for event in events {
        for call in event.message.tool_calls() {
            call_ids.insert(call.id.clone());
        }
        if let Message::Tool { tool_response } = &event.message
            && !call_ids.contains(&tool_response.id)
        {
            return false;
        }
    }
    true
}
