//! Durable append-only event log, partitioned per session under
//! `<home>/sessions/<workspace_key>/<session_id>/`. The store exclusively
//! owns the on-disk bytes; every other component appends through it and
//! borrows read views.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use sable_protocol::Event;
use sable_protocol::SessionId;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::Result;
use crate::error::SableErr;

const EVENTS_FILE: &str = "events.jsonl";
const META_FILE: &str = "meta.json";
const STATE_FILE: &str = "state.json";

#[derive(Debug, Serialize, Deserialize)]
struct SessionMeta {
    id: String,
    app_name: String,
    user_id: String,
    created_at: DateTime<Utc>,
}

pub struct EventStore {
    workspace_dir: PathBuf,
    // Serializes appends within this process; cross-process concurrency is
    // out of scope (single-user assumption).
    write_lock: Mutex<()>,
}

impl EventStore {
    /// `sessions_dir` is `<home>/sessions`; `workspace_key` partitions the
    /// log per workspace.
    pub fn new(sessions_dir: impl Into<PathBuf>, workspace_key: &str) -> Self {
        Self {
            workspace_dir: sessions_dir.into().join(workspace_key),
            write_lock: Mutex::new(()),
        }
    }

    pub fn session_dir(&self, session: &SessionId) -> PathBuf {
        self.workspace_dir.join(&session.id)
    }

    /// Idempotent: creates the per-session directory and writes `meta.json`
    /// on first call, then returns the same session untouched forever after.
    pub async fn get_or_create(&self, session: &SessionId) -> Result<SessionId> {
        let dir = self.session_dir(session);
        let _guard = self.write_lock.lock().await;
        std::fs::create_dir_all(&dir).map_err(store_write("create session dir"))?;

        let meta_path = dir.join(META_FILE);
        if !meta_path.exists() {
            let meta = SessionMeta {
                id: session.id.clone(),
                app_name: session.app_name.clone(),
                user_id: session.user_id.clone(),
                created_at: Utc::now(),
            };
            write_atomic(&dir, &meta_path, &serde_json::to_vec_pretty(&meta)?)?;
        }
        Ok(session.clone())
    }

    /// Atomic append of one line-delimited record.
    pub async fn append_event(&self, session: &SessionId, event: &Event) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let path = self.session_dir(session).join(EVENTS_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(store_write("open events log"))?;
        file.write_all(line.as_bytes())
            .map_err(store_write("append event"))?;
        file.flush().map_err(store_write("flush events log"))?;
        Ok(())
    }

    /// Full replay. Tolerates both one-record-per-line and concatenated
    /// records, and skips hand-edit damage instead of corrupting replay.
    pub async fn list_events(&self, session: &SessionId) -> Result<Vec<Event>> {
        let path = self.session_dir(session).join(EVENTS_FILE);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(parse_tolerant(&contents))
    }

    /// Window view: everything from the latest compaction event (inclusive)
    /// onward, or the whole log when no compaction exists. This is the single
    /// source of truth for what the model sees.
    pub async fn list_context_window_events(&self, session: &SessionId) -> Result<Vec<Event>> {
        let events = self.list_events(session).await?;
        Ok(window_view(events))
    }

    /// Optional key-value overlay for session-scoped state; absent file is an
    /// empty mapping.
    pub async fn snapshot_state(&self, session: &SessionId) -> Result<Map<String, Value>> {
        let path = self.session_dir(session).join(STATE_FILE);
        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(map) => Ok(map),
                Err(e) => {
                    warn!("ignoring malformed {}: {e}", path.display());
                    Ok(Map::new())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(e.into()),
        }
    }
}

pub(crate) fn window_view(events: Vec<Event>) -> Vec<Event> {
    match events.iter().rposition(Event::is_compaction) {
        Some(cut) => events[cut..].to_vec(),
        None => events,
    }
}

/// Stream-parse `contents`; on a malformed record, skip to the next line and
/// resume so one bad edit does not take out the rest of the log.
fn parse_tolerant(contents: &str) -> Vec<Event> {
    let mut events = Vec::new();
    let mut remaining = contents;
    loop {
        let mut iter = serde_json::Deserializer::from_str(remaining).into_iter::<Event>();
        let mut error_offset = None;
        while let Some(item) = iter.next() {
            match item {
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!("skipping malformed event record: {e}");
                    error_offset = Some(iter.byte_offset());
                    break;
                }
            }
        }
        let Some(offset) = error_offset else {
            break;
        };
        match remaining[offset..].find('\n') {
            Some(newline) => remaining = &remaining[offset + newline + 1..],
            None => break,
        }
    }
    events
}

fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(store_write("create temp file"))?;
    tmp.write_all(bytes).map_err(store_write("write temp file"))?;
    tmp.persist(path)
        .map_err(|e| SableErr::StoreWrite(format!("replace {}: {}", path.display(), e.error)))?;
    Ok(())
}

fn store_write(what: &'static str) -> impl Fn(std::io::Error) -> SableErr {
    move |e| SableErr::StoreWrite(format!("{what}: {e}"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;
    use sable_protocol::Lifecycle;
    use sable_protocol::Message;
    use sable_protocol::meta;

    use super::*;

    fn session() -> SessionId {
        SessionId::new("sable", "local", "store-test").unwrap()
    }

    fn store() -> (tempfile::TempDir, EventStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = EventStore::new(dir.path().join("sessions"), "ws");
        (dir, store)
    }

    fn compaction_event(session: &SessionId, text: &str) -> Event {
        let mut meta_map = sable_protocol::EventMeta::new();
        meta_map.insert(
            meta::KIND.to_string(),
            Value::String(meta::KIND_COMPACTION.to_string()),
        );
        Event::new(session, Message::system(text)).with_meta(meta_map)
    }

    #[tokio::test]
    async fn replay_preserves_append_order() {
        let (_tmp, store) = store();
        let session = store.get_or_create(&session()).await.unwrap();

        let appended: Vec<Event> = (0..5)
            .map(|i| Event::new(&session, Message::user(format!("turn {i}"))))
            .collect();
        for event in &appended {
            store.append_event(&session, event).await.unwrap();
        }

        let replayed = store.list_events(&session).await.unwrap();
        assert_eq!(appended, replayed);
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let (_tmp, store) = store();
        let first = store.get_or_create(&session()).await.unwrap();
        let second = store.get_or_create(&session()).await.unwrap();
        assert_eq!(first, second);
        assert!(store.session_dir(&first).join(META_FILE).exists());
    }

    #[tokio::test]
    async fn window_view_starts_at_latest_compaction() {
        let (_tmp, store) = store();
        let session = store.get_or_create(&session()).await.unwrap();

        store
            .append_event(&session, &Event::new(&session, Message::user("old")))
            .await
            .unwrap();
        let cut = compaction_event(&session, "summary");
        store.append_event(&session, &cut).await.unwrap();
        let tail = Event::new(&session, Message::user("new"));
        store.append_event(&session, &tail).await.unwrap();

        let window = store.list_context_window_events(&session).await.unwrap();
        assert_eq!(vec![cut, tail], window);
    }

    #[tokio::test]
    async fn replay_tolerates_concatenated_and_damaged_records() {
        let (_tmp, store) = store();
        let session = store.get_or_create(&session()).await.unwrap();

        let a = Event::new(&session, Message::user("a"));
        let b = Event::new(&session, Message::user("b"));
        let c = Event::new(&session, Message::user("c"));

        // Two records concatenated on one line, a garbage line, then a
        // normal line — the shapes a hand-edited log ends up with.
        let mut raw = String::new();
        raw.push_str(&serde_json::to_string(&a).unwrap());
        raw.push_str(&serde_json::to_string(&b).unwrap());
        raw.push('\n');
        raw.push_str("{not json}\n");
        raw.push_str(&serde_json::to_string(&c).unwrap());
        raw.push('\n');
        std::fs::write(store.session_dir(&session).join(EVENTS_FILE), raw).unwrap();

        let replayed = store.list_events(&session).await.unwrap();
        assert_eq!(vec![a, b, c], replayed);
    }

    #[tokio::test]
    async fn snapshot_state_defaults_to_empty() {
        let (_tmp, store) = store();
        let session = store.get_or_create(&session()).await.unwrap();
        assert!(store.snapshot_state(&session).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lifecycle_events_round_trip() {
        let (_tmp, store) = store();
        let session = store.get_or_create(&session()).await.unwrap();
        let event = Event::new(&session, Message::system(""))
            .with_meta(Lifecycle::running().into_meta());
        store.append_event(&session, &event).await.unwrap();

        let replayed = store.list_events(&session).await.unwrap();
        assert!(replayed[0].is_lifecycle());
        assert_eq!(
            sable_protocol::LifecycleStatus::Running,
            replayed[0].lifecycle().unwrap().status
        );
    }
}
