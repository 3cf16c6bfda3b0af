//! Persistent conversational context, addressed by opaque id or composite
//! session key. Each session is backed by an append-only JSONL file; the only
//! rewrite is compaction.

use crate::errors::{CodedError, ErrorCode};
use crate::utils::{atomic_write, ensure_dir, safe_filename};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const DEFAULT_COMPACT_KEEP: usize = 50;
pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    User,
    Thought,
    Tool,
    Result,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub content: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl SessionEntry {
    pub fn new(kind: EntryKind, content: Value) -> Self {
        Self {
            kind,
            content,
            timestamp: Utc::now(),
            metadata: None,
        }
    }
}

/// First line of every session file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionMeta {
    #[serde(rename = "_type")]
    kind: String,
    id: String,
    session_key: String,
    agent_id: String,
    user_id: String,
    channel_id: String,
    channel_session_id: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub session_key: String,
    pub agent_id: String,
    pub user_id: String,
    pub channel_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub entry_count: usize,
}

#[derive(Debug)]
struct SessionState {
    entries: Vec<SessionEntry>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub session_key: String,
    pub agent_id: String,
    pub user_id: String,
    pub channel_id: String,
    pub channel_session_id: String,
    pub created_at: DateTime<Utc>,
    path: PathBuf,
    state: Mutex<SessionState>,
}

pub fn session_key(agent_id: &str, channel_session_id: &str) -> String {
    format!("agent:{}:session:{}", agent_id, channel_session_id)
}

impl Session {
    /// Append an entry and write it through to the session file. Timestamps
    /// are clamped so the log stays non-decreasing even if the caller's clock
    /// briefly steps backwards.
    pub fn append(&self, mut entry: SessionEntry) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(last) = state.entries.last()
            && entry.timestamp < last.timestamp
        {
            entry.timestamp = last.timestamp;
        }
        let line = serde_json::to_string(&entry)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open session file {}", self.path.display()))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        state.updated_at = entry.timestamp;
        state.entries.push(entry);
        Ok(())
    }

    /// Last `n` entries, oldest first.
    pub fn history(&self, n: usize) -> Vec<SessionEntry> {
        let state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let start = state.entries.len().saturating_sub(n);
        state.entries[start..].to_vec()
    }

    pub fn entry_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .updated_at
    }

    fn meta(&self) -> SessionMeta {
        SessionMeta {
            kind: "meta".to_string(),
            id: self.id.clone(),
            session_key: self.session_key.clone(),
            agent_id: self.agent_id.clone(),
            user_id: self.user_id.clone(),
            channel_id: self.channel_id.clone(),
            channel_session_id: self.channel_session_id.clone(),
            created_at: self.created_at,
        }
    }

    /// Drop all but the last `keep` entries and rewrite the file atomically.
    /// Relative order and timestamps of retained entries are untouched.
    pub fn compact(&self, keep: usize) -> Result<usize> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let drop_count = state.entries.len().saturating_sub(keep);
        if drop_count == 0 {
            return Ok(0);
        }
        state.entries.drain(..drop_count);

        let mut content = serde_json::to_string(&self.meta())?;
        content.push('\n');
        for entry in &state.entries {
            content.push_str(&serde_json::to_string(entry)?);
            content.push('\n');
        }
        atomic_write(&self.path, &content)?;
        Ok(drop_count)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            session_key: self.session_key.clone(),
            agent_id: self.agent_id.clone(),
            user_id: self.user_id.clone(),
            channel_id: self.channel_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at(),
            entry_count: self.entry_count(),
        }
    }
}

struct Index {
    by_id: HashMap<String, Arc<Session>>,
    by_key: HashMap<String, String>,
}

pub struct SessionStore {
    dir: PathBuf,
    compact_keep: usize,
    index: Mutex<Index>,
}

impl SessionStore {
    /// Open the store, indexing any session files already on disk.
    pub fn open(dir: PathBuf, compact_keep: usize) -> Result<Self> {
        ensure_dir(&dir)?;
        let store = Self {
            dir: dir.clone(),
            compact_keep,
            index: Mutex::new(Index {
                by_id: HashMap::new(),
                by_key: HashMap::new(),
            }),
        };
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "jsonl") {
                match Self::load(&path) {
                    Ok(session) => store.insert(Arc::new(session)),
                    Err(e) => tracing::warn!("skipping unreadable session {}: {}", path.display(), e),
                }
            }
        }
        Ok(store)
    }

    fn insert(&self, session: Arc<Session>) {
        let mut index = self
            .index
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        index
            .by_key
            .insert(session.session_key.clone(), session.id.clone());
        index.by_id.insert(session.id.clone(), session);
    }

    fn load(path: &std::path::Path) -> Result<Session> {
        let content = std::fs::read_to_string(path)?;
        let mut lines = content.lines().filter(|l| !l.trim().is_empty());
        let meta_line = lines.next().context("empty session file")?;
        let meta: SessionMeta =
            serde_json::from_str(meta_line).context("failed to parse session meta line")?;

        let mut entries = Vec::new();
        let mut updated_at = meta.created_at;
        for line in lines {
            let entry: SessionEntry =
                serde_json::from_str(line).context("failed to parse session entry")?;
            updated_at = entry.timestamp;
            entries.push(entry);
        }

        Ok(Session {
            id: meta.id,
            session_key: meta.session_key,
            agent_id: meta.agent_id,
            user_id: meta.user_id,
            channel_id: meta.channel_id,
            channel_session_id: meta.channel_session_id,
            created_at: meta.created_at,
            path: path.to_path_buf(),
            state: Mutex::new(SessionState {
                entries,
                updated_at,
            }),
        })
    }

    /// Look up or mint the session for a (agent, channel session) pair.
    pub fn get_or_create(
        &self,
        agent_id: &str,
        user_id: &str,
        channel_id: &str,
        channel_session_id: Option<&str>,
    ) -> Result<Arc<Session>> {
        let channel_session_id = channel_session_id.unwrap_or(channel_id);
        let key = session_key(agent_id, channel_session_id);
        if let Some(existing) = self.get_by_session_key(&key) {
            return Ok(existing);
        }

        let id = Uuid::new_v4().to_string();
        let path = self.dir.join(format!("{}.jsonl", safe_filename(&id)));
        let session = Session {
            id,
            session_key: key,
            agent_id: agent_id.to_string(),
            user_id: user_id.to_string(),
            channel_id: channel_id.to_string(),
            channel_session_id: channel_session_id.to_string(),
            created_at: Utc::now(),
            path: path.clone(),
            state: Mutex::new(SessionState {
                entries: Vec::new(),
                updated_at: Utc::now(),
            }),
        };
        let mut content = serde_json::to_string(&session.meta())?;
        content.push('\n');
        atomic_write(&path, &content)?;

        let session = Arc::new(session);
        self.insert(session.clone());
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.index
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .by_id
            .get(id)
            .cloned()
    }

    pub fn get_by_session_key(&self, key: &str) -> Option<Arc<Session>> {
        let index = self
            .index
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let id = index.by_key.get(key)?;
        index.by_id.get(id).cloned()
    }

    pub fn require(&self, id: &str) -> Result<Arc<Session>, CodedError> {
        self.get(id)
            .ok_or_else(|| CodedError::new(ErrorCode::SessionNotFound, "session not found"))
    }

    pub fn compact(&self, id: &str) -> Result<usize, CodedError> {
        let session = self.require(id)?;
        session
            .compact(self.compact_keep)
            .map_err(|e| CodedError::internal_error(format!("compaction failed: {}", e)))
    }

    /// Paginated summaries, most recently updated first. Page numbers are
    /// zero-based; page size is clamped to avoid unbounded payloads.
    pub fn list(&self, page: usize, page_size: Option<usize>) -> (Vec<SessionSummary>, usize) {
        let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let mut summaries: Vec<SessionSummary> = {
            let index = self
                .index
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            index.by_id.values().map(|s| s.summary()).collect()
        };
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        let total = summaries.len();
        let start = page.saturating_mul(page_size).min(total);
        let end = (start + page_size).min(total);
        (summaries[start..end].to_vec(), total)
    }

    /// Explicit eviction; the file stays on disk.
    pub fn evict(&self, id: &str) -> bool {
        let mut index = self
            .index
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(session) = index.by_id.remove(id) {
            index.by_key.remove(&session.session_key);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> SessionStore {
        SessionStore::open(dir.path().to_path_buf(), DEFAULT_COMPACT_KEEP).unwrap()
    }

    fn user_entry(text: &str) -> SessionEntry {
        SessionEntry::new(EntryKind::User, Value::String(text.to_string()))
    }

    #[test]
    fn composite_key_format() {
        assert_eq!(session_key("a", "c1"), "agent:a:session:c1");
    }

    #[test]
    fn get_or_create_is_idempotent_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let first = store.get_or_create("a", "u", "c1", None).unwrap();
        let second = store.get_or_create("a", "u2", "c1", None).unwrap();
        assert_eq!(first.id, second.id);

        let other_agent = store.get_or_create("b", "u", "c1", None).unwrap();
        assert_ne!(first.id, other_agent.id);
    }

    #[test]
    fn append_persists_and_reloads_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = store(&dir);
            let session = store.get_or_create("a", "u", "c1", None).unwrap();
            for i in 0..5 {
                session.append(user_entry(&format!("msg {}", i))).unwrap();
            }
            session.id.clone()
        };

        let store = store(&dir);
        let session = store.get(&id).expect("session should reload from disk");
        let history = session.history(10);
        assert_eq!(history.len(), 5);
        for (i, entry) in history.iter().enumerate() {
            assert_eq!(entry.content, Value::String(format!("msg {}", i)));
        }
    }

    #[test]
    fn timestamps_are_non_decreasing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let session = store.get_or_create("a", "u", "c1", None).unwrap();

        session.append(user_entry("first")).unwrap();
        let mut backdated = user_entry("second");
        backdated.timestamp = Utc::now() - chrono::Duration::hours(1);
        session.append(backdated).unwrap();

        let history = session.history(10);
        assert!(history[1].timestamp >= history[0].timestamp);
    }

    #[test]
    fn compaction_keeps_tail_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path().to_path_buf(), 3).unwrap();
        let session = store.get_or_create("a", "u", "c1", None).unwrap();
        for i in 0..10 {
            session.append(user_entry(&format!("msg {}", i))).unwrap();
        }

        let dropped = store.compact(&session.id).unwrap();
        assert_eq!(dropped, 7);
        let history = session.history(10);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content, Value::String("msg 7".into()));
        assert_eq!(history[2].content, Value::String("msg 9".into()));

        // Reload from disk and confirm the rewrite preserved everything.
        let store = SessionStore::open(dir.path().to_path_buf(), 3).unwrap();
        let reloaded = store.get(&session.id).unwrap();
        assert_eq!(reloaded.entry_count(), 3);
        assert_eq!(
            reloaded.history(1)[0].content,
            Value::String("msg 9".into())
        );
    }

    #[test]
    fn list_paginates_and_clamps() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        for i in 0..7 {
            store
                .get_or_create("a", "u", &format!("c{}", i), None)
                .unwrap();
        }

        let (page0, total) = store.list(0, Some(3));
        assert_eq!(total, 7);
        assert_eq!(page0.len(), 3);
        let (page2, _) = store.list(2, Some(3));
        assert_eq!(page2.len(), 1);
        let (beyond, _) = store.list(9, Some(3));
        assert!(beyond.is_empty());

        let (clamped, _) = store.list(0, Some(100_000));
        assert_eq!(clamped.len(), 7);
    }

    #[test]
    fn missing_session_is_session_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let err = store.require("nope").unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionNotFound);
    }

    #[test]
    fn evict_removes_from_index_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let session = store.get_or_create("a", "u", "c1", None).unwrap();
        assert!(store.evict(&session.id));
        assert!(store.get(&session.id).is_none());

        // Reopening finds the file again.
        let store = SessionStore::open(dir.path().to_path_buf(), DEFAULT_COMPACT_KEEP).unwrap();
        assert!(store.get(&session.id).is_some());
    }
}
