//! Transcript and history reconciliation
//!
//! Merges streaming partial transcripts into an ordered, durable history:
//! at most one open (non-final) item per role at a time, deltas append to the
//! open item, finality closes it. Manually typed user messages are
//! deduplicated against the model's later transcription of the same text
//! (the protocol-confirmed copy wins). Snapshots persist through a debounced
//! upsert so bursts of updates collapse into one write.

use async_trait::async_trait;
use serde::Serialize;
use smallvec::{smallvec, SmallVec};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Quiet period before a pending snapshot is written.
pub const DEFAULT_PERSIST_DEBOUNCE: Duration = Duration::from_millis(800);

/// Error type for persistence operations
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("history upsert failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("history serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Message,
    FunctionCall,
    Breadcrumb,
}

/// One typed piece of an item's content. Audio parts carry the transcript of
/// what was spoken, not the audio itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputText { text: String },
    OutputText { text: String },
    InputAudio { transcript: String },
    OutputAudio { transcript: String },
}

impl ContentPart {
    fn text(&self) -> &str {
        match self {
            ContentPart::InputText { text } | ContentPart::OutputText { text } => text,
            ContentPart::InputAudio { transcript } | ContentPart::OutputAudio { transcript } => {
                transcript
            }
        }
    }

    fn append(&mut self, delta: &str) {
        match self {
            ContentPart::InputText { text } | ContentPart::OutputText { text } => {
                text.push_str(delta)
            }
            ContentPart::InputAudio { transcript } | ContentPart::OutputAudio { transcript } => {
                transcript.push_str(delta)
            }
        }
    }
}

/// A persisted, ordered unit of the conversation log.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub role: Role,
    pub parts: SmallVec<[ContentPart; 2]>,
    pub manual_input: bool,
    pub is_final: bool,
    pub created_at_ms: u64,
}

impl HistoryItem {
    /// The item's full text, for rendering and dedup matching.
    pub fn text(&self) -> String {
        self.parts.iter().map(|p| p.text()).collect()
    }
}

/// Where history snapshots go. Keyed by conversation so repeated writes
/// overwrite rather than duplicate.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn upsert(&self, conversation_key: &str, items: &[HistoryItem])
        -> Result<(), PersistenceError>;
}

/// Store that upserts to a conventional HTTP endpoint.
pub struct HttpHistoryStore {
    client: reqwest::Client,
    url: String,
}

impl HttpHistoryStore {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl HistoryStore for HttpHistoryStore {
    async fn upsert(
        &self,
        conversation_key: &str,
        items: &[HistoryItem],
    ) -> Result<(), PersistenceError> {
        let body = serde_json::json!({
            "conversationKey": conversation_key,
            "history": items,
        });
        self.client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Default dedup matcher: trim and collapse whitespace, then compare
/// exactly. Best-effort; transcription that differs in punctuation or casing
/// will not match.
pub fn texts_match(a: &str, b: &str) -> bool {
    let normalize = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
    normalize(a) == normalize(b)
}

struct LogInner {
    items: Vec<HistoryItem>,
    open_user: Option<usize>,
    open_model: Option<usize>,
    next_id: u64,
}

impl LogInner {
    fn open_slot(&mut self, role: Role) -> &mut Option<usize> {
        match role {
            Role::User => &mut self.open_user,
            Role::Model => &mut self.open_model,
        }
    }

    fn push(&mut self, item: HistoryItem) -> usize {
        self.items.push(item);
        self.items.len() - 1
    }

    fn mint_id(&mut self) -> String {
        let id = self.next_id;
        self.next_id += 1;
        format!("item-{}", id)
    }

    fn remove(&mut self, index: usize) {
        self.items.remove(index);
        for slot in [&mut self.open_user, &mut self.open_model] {
            if let Some(i) = slot {
                if *i > index {
                    *i -= 1;
                }
            }
        }
    }
}

/// The authoritative ordered conversation log with debounced persistence.
pub struct HistoryLog {
    inner: Arc<Mutex<LogInner>>,
    store: Arc<dyn HistoryStore>,
    conversation_key: String,
    debounce: Duration,
    matcher: fn(&str, &str) -> bool,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl HistoryLog {
    pub fn new(store: Arc<dyn HistoryStore>, conversation_key: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogInner {
                items: Vec::new(),
                open_user: None,
                open_model: None,
                next_id: 0,
            })),
            store,
            conversation_key: conversation_key.into(),
            debounce: DEFAULT_PERSIST_DEBOUNCE,
            matcher: texts_match,
            flush_task: Mutex::new(None),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Substitute the dedup text matcher.
    pub fn with_matcher(mut self, matcher: fn(&str, &str) -> bool) -> Self {
        self.matcher = matcher;
        self
    }

    /// Ordered snapshot of the log.
    pub fn items(&self) -> Vec<HistoryItem> {
        self.inner.lock().unwrap().items.clone()
    }

    /// Append an already-final user message typed by hand. Shown instantly
    /// even though the endpoint has not echoed it yet.
    pub fn append_manual(&self, text: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.mint_id();
            inner.push(HistoryItem {
                id,
                kind: ItemKind::Message,
                role: Role::User,
                parts: smallvec![ContentPart::InputText {
                    text: text.to_string(),
                }],
                manual_input: true,
                is_final: true,
                created_at_ms: now_ms(),
            });
        }
        self.schedule_flush();
    }

    /// Record a model-issued function call as a breadcrumb in the log.
    pub fn append_function_call(&self, name: &str, args: &serde_json::Value) {
        {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.mint_id();
            inner.push(HistoryItem {
                id,
                kind: ItemKind::FunctionCall,
                role: Role::Model,
                parts: smallvec![ContentPart::OutputText {
                    text: format!("{}({})", name, args),
                }],
                manual_input: false,
                is_final: true,
                created_at_ms: now_ms(),
            });
        }
        self.schedule_flush();
    }

    /// Append an app-level marker (e.g. "session started") that renderers
    /// may show or skip.
    pub fn append_breadcrumb(&self, text: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.mint_id();
            inner.push(HistoryItem {
                id,
                kind: ItemKind::Breadcrumb,
                role: Role::Model,
                parts: smallvec![ContentPart::OutputText {
                    text: text.to_string(),
                }],
                manual_input: false,
                is_final: true,
                created_at_ms: now_ms(),
            });
        }
        self.schedule_flush();
    }

    /// Apply one streaming transcription delta. Appends to the open item of
    /// that role, or opens a new one; finality closes the item.
    pub fn apply_transcription(&self, role: Role, delta: &str, is_final: bool) {
        let mut dedup_candidate = None;
        {
            let mut inner = self.inner.lock().unwrap();
            let open = *inner.open_slot(role);
            let index = match open {
                Some(i) if !inner.items[i].is_final => {
                    if let Some(part) = inner.items[i].parts.last_mut() {
                        part.append(delta);
                    }
                    i
                }
                _ => {
                    let id = inner.mint_id();
                    let part = match role {
                        Role::User => ContentPart::InputAudio {
                            transcript: delta.to_string(),
                        },
                        Role::Model => ContentPart::OutputAudio {
                            transcript: delta.to_string(),
                        },
                    };
                    let i = inner.push(HistoryItem {
                        id,
                        kind: ItemKind::Message,
                        role,
                        parts: smallvec![part],
                        manual_input: false,
                        is_final: false,
                        created_at_ms: now_ms(),
                    });
                    *inner.open_slot(role) = Some(i);
                    i
                }
            };

            if is_final {
                dedup_candidate = Self::finalize_index(&mut inner, index, self.matcher);
            }
        }
        if is_final {
            if let Some(removed) = dedup_candidate {
                debug!("deduplicated manual message {}", removed);
            }
            self.schedule_flush();
        }
    }

    /// Close the open item for one role, if any.
    pub fn finalize_role(&self, role: Role) {
        let finalized = {
            let mut inner = self.inner.lock().unwrap();
            match inner.open_slot(role).take() {
                Some(i) => {
                    Self::finalize_index(&mut inner, i, self.matcher);
                    true
                }
                None => false,
            }
        };
        if finalized {
            self.schedule_flush();
        }
    }

    /// Close both roles' open items (turn complete).
    pub fn finalize_all(&self) {
        self.finalize_role(Role::User);
        self.finalize_role(Role::Model);
    }

    /// Mark an item final and, for a model-transcribed user message, drop the
    /// earlier manual copy it confirms. Returns the id of the removed item.
    fn finalize_index(
        inner: &mut LogInner,
        index: usize,
        matcher: fn(&str, &str) -> bool,
    ) -> Option<String> {
        inner.items[index].is_final = true;
        let role = inner.items[index].role;
        *inner.open_slot(role) = None;

        if role != Role::User || inner.items[index].manual_input {
            return None;
        }

        let confirmed_text = inner.items[index].text();
        let duplicate = inner.items[..index].iter().rposition(|item| {
            item.manual_input
                && item.role == Role::User
                && item.is_final
                && matcher(&item.text(), &confirmed_text)
        });
        duplicate.map(|i| {
            let id = inner.items[i].id.clone();
            inner.remove(i);
            id
        })
    }

    /// Schedule a debounced snapshot write, replacing any pending one.
    fn schedule_flush(&self) {
        let inner = self.inner.clone();
        let store = self.store.clone();
        let key = self.conversation_key.clone();
        let debounce = self.debounce;

        let task = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let snapshot = inner.lock().unwrap().items.clone();
            if let Err(e) = store.upsert(&key, &snapshot).await {
                // Best effort: the live conversation continues either way.
                error!("history persist failed: {}", e);
            }
        });

        let mut slot = self.flush_task.lock().unwrap();
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    /// Cancel any pending write. Called on teardown so nothing persists
    /// after the session is gone.
    pub fn close(&self) {
        if let Some(task) = self.flush_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for HistoryLog {
    fn drop(&mut self) {
        self.close();
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every upsert for inspection.
    struct MemoryStore {
        writes: Mutex<Vec<Vec<HistoryItem>>>,
    }

    impl MemoryStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                writes: Mutex::new(Vec::new()),
            })
        }

        fn write_count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HistoryStore for MemoryStore {
        async fn upsert(
            &self,
            _conversation_key: &str,
            items: &[HistoryItem],
        ) -> Result<(), PersistenceError> {
            self.writes.lock().unwrap().push(items.to_vec());
            Ok(())
        }
    }

    fn log(store: Arc<MemoryStore>) -> HistoryLog {
        HistoryLog::new(store, "conv-1")
    }

    #[tokio::test]
    async fn test_deltas_accumulate_into_one_open_item() {
        let store = MemoryStore::new();
        let log = log(store);

        log.apply_transcription(Role::Model, "It's ", false);
        log.apply_transcription(Role::Model, "sunny", false);

        let items = log.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].text(), "It's sunny");
        assert!(!items[0].is_final);
    }

    #[tokio::test]
    async fn test_new_delta_after_finality_opens_a_new_item() {
        let store = MemoryStore::new();
        let log = log(store);

        log.apply_transcription(Role::Model, "first", true);
        log.apply_transcription(Role::Model, "second", false);

        let items = log.items();
        assert_eq!(items.len(), 2);
        assert!(items[0].is_final);
        assert!(!items[1].is_final);
        assert_eq!(items[1].text(), "second");
    }

    #[tokio::test]
    async fn test_roles_accumulate_independently() {
        let store = MemoryStore::new();
        let log = log(store);

        log.apply_transcription(Role::User, "what is", false);
        log.apply_transcription(Role::Model, "thinking", false);
        log.apply_transcription(Role::User, " this", false);

        let items = log.items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].text(), "what is this");
        assert_eq!(items[1].text(), "thinking");
    }

    #[tokio::test]
    async fn test_manual_message_deduplicated_by_transcribed_echo() {
        let store = MemoryStore::new();
        let log = log(store);

        log.append_manual("Hello");
        log.apply_transcription(Role::User, "Hello", true);

        let items = log.items();
        assert_eq!(items.len(), 1, "exactly one Hello survives");
        assert_eq!(items[0].text(), "Hello");
        assert!(!items[0].manual_input, "the confirmed copy wins");
        assert!(items[0].is_final);
    }

    #[tokio::test]
    async fn test_different_text_is_not_deduplicated() {
        let store = MemoryStore::new();
        let log = log(store);

        log.append_manual("Hello");
        log.apply_transcription(Role::User, "Goodbye", true);

        assert_eq!(log.items().len(), 2);
    }

    #[tokio::test]
    async fn test_matcher_is_swappable() {
        fn case_insensitive(a: &str, b: &str) -> bool {
            a.trim().eq_ignore_ascii_case(b.trim())
        }

        let store = MemoryStore::new();
        let log = HistoryLog::new(store, "conv-1").with_matcher(case_insensitive);

        log.append_manual("hello");
        log.apply_transcription(Role::User, "HELLO", true);

        assert_eq!(log.items().len(), 1);
    }

    #[tokio::test]
    async fn test_breadcrumbs_interleave_with_messages() {
        let store = MemoryStore::new();
        let log = log(store);

        log.append_breadcrumb("session started");
        log.apply_transcription(Role::User, "look this up", true);
        log.append_function_call("extract_unfamiliar_words", &serde_json::json!({"text": "x"}));
        log.apply_transcription(Role::Model, "done", true);

        let items = log.items();
        assert_eq!(items.len(), 4);
        assert_eq!(items[0].kind, ItemKind::Breadcrumb);
        assert_eq!(items[1].kind, ItemKind::Message);
        assert_eq!(items[2].kind, ItemKind::FunctionCall);
        assert_eq!(items[3].kind, ItemKind::Message);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bursts_collapse_into_one_write() {
        let store = MemoryStore::new();
        let log = HistoryLog::new(store.clone(), "conv-1");

        log.apply_transcription(Role::Model, "a", true);
        log.apply_transcription(Role::Model, "b", true);
        log.apply_transcription(Role::Model, "c", true);
        assert_eq!(store.write_count(), 0);

        tokio::time::sleep(DEFAULT_PERSIST_DEBOUNCE * 2).await;
        assert_eq!(store.write_count(), 1, "burst collapses into one upsert");

        log.apply_transcription(Role::Model, "d", true);
        tokio::time::sleep(DEFAULT_PERSIST_DEBOUNCE * 2).await;
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_write() {
        let store = MemoryStore::new();
        let log = HistoryLog::new(store.clone(), "conv-1");

        log.apply_transcription(Role::Model, "a", true);
        log.close();

        tokio::time::sleep(DEFAULT_PERSIST_DEBOUNCE * 2).await;
        assert_eq!(store.write_count(), 0, "nothing persists after teardown");
    }

    #[test]
    fn test_texts_match_normalizes_whitespace() {
        assert!(texts_match("  Hello   world ", "Hello world"));
        assert!(!texts_match("Hello world", "hello world"));
    }
}
