//! Shared document and auxiliary state.
//!
//! One global document per server. Every mutation goes through a method
//! on [`SharedState`]; callers never read-modify-write, and no lock is
//! held across I/O. Edits can be published under the document lock
//! ([`SharedState::apply_edit_with`]) so they leave in version order.
//!
//! - `document` — code text + version (last writer wins, no merge)
//! - `aux`      — input / output / compile log / reference answer
//! - `history`  — last [`COMPILE_HISTORY_LEN`] compile records

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::DocumentConfig;
use crate::protocol::InitData;

/// Compile records kept for audit.
pub const COMPILE_HISTORY_LEN: usize = 10;

/// Snapshot of the shared document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentState {
    pub text: String,
    /// Number of accepted edits since startup
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Snapshot of the auxiliary fields. Each field is last-write-wins on its own.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SharedAuxState {
    pub input_data: String,
    pub output_data: String,
    pub compile_log: String,
    pub reference_answer: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompileRecord {
    pub username: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

/// The shared state store.
pub struct SharedState {
    document: RwLock<DocumentState>,
    aux: RwLock<SharedAuxState>,
    history: RwLock<VecDeque<CompileRecord>>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new(&DocumentConfig::default())
    }
}

impl SharedState {
    pub fn new(config: &DocumentConfig) -> Self {
        let now = Utc::now();
        Self {
            document: RwLock::new(DocumentState {
                text: config.initial_code.clone(),
                version: 0,
                updated_at: now,
            }),
            aux: RwLock::new(SharedAuxState {
                input_data: String::new(),
                output_data: String::new(),
                compile_log: config.initial_compile_log.clone(),
                reference_answer: String::new(),
                updated_at: now,
            }),
            history: RwLock::new(VecDeque::with_capacity(COMPILE_HISTORY_LEN)),
        }
    }

    /// Consistent snapshot of the document.
    pub async fn document(&self) -> DocumentState {
        self.document.read().await.clone()
    }

    /// Replace the whole text and bump the version.
    pub async fn apply_edit(&self, text: impl Into<String>) -> DocumentState {
        self.apply_edit_with(text, |_| {}).await
    }

    /// [`apply_edit`](Self::apply_edit), calling `publish` with the new
    /// state before the write lock is released. `publish` must not block.
    pub async fn apply_edit_with<F>(&self, text: impl Into<String>, publish: F) -> DocumentState
    where
        F: FnOnce(&DocumentState),
    {
        let mut doc = self.document.write().await;
        doc.text = text.into();
        doc.version += 1;
        doc.updated_at = Utc::now();
        publish(&doc);
        doc.clone()
    }

    /// Consistent snapshot of the auxiliary fields.
    pub async fn aux(&self) -> SharedAuxState {
        self.aux.read().await.clone()
    }

    pub async fn set_input(&self, input: impl Into<String>) {
        let mut aux = self.aux.write().await;
        aux.input_data = input.into();
        aux.updated_at = Utc::now();
    }

    pub async fn set_output(&self, output: impl Into<String>) {
        let mut aux = self.aux.write().await;
        aux.output_data = output.into();
        aux.updated_at = Utc::now();
    }

    pub async fn set_answer(&self, answer: impl Into<String>) {
        let mut aux = self.aux.write().await;
        aux.reference_answer = answer.into();
        aux.updated_at = Utc::now();
    }

    /// Append to the compile log and return the full log after the append.
    pub async fn append_log(&self, entry: &str) -> String {
        let mut aux = self.aux.write().await;
        aux.compile_log.push_str(entry);
        aux.updated_at = Utc::now();
        aux.compile_log.clone()
    }

    /// Record a compile; the oldest record is evicted past the cap.
    pub async fn record_compile(&self, username: impl Into<String>, success: bool) {
        let mut history = self.history.write().await;
        if history.len() == COMPILE_HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(CompileRecord {
            username: username.into(),
            timestamp: Utc::now(),
            success,
        });
    }

    /// Compile records, oldest first.
    pub async fn compile_history(&self) -> Vec<CompileRecord> {
        self.history.read().await.iter().cloned().collect()
    }

    /// Payload of the `init` envelope pushed to new connections.
    pub async fn init_data(&self) -> InitData {
        let code = self.document.read().await.text.clone();
        let aux = self.aux().await;
        InitData {
            code,
            input_data: aux.input_data,
            output_data: aux.output_data,
            compile_log: aux.compile_log,
            answer: aux.reference_answer,
        }
    }

    /// Current code as a downloadable file: `(filename, body)`.
    pub async fn export_code(&self) -> (String, String) {
        let doc = self.document().await;
        let body = if doc.text.is_empty() {
            "// empty code\n".to_string()
        } else {
            doc.text
        };
        let filename = format!("code_{}.cpp", Utc::now().format("%Y%m%d_%H%M%S"));
        (filename, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_initial_state() {
        let state = SharedState::default();
        let doc = state.document().await;
        assert_eq!(doc.version, 0);
        assert!(doc.text.contains("int main()"));

        let aux = state.aux().await;
        assert!(aux.input_data.is_empty());
        assert_eq!(aux.compile_log, "Waiting for compile...\n");
        assert!(state.compile_history().await.is_empty());
    }

    #[tokio::test]
    async fn test_edit_is_last_write_wins() {
        let state = SharedState::default();
        let first = state.apply_edit("a").await;
        let second = state.apply_edit("b").await;
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert!(second.updated_at >= first.updated_at);

        let doc = state.document().await;
        assert_eq!(doc.text, "b");
        assert_eq!(doc.version, 2);
    }

    #[tokio::test]
    async fn test_concurrent_edits_count_versions() {
        let state = Arc::new(SharedState::default());
        let mut tasks = Vec::new();
        for i in 0..50 {
            let state = state.clone();
            tasks.push(tokio::spawn(async move {
                state.apply_edit(format!("edit {i}")).await.version
            }));
        }

        let mut versions = Vec::new();
        for task in tasks {
            versions.push(task.await.unwrap());
        }
        versions.sort_unstable();
        assert_eq!(versions, (1..=50).collect::<Vec<u64>>());

        // The stored text is the payload of the edit that got the last version.
        let doc = state.document().await;
        assert_eq!(doc.version, 50);
        assert!(doc.text.starts_with("edit "));
    }

    #[tokio::test]
    async fn test_apply_edit_with_publishes_in_version_order() {
        let state = Arc::new(SharedState::default());
        let published = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..20 {
            let state = state.clone();
            let published = published.clone();
            tasks.push(tokio::spawn(async move {
                state
                    .apply_edit_with(format!("edit {i}"), |doc| {
                        published.lock().unwrap().push(doc.version);
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let published = published.lock().unwrap().clone();
        assert_eq!(published, (1..=20).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_aux_fields_independent() {
        let state = SharedState::default();
        state.set_input("3").await;
        state.set_answer("9").await;
        state.set_output("9\n").await;

        let aux = state.aux().await;
        assert_eq!(aux.input_data, "3");
        assert_eq!(aux.reference_answer, "9");
        assert_eq!(aux.output_data, "9\n");

        // Aux writes never touch the document version.
        assert_eq!(state.document().await.version, 0);
    }

    #[tokio::test]
    async fn test_append_log_returns_full_log() {
        let state = SharedState::default();
        let log = state.append_log("first\n").await;
        assert_eq!(log, "Waiting for compile...\nfirst\n");
        let log = state.append_log("second\n").await;
        assert!(log.ends_with("first\nsecond\n"));
    }

    #[tokio::test]
    async fn test_compile_history_ring() {
        let state = SharedState::default();
        for i in 0..(COMPILE_HISTORY_LEN + 3) {
            state.record_compile(format!("user{i}"), i % 2 == 0).await;
        }
        let history = state.compile_history().await;
        assert_eq!(history.len(), COMPILE_HISTORY_LEN);
        assert_eq!(history[0].username, "user3");
        assert_eq!(history[COMPILE_HISTORY_LEN - 1].username, "user12");
    }

    #[tokio::test]
    async fn test_init_data_mirrors_state() {
        let state = SharedState::default();
        state.apply_edit("int main(){}").await;
        state.set_input("1 2").await;
        state.set_answer("3").await;

        let init = state.init_data().await;
        assert_eq!(init.code, "int main(){}");
        assert_eq!(init.input_data, "1 2");
        assert_eq!(init.answer, "3");
    }

    #[tokio::test]
    async fn test_export_code() {
        let state = SharedState::default();
        state.apply_edit("").await;
        let (name, body) = state.export_code().await;
        assert!(name.starts_with("code_") && name.ends_with(".cpp"));
        assert_eq!(body, "// empty code\n");

        state.apply_edit("int main(){}").await;
        assert_eq!(state.export_code().await.1, "int main(){}");
    }
}
