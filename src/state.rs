//! Application state: live sessions, persistence store, gate override, prompts and the
//! optional OpenAI client.
//!
//! Sessions are opened lazily on first access to a conversation id and kept for the
//! life of the process. Opening one starts its hydration from the store.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;
use tracing::{error, info, instrument};

use crate::config::{bypass_from_env, load_config_from_env, Prompts};
use crate::error::ApiError;
use crate::gate::GateOverride;
use crate::openai::OpenAI;
use crate::reconcile::SessionHandle;
use crate::store::{valid_id, FileStore, MemoryStore, SnapshotStore};

pub struct AppState {
    pub sessions: RwLock<HashMap<String, SessionHandle>>,
    pub store: Arc<dyn SnapshotStore>,
    pub gate: GateOverride,
    pub openai: Option<OpenAI>,
    pub prompts: Prompts,
}

impl AppState {
    /// Build state from env: load config, pick the store, resolve the gate override, init OpenAI.
    #[instrument(level = "info", skip_all)]
    pub fn new() -> Self {
        let cfg = load_config_from_env().unwrap_or_default();

        let store: Arc<dyn SnapshotStore> = match std::env::var("QUIZGATE_DATA_DIR") {
            Ok(dir) => match FileStore::new(&dir) {
                Ok(fs) => {
                    info!(target: "quizgate", %dir, "Using file snapshot store");
                    Arc::new(fs)
                }
                Err(e) => {
                    error!(target: "quizgate", %dir, error = %e, "Cannot open data dir; falling back to in-memory store");
                    Arc::new(MemoryStore::new())
                }
            },
            Err(_) => {
                info!(target: "quizgate", "QUIZGATE_DATA_DIR not set; snapshots kept in memory");
                Arc::new(MemoryStore::new())
            }
        };

        let bypass = bypass_from_env().unwrap_or(cfg.gate.bypass);
        info!(target: "quizgate", bypass, "Gate override resolved");

        // Build optional OpenAI client (if API key present).
        let openai = OpenAI::from_env();
        if let Some(oa) = &openai {
            info!(target: "quizgate", base_url = %oa.base_url, model = %oa.model, "OpenAI enabled.");
        } else {
            info!(target: "quizgate", "OpenAI disabled (no OPENAI_API_KEY). Model output must be streamed in.");
        }

        Self::with_parts(store, GateOverride::new(bypass), openai, cfg.prompts)
    }

    pub fn with_parts(store: Arc<dyn SnapshotStore>, gate: GateOverride, openai: Option<OpenAI>, prompts: Prompts) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), store, gate, openai, prompts }
    }

    /// Live session for a conversation, opening (and hydrating) it on first use.
    pub async fn open_session(&self, conversation_id: &str) -> Result<SessionHandle, ApiError> {
        if !valid_id(conversation_id) {
            return Err(ApiError::BadRequest(format!("invalid conversation id: {conversation_id:?}")));
        }
        if let Some(h) = self.sessions.read().await.get(conversation_id) {
            return Ok(h.clone());
        }

        let mut sessions = self.sessions.write().await;
        // Another request may have opened it between the two locks.
        let handle = sessions
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                info!(target: "quizgate", conversation_id, "Session opened");
                SessionHandle::open(conversation_id, self.store.clone(), self.gate.clone())
            })
            .clone();
        Ok(handle)
    }
}
