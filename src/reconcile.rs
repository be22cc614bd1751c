//! Reconciliation between a live session and its persisted snapshot.
//!
//! Opening a session spawns two tasks:
//!   - hydrate: loads the persisted snapshot (bounded by `HYDRATION_TIMEOUT`), merges
//!     it, then opens the progress gate. Until then the session accepts artifacts but
//!     creates no progress for them, and nothing is saved. Quizzes that arrived in
//!     the meantime are offered once the gate is open.
//!   - saver: waits for change signals, debounces them by `SAVE_DEBOUNCE`, and writes
//!     the current snapshot unless its content hash matches the last write.
//!
//! The saver always serializes the snapshot at write time, never a captured one. It
//! exits after a final flush once every handle is dropped.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::gate::GateOverride;
use crate::logic::{resume_after_hydration, StreamBuffer};
use crate::protocol::SessionSnapshot;
use crate::session::GenerationSession;
use crate::store::SnapshotStore;

pub const HYDRATION_TIMEOUT: Duration = Duration::from_secs(5);
pub const SAVE_DEBOUNCE: Duration = Duration::from_millis(500);

/// Everything guarded by the per-session lock.
pub struct SessionInner {
    pub session: GenerationSession,
    pub stream: StreamBuffer,
}

/// Shared handle to one live session. Cloning is cheap; the saver stops when the
/// last clone is dropped.
#[derive(Clone)]
pub struct SessionHandle {
    conversation_id: Arc<str>,
    state: Arc<Mutex<SessionInner>>,
    dirty: mpsc::UnboundedSender<()>,
}

impl SessionHandle {
    /// Open a session and spawn its hydrate and saver tasks. Must run inside a tokio runtime.
    pub fn open(conversation_id: &str, store: Arc<dyn SnapshotStore>, gate: GateOverride) -> Self {
        let state = Arc::new(Mutex::new(SessionInner {
            session: GenerationSession::new(gate),
            stream: StreamBuffer::default(),
        }));
        let (tx, rx) = mpsc::unbounded_channel();
        let conversation_id: Arc<str> = Arc::from(conversation_id);

        tokio::spawn(hydrate(conversation_id.clone(), store.clone(), state.clone(), tx.clone()));
        tokio::spawn(run_saver(conversation_id.clone(), store, state.clone(), rx));

        Self { conversation_id, state, dirty: tx }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Read access. Changes made through this guard are not persisted; use `update`.
    pub async fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.state.lock().await
    }

    /// Apply a change under the session lock and schedule a save.
    pub async fn update<R>(&self, f: impl FnOnce(&mut SessionInner) -> R) -> R {
        let out = {
            let mut guard = self.state.lock().await;
            f(&mut guard)
        };
        self.mark_dirty();
        out
    }

    pub fn mark_dirty(&self) {
        // The saver only goes away with the last handle, so a send error cannot happen here.
        let _ = self.dirty.send(());
    }
}

#[instrument(level = "info", skip_all, fields(conversation_id = %conversation_id))]
async fn hydrate(
    conversation_id: Arc<str>,
    store: Arc<dyn SnapshotStore>,
    state: Arc<Mutex<SessionInner>>,
    dirty: mpsc::UnboundedSender<()>,
) {
    let deadline = Instant::now() + HYDRATION_TIMEOUT;
    let loaded = match timeout(HYDRATION_TIMEOUT, store.load(&conversation_id)).await {
        Ok(Ok(snapshot)) => snapshot,
        Ok(Err(e)) => {
            warn!(target: "reconcile", error = %e, "Snapshot load failed; waiting out the hydration window");
            sleep_until(deadline).await;
            None
        }
        Err(_) => {
            info!(target: "reconcile", "No snapshot within the hydration window; treating as a new session");
            None
        }
    };

    {
        let mut guard = state.lock().await;
        let origin = match loaded {
            Some(snapshot) => {
                guard.session.merge_snapshot(snapshot);
                "snapshot"
            }
            None => "fresh",
        };
        guard.session.open_progress();
        resume_after_hydration(&mut guard, &mut rand::thread_rng());
        info!(target: "reconcile", %origin, "Progress gate opened");
    }
    // Persist anything created while the gate was closed.
    let _ = dirty.send(());
}

async fn run_saver(
    conversation_id: Arc<str>,
    store: Arc<dyn SnapshotStore>,
    state: Arc<Mutex<SessionInner>>,
    mut dirty: mpsc::UnboundedReceiver<()>,
) {
    let mut last_hash: Option<String> = None;
    while dirty.recv().await.is_some() {
        // Trailing debounce: every new signal restarts the quiet period.
        loop {
            tokio::select! {
                _ = sleep(SAVE_DEBOUNCE) => break,
                more = dirty.recv() => {
                    if more.is_none() {
                        break;
                    }
                }
            }
        }
        flush(&conversation_id, store.as_ref(), &state, &mut last_hash).await;
    }
    debug!(target: "reconcile", conversation_id = %conversation_id, "Saver stopped");
}

async fn flush(
    conversation_id: &str,
    store: &dyn SnapshotStore,
    state: &Mutex<SessionInner>,
    last_hash: &mut Option<String>,
) {
    let snapshot = {
        let guard = state.lock().await;
        if !guard.session.progress_ready() {
            debug!(target: "reconcile", conversation_id, "Save deferred until hydration completes");
            return;
        }
        guard.session.snapshot()
    };

    let hash = match snapshot_hash(&snapshot) {
        Ok(h) => h,
        Err(e) => {
            error!(target: "reconcile", conversation_id, error = %e, "Snapshot serialization failed");
            return;
        }
    };
    if last_hash.as_deref() == Some(hash.as_str()) {
        debug!(target: "reconcile", conversation_id, "Snapshot unchanged; save skipped");
        return;
    }

    match store.save(conversation_id, &snapshot).await {
        Ok(()) => {
            debug!(target: "reconcile", conversation_id, hash = %&hash[..12], "Snapshot saved");
            *last_hash = Some(hash);
        }
        Err(e) => error!(target: "reconcile", conversation_id, error = %e, "Snapshot save failed"),
    }
}

/// SHA-256 over the canonical JSON form (object keys sorted).
pub fn snapshot_hash(snapshot: &SessionSnapshot) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_value(snapshot)?;
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ArtifactKind, Phase};
    use crate::logic::ingest;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use crate::error::StoreError;
    use crate::markers::ArtifactBlock;
    use crate::protocol::RemoteQuizState;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    /// Store whose loads take `delay` and optionally fail.
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
        fail_load: bool,
    }

    #[async_trait]
    impl SnapshotStore for SlowStore {
        async fn load(&self, id: &str) -> crate::store::Result<Option<SessionSnapshot>> {
            sleep(self.delay).await;
            if self.fail_load {
                return Err(StoreError::Unavailable("offline".into()));
            }
            self.inner.load(id).await
        }

        async fn save(&self, id: &str, s: &SessionSnapshot) -> crate::store::Result<()> {
            self.inner.save(id, s).await
        }
    }

    fn block(id: &str) -> ArtifactBlock {
        ArtifactBlock {
            id: Some(id.into()),
            kind: ArtifactKind::Code,
            title: id.into(),
            language: "ts".into(),
            content: "const d = await fetchData();".into(),
        }
    }

    /// Snapshot with artifact `a1` at level 1 of 3.
    fn persisted() -> SessionSnapshot {
        let mut s = GenerationSession::fresh(GateOverride::default());
        s.set_generated_code(&block("a1"));
        s.apply_remote_state("a1", RemoteQuizState { unlock_level: 1, total_questions: 3, pending: None });
        s.snapshot()
    }

    async fn slow_store(delay: Duration, fail_load: bool, snapshot: Option<SessionSnapshot>) -> Arc<SlowStore> {
        let inner = MemoryStore::new();
        if let Some(s) = snapshot {
            inner.insert("c1", s).await;
        }
        Arc::new(SlowStore { inner, delay, fail_load })
    }

    #[tokio::test(start_paused = true)]
    async fn artifact_created_before_snapshot_keeps_persisted_progress() {
        let store = slow_store(Duration::from_secs(2), false, Some(persisted())).await;
        let handle = SessionHandle::open("c1", store.clone(), GateOverride::default());

        handle.update(|s| s.session.set_generated_code(&block("a1"))).await;
        assert!(handle.lock().await.session.progress("a1").is_none());

        sleep(Duration::from_secs(3)).await;
        let guard = handle.lock().await;
        let p = guard.session.progress("a1").expect("merged progress");
        assert_eq!((p.unlock_level, p.total_questions), (1, 3));
        assert_eq!(guard.session.mirror(), (1, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn no_save_before_hydration_completes() {
        let store = slow_store(Duration::from_secs(4), false, None).await;
        let handle = SessionHandle::open("c1", store.clone(), GateOverride::default());
        handle.update(|s| s.session.set_generated_code(&block("a1"))).await;

        sleep(Duration::from_secs(2)).await;
        assert_eq!(store.inner.save_count(), 0);

        sleep(Duration::from_secs(3)).await;
        assert_eq!(store.inner.save_count(), 1);
        let saved = store.inner.load("c1").await.expect("load").expect("saved");
        assert_eq!(saved.artifact_progress["a1"].total_questions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hydration_times_out_into_fresh_session() {
        let store = slow_store(Duration::from_secs(60), false, Some(persisted())).await;
        let handle = SessionHandle::open("c1", store, GateOverride::default());
        handle.update(|s| s.session.set_generated_code(&block("a1"))).await;

        sleep(HYDRATION_TIMEOUT - Duration::from_millis(100)).await;
        assert!(!handle.lock().await.session.progress_ready());

        sleep(Duration::from_millis(200)).await;
        let guard = handle.lock().await;
        assert!(guard.session.progress_ready());
        assert_eq!(guard.session.progress("a1").expect("default").unlock_level, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_load_waits_out_the_window() {
        let store = slow_store(Duration::from_millis(10), true, None).await;
        let handle = SessionHandle::open("c1", store, GateOverride::default());

        sleep(Duration::from_secs(1)).await;
        assert!(!handle.lock().await.session.progress_ready());
        sleep(HYDRATION_TIMEOUT).await;
        assert!(handle.lock().await.session.progress_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn saves_are_debounced_and_deduplicated() {
        let store = slow_store(Duration::ZERO, false, None).await;
        let handle = SessionHandle::open("c1", store.clone(), GateOverride::default());
        sleep(Duration::from_secs(1)).await;
        let baseline = store.inner.save_count();

        handle.update(|s| s.session.set_generated_code(&block("a1"))).await;
        for _ in 0..5 {
            sleep(Duration::from_millis(100)).await;
            handle.update(|s| s.session.begin_planning()).await;
        }
        // Still inside the quiet period after the last change.
        assert_eq!(store.inner.save_count(), baseline);

        sleep(Duration::from_millis(600)).await;
        assert_eq!(store.inner.save_count(), baseline + 1);

        // Same content again: hash matches, no write.
        handle.mark_dirty();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(store.inner.save_count(), baseline + 1);
    }

    const REPLY: &str = "Here it is.\n<artifact id=\"a1\" title=\"Loader\" language=\"ts\">\nconst d = await fetchData();\n</artifact>\n";
    const MARKER: &str = r#"<!--QUIZ:{"level":1,"question":"Why await?","options":[{"label":"A","text":"x"},{"label":"B","text":"y"}],"correctLabel":"B"}-->"#;

    #[tokio::test(start_paused = true)]
    async fn quiz_streamed_before_hydration_is_offered_once_progress_opens() {
        let store = slow_store(Duration::from_secs(60), false, None).await;
        let handle = SessionHandle::open("c1", store, GateOverride::default());
        let reply = format!("{REPLY}{MARKER}");
        handle
            .update(|s| {
                ingest(s, &reply, true, &mut StdRng::seed_from_u64(7));
            })
            .await;
        {
            let guard = handle.lock().await;
            assert!(!guard.session.progress_ready());
            assert!(guard.session.pending_quiz().is_none());
        }

        sleep(HYDRATION_TIMEOUT + Duration::from_secs(1)).await;
        let guard = handle.lock().await;
        assert!(guard.session.progress_ready());
        let quiz = guard.session.pending_quiz().expect("quiz offered after hydration");
        assert_eq!(quiz.question, "Why await?");
        assert_eq!(quiz.option(&quiz.correct_label).expect("correct option").text, "y");
        assert_eq!(guard.session.phase(), Phase::Unlocking);
        assert!(!guard.session.is_unlocked("a1"));
    }

    #[tokio::test(start_paused = true)]
    async fn quizless_reply_before_hydration_gets_a_synthesized_quiz() {
        let store = slow_store(Duration::from_secs(60), false, None).await;
        let handle = SessionHandle::open("c1", store, GateOverride::default());
        handle
            .update(|s| {
                ingest(s, REPLY, true, &mut StdRng::seed_from_u64(8));
            })
            .await;

        sleep(HYDRATION_TIMEOUT + Duration::from_secs(1)).await;
        let guard = handle.lock().await;
        let quiz = guard.session.pending_quiz().expect("synthesized quiz");
        assert!(quiz.question.contains("await"));
        assert_eq!(guard.session.phase(), Phase::Unlocking);
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_pending_quiz_wins_over_held_one() {
        let mut snapshot = persisted();
        let pending = crate::domain::Quiz {
            level: 1,
            question: "Persisted question?".into(),
            options: vec![
                crate::domain::QuizOption::new("A", "one"),
                crate::domain::QuizOption::new("B", "two"),
            ],
            correct_label: "A".into(),
            hint: None,
            code_snippet: None,
            code_language: None,
        };
        if let Some(p) = snapshot.artifact_progress.get_mut("a1") {
            p.current_quiz = Some(pending);
        }
        let store = slow_store(Duration::from_secs(2), false, Some(snapshot)).await;
        let handle = SessionHandle::open("c1", store, GateOverride::default());
        let reply = format!("{REPLY}{MARKER}");
        handle
            .update(|s| {
                ingest(s, &reply, true, &mut StdRng::seed_from_u64(9));
            })
            .await;

        sleep(Duration::from_secs(3)).await;
        let guard = handle.lock().await;
        assert_eq!(guard.session.pending_quiz().expect("pending").question, "Persisted question?");
        assert_eq!(guard.session.mirror(), (1, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn reload_during_a_request_restores_the_settled_phase() {
        let store = Arc::new(MemoryStore::new());
        let handle = SessionHandle::open("c1", store.clone(), GateOverride::default());
        sleep(Duration::from_millis(10)).await;
        handle
            .update(|s| {
                s.session.set_generated_code(&block("a1"));
                s.session.apply_remote_state("a1", RemoteQuizState { unlock_level: 1, total_questions: 2, pending: None });
                s.session.begin_planning();
            })
            .await;
        sleep(Duration::from_secs(1)).await;
        let saved = store.load("c1").await.expect("load").expect("saved");
        assert_eq!(saved.phase, Some(Phase::Unlocking));
        drop(handle);

        let reopened = SessionHandle::open("c1", store.clone(), GateOverride::default());
        sleep(Duration::from_millis(10)).await;
        {
            let guard = reopened.lock().await;
            assert_eq!(guard.session.phase(), Phase::Unlocking);
            assert!(!guard.stream.is_open());
        }

        // A snapshot that still carries a planning phase.
        let mut legacy = persisted();
        legacy.phase = Some(Phase::Planning);
        store.insert("c2", legacy).await;
        let other = SessionHandle::open("c2", store, GateOverride::default());
        sleep(Duration::from_millis(10)).await;
        assert_eq!(other.lock().await.session.phase(), Phase::Unlocking);
    }

    #[test]
    fn hash_ignores_map_insertion_order() {
        let mut a = persisted();
        let mut b = a.clone();
        a.artifact_progress.insert("z".into(), Default::default());
        a.artifact_progress.insert("y".into(), Default::default());
        b.artifact_progress.insert("y".into(), Default::default());
        b.artifact_progress.insert("z".into(), Default::default());
        assert_eq!(snapshot_hash(&a).expect("hash"), snapshot_hash(&b).expect("hash"));
    }
}
