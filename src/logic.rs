//! Core behaviors shared by both HTTP and WebSocket handlers.
//!
//! This includes:
//!   - Ingesting streamed model output (artifacts, quiz recovery, fallback synthesis)
//!   - Answering and skipping quizzes
//!   - Switching the active artifact and applying quiz-API state
//!   - Generating a reply through the model client, when one is configured

use rand::Rng;
use tracing::{debug, error, info, instrument, warn};

use crate::complexity::{estimate_question_count, MAX_QUESTIONS, MIN_QUESTIONS};
use crate::domain::Quiz;
use crate::error::ApiError;
use crate::extract::{Extraction, ExtractionChain};
use crate::fallback::synthesize_quiz;
use crate::markers::{artifact_block_open, parse_artifact_blocks, scan_quiz_marker, visible_text, MarkerScan};
use crate::protocol::{AnswerOut, QuizStateIn, RemoteQuizState, SessionView, StreamOut};
use crate::reconcile::SessionInner;
use crate::session::{QuizDecision, QuizRejection};
use crate::shuffle::shuffle_quiz;
use crate::state::AppState;

/// Model output accumulated for the reply currently streaming in.
#[derive(Debug, Default)]
pub struct StreamBuffer {
  text: String,
  open: bool,
  /// Complete artifact blocks already applied to the session.
  artifacts_applied: usize,
  /// A quiz from this reply was already handed to the session.
  quiz_applied: bool,
  /// Quizzes recovered before persisted progress was loaded. Kept across replies
  /// until hydration offers them.
  deferred: Option<DeferredOffer>,
}

/// Quizzes for one artifact, held back until its progress exists.
#[derive(Debug, Clone)]
struct DeferredOffer {
  artifact_id: String,
  quizzes: Vec<Quiz>,
  total_hint: Option<u32>,
}

impl StreamBuffer {
  fn begin(&mut self) {
    *self = Self { open: true, deferred: self.deferred.take(), ..Self::default() };
  }

  pub fn is_open(&self) -> bool {
    self.open
  }
}

fn marker_total(text: &str) -> Option<u32> {
  match scan_quiz_marker(text) {
    MarkerScan::Found(w) => w.total_questions,
    _ => None,
  }
}

/// Shuffle and offer recovered quizzes. Returns whether the reply's quiz is settled
/// (accepted, or rejected for a reason a later chunk cannot change). Quizzes refused
/// because progress is still loading are kept for `resume_after_hydration`.
fn offer<R: Rng + ?Sized>(inner: &mut SessionInner, mut quizzes: Vec<Quiz>, total_hint: Option<u32>, rng: &mut R) -> bool {
  for q in quizzes.iter_mut() {
    shuffle_quiz(q, rng);
  }
  let held = quizzes.clone();
  match inner.session.offer_quizzes(quizzes, total_hint) {
    QuizDecision::Accepted => {
      inner.stream.deferred = None;
      true
    }
    QuizDecision::Rejected(QuizRejection::ProgressNotReady) => {
      if let Some(id) = inner.session.active_artifact_id() {
        debug!(target: "quiz", artifact_id = %id, count = held.len(), "Quiz held until progress is loaded");
        inner.stream.deferred = Some(DeferredOffer { artifact_id: id.to_string(), quizzes: held, total_hint });
      }
      false
    }
    QuizDecision::Rejected(QuizRejection::NoActiveArtifact) => false,
    QuizDecision::Rejected(_) => true,
  }
}

/// Deterministic quiz for a gated active artifact that has nothing to answer.
fn synthesize_if_needed<R: Rng + ?Sized>(inner: &mut SessionInner, rng: &mut R) {
  if !inner.session.needs_quiz() {
    return;
  }
  let synthesized = inner.session.active_artifact().map(|artifact| {
    let level = inner.session.progress(&artifact.id).map(|p| p.unlock_level).unwrap_or(0);
    warn!(target: "quiz", artifact_id = %artifact.id, level, "No usable quiz in reply; synthesizing one from the artifact source");
    synthesize_quiz(&artifact.content, &artifact.language, level)
  });
  if let Some(mut quiz) = synthesized {
    shuffle_quiz(&mut quiz, rng);
    inner.session.set_current_quiz(quiz, None);
  }
}

/// Run once hydration has opened the progress gate. Offers quizzes held back while
/// progress was loading; a persisted pending quiz takes precedence. A finished reply
/// whose artifact is still gated with nothing to answer gets a synthesized quiz; a
/// reply still streaming settles its own quiz when it ends.
pub fn resume_after_hydration<R: Rng + ?Sized>(inner: &mut SessionInner, rng: &mut R) {
  if let Some(held) = inner.stream.deferred.take() {
    let still_active = inner.session.active_artifact_id() == Some(held.artifact_id.as_str());
    if still_active && inner.session.pending_quiz().is_none() {
      let decision = inner.session.offer_quizzes(held.quizzes, held.total_hint);
      info!(target: "quiz", artifact_id = %held.artifact_id, ?decision, "Held quiz offered after hydration");
      if decision == QuizDecision::Accepted {
        inner.stream.quiz_applied = true;
      }
    } else {
      debug!(target: "quiz", artifact_id = %held.artifact_id, still_active, "Held quiz dropped");
    }
  }
  if !inner.stream.is_open() {
    synthesize_if_needed(inner, rng);
  }
}

/// Feed one chunk of model output into the session. The first chunk after a finished
/// reply starts a new one. Returns the text safe to display so far.
pub fn ingest<R: Rng + ?Sized>(inner: &mut SessionInner, chunk: &str, done: bool, rng: &mut R) -> String {
  if !inner.stream.open {
    inner.stream.begin();
    inner.session.begin_planning();
  }
  inner.stream.text.push_str(chunk);

  let blocks = parse_artifact_blocks(&inner.stream.text);
  for block in blocks.iter().skip(inner.stream.artifacts_applied) {
    inner.session.set_generated_code(block);
  }
  inner.stream.artifacts_applied = blocks.len();

  // The marker quiz belongs to the artifact; wait until its block has closed.
  if !inner.stream.quiz_applied && !artifact_block_open(&inner.stream.text) {
    if let (Extraction::Parsed(quizzes), _) = ExtractionChain::streaming().run(&inner.stream.text, done) {
      let total = marker_total(&inner.stream.text);
      inner.stream.quiz_applied = offer(inner, quizzes, total, rng);
    }
  }

  let visible = visible_text(&inner.stream.text);
  if done {
    finish(inner, rng);
  }
  visible
}

/// End of reply: full extraction chain, then synthesis for a gated artifact still
/// waiting for a quiz.
fn finish<R: Rng + ?Sized>(inner: &mut SessionInner, rng: &mut R) {
  if !inner.stream.quiz_applied {
    if let (Extraction::Parsed(quizzes), origin) = ExtractionChain::complete().run(&inner.stream.text, true) {
      info!(target: "quiz", origin = origin.unwrap_or("unknown"), count = quizzes.len(), "Quiz recovered at end of reply");
      let total = marker_total(&inner.stream.text);
      inner.stream.quiz_applied = offer(inner, quizzes, total, rng);
    }
  }

  synthesize_if_needed(inner, rng);

  inner.session.finish_reply();
  inner.stream.open = false;
}

/// Question count to ask the model for: the active artifact's estimate, or the full range.
fn question_count_hint(inner: &SessionInner) -> String {
  match inner.session.active_artifact() {
    Some(a) => estimate_question_count(&a.content).to_string(),
    None => format!("{MIN_QUESTIONS}-{MAX_QUESTIONS}, scaled to the code's complexity"),
  }
}

// ── Operations behind HTTP and WebSocket ──

#[instrument(level = "info", skip(state))]
pub async fn session_view(state: &AppState, conversation_id: &str) -> Result<SessionView, ApiError> {
  let handle = state.open_session(conversation_id).await?;
  let view = handle.lock().await.session.view();
  Ok(view)
}

#[instrument(level = "info", skip(state, text), fields(chunk_len = text.len()))]
pub async fn ingest_chunk(state: &AppState, conversation_id: &str, text: &str, done: bool) -> Result<StreamOut, ApiError> {
  let handle = state.open_session(conversation_id).await?;
  let (visible_text, session) = handle
    .update(|inner| {
      let visible = ingest(inner, text, done, &mut rand::thread_rng());
      (visible, inner.session.view())
    })
    .await;
  Ok(StreamOut { visible_text, session })
}

#[instrument(level = "info", skip(state, answer), fields(answer_len = answer.len()))]
pub async fn submit_answer(
  state: &AppState,
  conversation_id: &str,
  answer: &str,
  message_index: Option<u32>,
) -> Result<AnswerOut, ApiError> {
  let handle = state.open_session(conversation_id).await?;
  let (outcome, session) = handle
    .update(|inner| {
      let outcome = inner.session.answer_quiz(answer, message_index);
      (outcome, inner.session.view())
    })
    .await;
  Ok(match outcome {
    Some(o) => AnswerOut { accepted: true, correct: o.correct, hint: o.hint, session },
    None => AnswerOut { accepted: false, correct: false, hint: None, session },
  })
}

#[instrument(level = "info", skip(state))]
pub async fn skip_quiz(state: &AppState, conversation_id: &str) -> Result<SessionView, ApiError> {
  let handle = state.open_session(conversation_id).await?;
  Ok(
    handle
      .update(|inner| {
        inner.session.skip_to_unlock();
        inner.session.view()
      })
      .await,
  )
}

#[instrument(level = "info", skip(state))]
pub async fn switch_artifact(state: &AppState, conversation_id: &str, artifact_id: &str) -> Result<SessionView, ApiError> {
  let handle = state.open_session(conversation_id).await?;
  let (switched, view) = handle
    .update(|inner| {
      let switched = inner.session.switch_artifact(artifact_id);
      (switched, inner.session.view())
    })
    .await;
  if switched {
    Ok(view)
  } else {
    Err(ApiError::NotFound(format!("artifact {artifact_id}")))
  }
}

#[instrument(level = "info", skip(state, body))]
pub async fn apply_quiz_state(
  state: &AppState,
  conversation_id: &str,
  artifact_id: &str,
  body: QuizStateIn,
) -> Result<SessionView, ApiError> {
  let remote = match body {
    QuizStateIn::Answer(r) => RemoteQuizState::from(r),
    QuizStateIn::Listing(l) => RemoteQuizState::from(l),
  };
  let handle = state.open_session(conversation_id).await?;
  let (applied, view) = handle
    .update(|inner| {
      let applied = inner.session.apply_remote_state(artifact_id, remote);
      (applied, inner.session.view())
    })
    .await;
  if applied {
    Ok(view)
  } else {
    Err(ApiError::NotFound(format!("artifact {artifact_id}")))
  }
}

/// Ask the model for a reply and ingest it whole.
#[instrument(level = "info", skip(state, prompt), fields(prompt_len = prompt.len()))]
pub async fn generate(state: &AppState, conversation_id: &str, prompt: &str) -> Result<StreamOut, ApiError> {
  let Some(oa) = &state.openai else {
    return Err(ApiError::BadRequest("no model configured; stream model output to the stream endpoint".into()));
  };
  let handle = state.open_session(conversation_id).await?;
  let question_count = handle
    .update(|inner| {
      inner.session.begin_planning();
      question_count_hint(inner)
    })
    .await;

  match oa.generate_reply(&state.prompts, prompt, &question_count).await {
    Ok(reply) => {
      let (visible_text, session) = handle
        .update(|inner| {
          // A generated reply replaces any half-streamed one.
          inner.stream.open = false;
          let visible = ingest(inner, &reply, true, &mut rand::thread_rng());
          (visible, inner.session.view())
        })
        .await;
      Ok(StreamOut { visible_text, session })
    }
    Err(e) => {
      error!(target: "quizgate", conversation_id = handle.conversation_id(), error = %e, "Model reply failed");
      handle.update(|inner| inner.session.finish_reply()).await;
      Err(ApiError::Internal(format!("model reply failed: {e}")))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::Phase;
  use crate::gate::GateOverride;
  use crate::heuristic::QUESTION_FALLBACK;
  use crate::session::GenerationSession;
  use rand::rngs::StdRng;
  use rand::SeedableRng;

  const ARTIFACT: &str = "Here you go.\n<artifact id=\"a1\" title=\"Loader\" language=\"ts\">\nasync function load() {\n  const d = await fetchData();\n  return d;\n}\n</artifact>\n";
  const MARKER: &str = r#"<!--QUIZ:{"level":1,"question":"Why await?","options":[{"label":"A","text":"x"},{"label":"B","text":"y"}],"correctLabel":"B"}-->"#;

  fn inner() -> SessionInner {
    SessionInner { session: GenerationSession::fresh(GateOverride::default()), stream: StreamBuffer::default() }
  }

  fn pending(inner: &SessionInner) -> Quiz {
    inner.session.pending_quiz().cloned().expect("pending quiz")
  }

  #[test]
  fn held_quiz_is_offered_when_progress_opens() {
    let mut rng = StdRng::seed_from_u64(11);
    let mut s = SessionInner { session: GenerationSession::new(GateOverride::default()), stream: StreamBuffer::default() };
    ingest(&mut s, &format!("{ARTIFACT}{MARKER}"), true, &mut rng);
    assert!(s.session.pending_quiz().is_none());

    s.session.open_progress();
    resume_after_hydration(&mut s, &mut rng);
    let q = pending(&s);
    assert_eq!(q.question, "Why await?");
    assert_eq!(q.option(&q.correct_label).expect("correct").text, "y");
    assert_eq!(s.session.phase(), Phase::Unlocking);
  }

  #[test]
  fn held_quiz_for_replaced_artifact_is_dropped() {
    let mut rng = StdRng::seed_from_u64(12);
    let mut s = SessionInner { session: GenerationSession::new(GateOverride::default()), stream: StreamBuffer::default() };
    ingest(&mut s, &format!("{ARTIFACT}{MARKER}"), true, &mut rng);
    let second = "Another one.\n<artifact id=\"a2\" title=\"Saver\" language=\"ts\">\nasync function save() {\n  await persist();\n}\n</artifact>\n";
    ingest(&mut s, second, true, &mut rng);

    s.session.open_progress();
    resume_after_hydration(&mut s, &mut rng);
    assert_eq!(s.session.active_artifact_id(), Some("a2"));
    assert_ne!(pending(&s).question, "Why await?");
  }

  #[test]
  fn marker_quiz_survives_shuffle() {
    for seed in 0..20 {
      let mut rng = StdRng::seed_from_u64(seed);
      let mut s = inner();
      ingest(&mut s, &format!("{ARTIFACT}{MARKER}"), true, &mut rng);
      let q = pending(&s);
      assert_eq!(q.question, "Why await?");
      assert_eq!(q.options.len(), 2);
      assert_eq!(q.option(&q.correct_label).expect("correct").text, "y");
      assert_eq!(q.level, 0);
    }
  }

  #[test]
  fn heuristic_options_when_no_marker() {
    let mut rng = StdRng::seed_from_u64(1);
    let mut s = inner();
    ingest(&mut s, ARTIFACT, false, &mut rng);
    ingest(&mut s, "A) uses cache B) avoids recompute C) improves types", true, &mut rng);
    let q = pending(&s);
    let labels: Vec<_> = q.options.iter().map(|o| o.label.as_str()).collect();
    assert_eq!(labels, vec!["A", "B", "C"]);
    assert_eq!(q.question, QUESTION_FALLBACK);
  }

  #[test]
  fn synthesizes_when_nothing_parses() {
    let mut rng = StdRng::seed_from_u64(2);
    let mut s = inner();
    ingest(&mut s, ARTIFACT, true, &mut rng);
    let q = pending(&s);
    assert!(q.question.contains("await"));
    assert!(q.is_well_formed());
    assert_eq!(s.session.phase(), Phase::Unlocking);
  }

  #[test]
  fn streamed_char_by_char_applies_marker_once() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut s = inner();
    let full = format!("{ARTIFACT}{MARKER} trailing words");
    let chars: Vec<char> = full.chars().collect();
    let mut last_visible = String::new();
    for (i, c) in chars.iter().enumerate() {
      let done = i + 1 == chars.len();
      last_visible = ingest(&mut s, &c.to_string(), done, &mut rng);
      assert!(!last_visible.contains("<!--"), "raw marker leaked at char {i}");
      assert!(!last_visible.contains("fetchData"), "artifact body leaked at char {i}");
    }
    assert!(last_visible.ends_with("trailing words"));
    assert_eq!(pending(&s).question, "Why await?");
    assert_eq!(s.session.progress("a1").expect("progress").unlock_level, 0);
  }

  #[test]
  fn marker_waits_for_artifact_block() {
    let mut rng = StdRng::seed_from_u64(4);
    let mut s = inner();
    ingest(&mut s, &format!("{MARKER}\n<artifact id=\"a1\" title=\"t\">const d = await f();"), false, &mut rng);
    assert!(s.session.pending_quiz().is_none());
    ingest(&mut s, "\n</artifact>", true, &mut rng);
    assert_eq!(pending(&s).question, "Why await?");
  }

  #[test]
  fn prose_only_reply_returns_to_initial() {
    let mut rng = StdRng::seed_from_u64(5);
    let mut s = inner();
    ingest(&mut s, "Sure, what would you like to build?", false, &mut rng);
    assert_eq!(s.session.phase(), Phase::Planning);
    ingest(&mut s, "", true, &mut rng);
    assert_eq!(s.session.phase(), Phase::Initial);
    assert!(s.session.pending_quiz().is_none());
    assert!(!s.stream.is_open());
  }

  #[test]
  fn next_reply_starts_fresh_buffer() {
    let mut rng = StdRng::seed_from_u64(6);
    let mut s = inner();
    ingest(&mut s, &format!("{ARTIFACT}{MARKER}"), true, &mut rng);
    let q = pending(&s);
    s.session.answer_quiz(&q.correct_label, None);

    let visible = ingest(&mut s, "Second reply.", true, &mut rng);
    assert_eq!(visible, "Second reply.");
    // The second level gets a synthesized quiz since the reply had none.
    assert_eq!(pending(&s).level, 1);
  }

  #[test]
  fn multiple_quiz_blocks_are_queued() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut s = inner();
    s.session.set_generated_code(&crate::markers::ArtifactBlock {
      id: Some("a1".into()),
      kind: crate::domain::ArtifactKind::Code,
      title: "t".into(),
      language: "ts".into(),
      content: "const a = await f();\nconst b = x?.y;\nconst c = items.reduce((p, n) => p + n, 0);".into(),
    });
    let text = "Question 1: Why await?\nA. to wait\nB. to speed up\nQuestion 2: Why optional chaining?\nA. null safety\nB. typing";
    ingest(&mut s, text, true, &mut rng);
    let p = s.session.progress("a1").expect("progress");
    assert!(p.current_quiz.is_some());
    assert_eq!(p.queued.len(), 1);
  }
}
