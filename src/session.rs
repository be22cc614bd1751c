//! Per-conversation generation session: the unlock state machine.
//!
//! Phases: initial -> planning -> coding -> unlocking -> unlocked.
//!
//! Every transition is a plain `&mut self` method applied under the session lock,
//! so a transition never observes another half-applied one. Progress entries are
//! replaced whole (clone, modify, insert) and only for the artifact concerned.
//!
//! Invariants kept for every artifact:
//!   - unlock_level <= effective total
//!   - unlock_level never decreases
//!   - no pending quiz once unlock_level >= effective total
//! where the effective total is 0 while the gate override is on.

use std::collections::HashMap;

use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::complexity::estimate_question_count;
use crate::domain::{Artifact, ArtifactProgress, Phase, Quiz, QuizHistoryItem};
use crate::gate::GateOverride;
use crate::markers::ArtifactBlock;
use crate::protocol::{quiz_out, ArtifactOut, RemoteQuizState, SessionSnapshot, SessionView};

const GENERIC_HINT: &str = "Not quite. Re-read the highlighted code and think about what would break without it.";

/// Why `set_current_quiz` did not record a quiz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuizRejection {
  NoActiveArtifact,
  /// Persisted progress has not been merged yet.
  ProgressNotReady,
  NoGate,
  AlreadyUnlocked,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuizDecision {
  Accepted,
  Rejected(QuizRejection),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactChange {
  Created(String),
  Revised(String),
  Unchanged(String),
}

impl ArtifactChange {
  pub fn id(&self) -> &str {
    match self {
      ArtifactChange::Created(id) | ArtifactChange::Revised(id) | ArtifactChange::Unchanged(id) => id,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnswerOutcome {
  pub correct: bool,
  pub hint: Option<String>,
  pub unlock_level: u32,
  pub total_questions: u32,
  pub unlocked: bool,
}

#[derive(Debug, Clone)]
pub struct GenerationSession {
  phase: Phase,
  active_artifact_id: Option<String>,
  artifacts: HashMap<String, Artifact>,
  progress: HashMap<String, ArtifactProgress>,
  // Mirrors of the active artifact's progress.
  unlock_level: u32,
  total_questions: u32,
  quiz_history: Vec<QuizHistoryItem>,
  /// False until persisted progress was merged or the hydration timeout passed.
  progress_ready: bool,
  gate: GateOverride,
}

impl GenerationSession {
  pub fn new(gate: GateOverride) -> Self {
    Self {
      phase: Phase::Initial,
      active_artifact_id: None,
      artifacts: HashMap::new(),
      progress: HashMap::new(),
      unlock_level: 0,
      total_questions: 0,
      quiz_history: Vec::new(),
      progress_ready: false,
      gate,
    }
  }

  /// A session with no persisted counterpart: progress is tracked from the start.
  pub fn fresh(gate: GateOverride) -> Self {
    let mut s = Self::new(gate);
    s.progress_ready = true;
    s
  }

  // ── Reads ──

  pub fn progress_ready(&self) -> bool {
    self.progress_ready
  }

  pub fn active_artifact_id(&self) -> Option<&str> {
    self.active_artifact_id.as_deref()
  }

  pub fn active_artifact(&self) -> Option<&Artifact> {
    self.active_artifact_id.as_ref().and_then(|id| self.artifacts.get(id))
  }

  pub fn artifact(&self, id: &str) -> Option<&Artifact> {
    self.artifacts.get(id)
  }

  pub fn progress(&self, id: &str) -> Option<&ArtifactProgress> {
    self.progress.get(id)
  }

  fn active_progress(&self) -> Option<&ArtifactProgress> {
    self.active_artifact_id.as_ref().and_then(|id| self.progress.get(id))
  }

  pub fn pending_quiz(&self) -> Option<&Quiz> {
    self.active_progress().and_then(|p| p.current_quiz.as_ref())
  }

  fn effective_total(&self, p: &ArtifactProgress) -> u32 {
    self.gate.effective_total(p.total_questions)
  }

  fn progress_unlocked(&self, p: &ArtifactProgress) -> bool {
    p.unlock_level >= self.effective_total(p)
  }

  /// Whether the artifact's content may be copied. Artifacts without progress are locked
  /// unless the override is on.
  pub fn is_unlocked(&self, id: &str) -> bool {
    match self.progress.get(id) {
      Some(p) => self.progress_unlocked(p),
      None => self.gate.is_bypassed(),
    }
  }

  /// Active artifact is gated, tracked, and waiting for a quiz.
  pub fn needs_quiz(&self) -> bool {
    self
      .active_progress()
      .map(|p| !self.progress_unlocked(p) && p.current_quiz.is_none())
      .unwrap_or(false)
  }

  /// (unlock_level, total_questions) for the active artifact, override applied.
  pub fn mirror(&self) -> (u32, u32) {
    match self.active_progress() {
      Some(p) => {
        let total = self.effective_total(p);
        (p.unlock_level.min(total), total)
      }
      None if self.gate.is_bypassed() => (0, 0),
      None => (self.unlock_level, self.total_questions),
    }
  }

  fn derived_phase(&self) -> Phase {
    let Some(id) = self.active_artifact_id.as_ref() else {
      return self.phase;
    };
    match self.progress.get(id) {
      None if self.gate.is_bypassed() => Phase::Unlocked,
      None => Phase::Coding,
      Some(p) if self.progress_unlocked(p) => Phase::Unlocked,
      Some(p) if p.current_quiz.is_some() || p.unlock_level > 0 => Phase::Unlocking,
      Some(_) => Phase::Coding,
    }
  }

  /// Phase as seen by readers. Planning is kept until the reply finishes.
  pub fn phase(&self) -> Phase {
    if self.active_artifact_id.is_none() || self.phase == Phase::Planning {
      self.phase
    } else {
      self.derived_phase()
    }
  }

  fn sync(&mut self) {
    if self.phase != Phase::Planning {
      self.phase = self.derived_phase();
    }
    let (level, total) = self.mirror();
    self.unlock_level = level;
    self.total_questions = total;
    self.quiz_history = self.active_progress().map(|p| p.quiz_history.clone()).unwrap_or_default();
  }

  // ── Transitions ──

  /// A new request was sent to the model.
  pub fn begin_planning(&mut self) {
    self.phase = Phase::Planning;
  }

  /// The model reply is complete; leave planning.
  pub fn finish_reply(&mut self) {
    self.phase = self.settled_phase();
    self.sync();
  }

  /// Phase with any in-flight reply ignored. Planning never outlives the process
  /// that started the reply, so this is what gets persisted.
  fn settled_phase(&self) -> Phase {
    match self.phase {
      Phase::Planning if self.active_artifact_id.is_some() => self.derived_phase(),
      Phase::Planning => Phase::Initial,
      _ => self.phase(),
    }
  }

  /// Record a generated artifact (new, or a new version of a known one) and make it
  /// active. An unlocked artifact stays unlocked.
  #[instrument(level = "debug", skip(self, block), fields(title = %block.title, content_len = block.content.len()))]
  pub fn set_generated_code(&mut self, block: &ArtifactBlock) -> ArtifactChange {
    let known_id = block
      .id
      .clone()
      .filter(|id| self.artifacts.contains_key(id))
      .or_else(|| {
        if block.id.is_some() {
          return None;
        }
        self.artifacts.values().find(|a| a.title == block.title).map(|a| a.id.clone())
      });

    let change = match known_id {
      Some(id) => {
        let mut next = self.artifacts[&id].clone();
        if next.revise(&block.title, &block.language, &block.content) {
          info!(target: "session", artifact_id = %id, version = next.version, "Artifact revised");
          self.artifacts.insert(id.clone(), next);
          ArtifactChange::Revised(id)
        } else {
          ArtifactChange::Unchanged(id)
        }
      }
      None => {
        let id = block.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let artifact = Artifact::new(id.clone(), block.kind, &block.title, &block.language, &block.content);
        self.artifacts.insert(id.clone(), artifact);
        let total = estimate_question_count(&block.content);
        if self.progress_ready {
          self.progress.insert(id.clone(), ArtifactProgress::new(total));
          info!(target: "session", artifact_id = %id, total_questions = total, "Artifact created");
        } else {
          // Untracked: mirrors show this artifact's defaults.
          self.unlock_level = 0;
          self.total_questions = total;
          info!(target: "session", artifact_id = %id, "Artifact created before progress was loaded; progress deferred");
        }
        ArtifactChange::Created(id)
      }
    };

    self.active_artifact_id = Some(change.id().to_string());
    if self.phase == Phase::Planning {
      self.phase = Phase::Coding;
    }
    self.sync();
    change
  }

  /// Offer a quiz for the active artifact. `total_hint` is the model's stated question
  /// count, if any.
  #[instrument(level = "debug", skip(self, quiz), fields(question_len = quiz.question.len()))]
  pub fn set_current_quiz(&mut self, mut quiz: Quiz, total_hint: Option<u32>) -> QuizDecision {
    let Some(id) = self.active_artifact_id.clone() else {
      return self.reject(QuizRejection::NoActiveArtifact);
    };
    let Some(current) = self.progress.get(&id) else {
      return self.reject(if self.progress_ready {
        QuizRejection::NoActiveArtifact
      } else {
        QuizRejection::ProgressNotReady
      });
    };
    if self.effective_total(current) == 0 {
      return self.reject(QuizRejection::NoGate);
    }
    if self.progress_unlocked(current) {
      return self.reject(QuizRejection::AlreadyUnlocked);
    }

    let mut next = current.clone();
    if let Some(t) = total_hint.filter(|t| *t > 0) {
      next.total_questions = t.max(next.unlock_level + 1);
    }
    if quiz.level != next.unlock_level {
      debug!(target: "session", artifact_id = %id, quiz_level = quiz.level, unlock_level = next.unlock_level, "Quiz level realigned to progress");
      quiz.level = next.unlock_level;
    }
    next.current_quiz = Some(quiz);
    self.progress.insert(id.clone(), next);
    self.phase = Phase::Unlocking;
    self.sync();
    info!(target: "session", artifact_id = %id, "Quiz pending");
    QuizDecision::Accepted
  }

  fn reject(&self, why: QuizRejection) -> QuizDecision {
    debug!(target: "session", reason = ?why, "Quiz rejected");
    QuizDecision::Rejected(why)
  }

  /// Offer several quizzes at once: the first becomes pending, the rest are queued for
  /// the following levels.
  pub fn offer_quizzes(&mut self, quizzes: Vec<Quiz>, total_hint: Option<u32>) -> QuizDecision {
    let mut iter = quizzes.into_iter();
    let Some(first) = iter.next() else {
      return QuizDecision::Rejected(QuizRejection::NoActiveArtifact);
    };
    let decision = self.set_current_quiz(first, total_hint);
    if decision != QuizDecision::Accepted {
      return decision;
    }
    let Some(id) = self.active_artifact_id.clone() else { return decision };
    if let Some(current) = self.progress.get(&id) {
      let room = self.effective_total(current).saturating_sub(current.unlock_level + 1) as usize;
      let mut next = current.clone();
      next.queued = iter.take(room).collect();
      self.progress.insert(id, next);
    }
    decision
  }

  /// Score an answer to the pending quiz. None when no quiz is pending.
  #[instrument(level = "debug", skip(self, answer), fields(answer_len = answer.len()))]
  pub fn answer_quiz(&mut self, answer: &str, message_index: Option<u32>) -> Option<AnswerOutcome> {
    let id = self.active_artifact_id.clone()?;
    let current = self.progress.get(&id)?;
    if self.progress_unlocked(current) {
      debug!(target: "session", artifact_id = %id, "Answer ignored: artifact already unlocked");
      return None;
    }
    let quiz = current.current_quiz.clone()?;
    let total = self.effective_total(current);
    let correct = quiz.is_correct(answer);
    let mut next = current.clone();

    let hint = if correct {
      next.quiz_history.push(QuizHistoryItem {
        level: quiz.level,
        question: quiz.question.clone(),
        answer: answer.trim().to_string(),
        correct: true,
        message_index,
        quiz: Some(quiz),
      });
      next.unlock_level = (next.unlock_level + 1).min(total);
      next.current_quiz = None;
      if next.unlock_level >= total {
        next.queued.clear();
      } else if !next.queued.is_empty() {
        let mut promoted = next.queued.remove(0);
        promoted.level = next.unlock_level;
        next.current_quiz = Some(promoted);
      }
      None
    } else {
      let hint = quiz
        .hint
        .clone()
        .or_else(|| quiz.option(answer).and_then(|o| o.explanation.clone()))
        .unwrap_or_else(|| GENERIC_HINT.to_string());
      next.quiz_history.push(QuizHistoryItem {
        level: quiz.level,
        question: quiz.question.clone(),
        answer: answer.trim().to_string(),
        correct: false,
        message_index,
        quiz: None,
      });
      Some(hint)
    };

    let outcome = AnswerOutcome {
      correct,
      hint,
      unlock_level: next.unlock_level,
      total_questions: total,
      unlocked: next.unlock_level >= total,
    };
    self.progress.insert(id.clone(), next);
    self.sync();
    info!(target: "session", artifact_id = %id, correct, unlock_level = outcome.unlock_level, total = total, "Quiz answered");
    Some(outcome)
  }

  /// Unlock the active artifact regardless of history. Returns false when there is
  /// nothing to unlock.
  #[instrument(level = "info", skip(self))]
  pub fn skip_to_unlock(&mut self) -> bool {
    let Some(id) = self.active_artifact_id.clone() else { return false };
    let Some(current) = self.progress.get(&id) else { return false };
    let mut next = current.clone();
    next.unlock_level = next.unlock_level.max(next.total_questions);
    next.current_quiz = None;
    next.queued.clear();
    self.progress.insert(id.clone(), next);
    self.phase = Phase::Unlocked;
    self.sync();
    info!(target: "session", artifact_id = %id, "Artifact unlocked by skip");
    true
  }

  /// Make another known artifact active and re-derive the visible progress from it.
  #[instrument(level = "debug", skip(self))]
  pub fn switch_artifact(&mut self, id: &str) -> bool {
    let Some(artifact) = self.artifacts.get(id) else {
      debug!(target: "session", artifact_id = %id, "Switch ignored: unknown artifact");
      return false;
    };
    if !self.progress.contains_key(id) {
      // Defaults for an artifact whose progress is not tracked yet.
      self.unlock_level = 0;
      self.total_questions = estimate_question_count(&artifact.content);
    }
    self.active_artifact_id = Some(id.to_string());
    if self.phase == Phase::Planning || self.phase == Phase::Initial {
      self.phase = Phase::Coding;
    }
    self.sync();
    true
  }

  /// Overwrite one artifact's progress with an authoritative quiz API response.
  #[instrument(level = "debug", skip(self, remote))]
  pub fn apply_remote_state(&mut self, artifact_id: &str, remote: RemoteQuizState) -> bool {
    if !self.artifacts.contains_key(artifact_id) {
      return false;
    }
    let mut next = self.progress.get(artifact_id).cloned().unwrap_or_default();
    next.total_questions = remote.total_questions;
    next.unlock_level = remote.unlock_level.min(remote.total_questions);
    next.current_quiz = if next.unlock_level >= next.total_questions { None } else { remote.pending };
    next.queued.clear();
    self.progress.insert(artifact_id.to_string(), next);
    self.sync();
    true
  }

  // ── Persistence ──

  /// Current state in the persisted shape.
  pub fn snapshot(&self) -> SessionSnapshot {
    let (level, total) = self.mirror();
    SessionSnapshot {
      phase: Some(self.settled_phase()),
      unlock_level: Some(level),
      total_questions: Some(total),
      artifacts: self.artifacts.clone(),
      active_artifact_id: self.active_artifact_id.clone(),
      artifact_progress: self.progress.clone(),
      quiz_history: Some(self.active_progress().map(|p| p.quiz_history.clone()).unwrap_or_default()),
    }
  }

  /// Merge a persisted snapshot into local state.
  ///
  /// Progress: incoming entries win, local entries survive only where incoming has
  /// none. Artifacts: the higher version wins, ties go to incoming. Scalars are taken
  /// from incoming when present, then reconciled against the active progress. An
  /// incoming planning phase is stale (its reply died with the previous process) and
  /// never replaces the local phase; a local planning phase belongs to a live reply
  /// and is kept.
  pub fn merge_snapshot(&mut self, incoming: SessionSnapshot) {
    for (id, artifact) in incoming.artifacts {
      let keep_local = self.artifacts.get(&id).map(|l| l.version > artifact.version).unwrap_or(false);
      if !keep_local {
        self.artifacts.insert(id, artifact);
      }
    }
    for (id, p) in incoming.artifact_progress {
      self.progress.insert(id, p);
    }
    if let Some(phase) = incoming.phase.filter(|p| *p != Phase::Planning && self.phase != Phase::Planning) {
      self.phase = phase;
    }
    if let Some(level) = incoming.unlock_level {
      self.unlock_level = level;
    }
    if let Some(total) = incoming.total_questions {
      self.total_questions = total;
    }
    if let Some(history) = incoming.quiz_history {
      self.quiz_history = history;
    }
    if let Some(active) = incoming.active_artifact_id.filter(|id| self.artifacts.contains_key(id)) {
      self.active_artifact_id = Some(active);
    }
    if self.unlock_level > self.total_questions {
      self.unlock_level = self.total_questions;
    }
    if self.phase != Phase::Planning && self.active_progress().is_some() {
      self.sync();
    }
  }

  /// Start tracking progress: every artifact without an entry gets default progress.
  pub fn open_progress(&mut self) {
    self.progress_ready = true;
    let missing: Vec<(String, u32)> = self
      .artifacts
      .values()
      .filter(|a| !self.progress.contains_key(&a.id))
      .map(|a| (a.id.clone(), estimate_question_count(&a.content)))
      .collect();
    for (id, total) in missing {
      debug!(target: "session", artifact_id = %id, total_questions = total, "Default progress created");
      self.progress.insert(id, ArtifactProgress::new(total));
    }
    if self.active_artifact_id.is_some() && self.active_progress().is_some() {
      self.sync();
    }
  }

  // ── View ──

  pub fn view(&self) -> SessionView {
    let (unlock_level, total_questions) = self.mirror();
    let mut artifacts: Vec<&Artifact> = self.artifacts.values().collect();
    artifacts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    SessionView {
      phase: self.phase(),
      unlock_level,
      total_questions,
      active_artifact_id: self.active_artifact_id.clone(),
      artifacts: artifacts
        .into_iter()
        .map(|a| {
          let unlocked = self.is_unlocked(&a.id);
          ArtifactOut {
            id: a.id.clone(),
            title: a.title.clone(),
            language: a.language.clone(),
            version: a.version,
            locked: !unlocked,
            content: unlocked.then(|| a.content.clone()),
          }
        })
        .collect(),
      current_quiz: self.pending_quiz().filter(|_| !self.active_unlocked()).map(quiz_out),
      quiz_history: self.active_progress().map(|p| p.quiz_history.clone()).unwrap_or_else(|| self.quiz_history.clone()),
      hydrated: self.progress_ready,
    }
  }

  fn active_unlocked(&self) -> bool {
    self.active_artifact_id.as_deref().map(|id| self.is_unlocked(id)).unwrap_or(false)
  }
}
