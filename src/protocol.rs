//! Public protocol structs: the in-band quiz payload, the persistence snapshot,
//! the per-artifact quiz API responses and the HTTP/WebSocket DTOs.
//!
//! Wire levels are 1-based, internal levels are 0-based. The only place the
//! offset is applied is `level_from_wire` / `level_to_wire`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::{Artifact, ArtifactProgress, Phase, Quiz, QuizHistoryItem, QuizOption};

/// 1-based wire level -> 0-based internal level. Level 0 on the wire is treated as 1.
pub fn level_from_wire(level: u32) -> u32 {
    level.saturating_sub(1)
}

/// 0-based internal level -> 1-based wire level.
pub fn level_to_wire(level: u32) -> u32 {
    level.saturating_add(1)
}

fn default_wire_level() -> u32 {
    1
}

/// Option as it appears inside a quiz payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WireOption {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// Quiz object embedded in model output and returned by the quiz API.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireQuiz {
    #[serde(default = "default_wire_level")]
    pub level: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_questions: Option<u32>,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub options: Vec<WireOption>,
    #[serde(default)]
    pub correct_label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_language: Option<String>,
}

impl WireQuiz {
    /// Convert to the internal form. Missing option labels are filled sequentially.
    /// Returns None when the payload is not a usable quiz.
    pub fn into_quiz(self) -> Option<Quiz> {
        let options: Vec<QuizOption> = self
            .options
            .into_iter()
            .filter(|o| !o.text.trim().is_empty())
            .enumerate()
            .map(|(i, o)| {
                let label = if o.label.trim().is_empty() {
                    sequential_label(i)
                } else {
                    o.label.trim().to_string()
                };
                QuizOption {
                    label,
                    text: o.text.trim().to_string(),
                    explanation: o.explanation.filter(|e| !e.trim().is_empty()),
                }
            })
            .collect();

        let quiz = Quiz {
            level: level_from_wire(self.level),
            question: self.question.trim().to_string(),
            options,
            correct_label: self.correct_label.trim().to_string(),
            hint: self.hint.filter(|h| !h.trim().is_empty()),
            code_snippet: self.code_snippet.filter(|s| !s.trim().is_empty()),
            code_language: self.code_language.filter(|s| !s.trim().is_empty()),
        };
        quiz.is_well_formed().then_some(quiz)
    }

    pub fn from_quiz(quiz: &Quiz, total_questions: Option<u32>) -> Self {
        Self {
            level: level_to_wire(quiz.level),
            total_questions,
            question: quiz.question.clone(),
            options: quiz
                .options
                .iter()
                .map(|o| WireOption {
                    label: o.label.clone(),
                    text: o.text.clone(),
                    explanation: o.explanation.clone(),
                })
                .collect(),
            correct_label: quiz.correct_label.clone(),
            hint: quiz.hint.clone(),
            code_snippet: quiz.code_snippet.clone(),
            code_language: quiz.code_language.clone(),
        }
    }
}

/// A, B, C, ... then AA-style fallbacks are never needed (max 26 options).
pub fn sequential_label(index: usize) -> String {
    char::from_u32('A' as u32 + (index as u32 % 26))
        .map(String::from)
        .unwrap_or_else(|| "A".into())
}

/// Unit exchanged with the persistence collaborator.
///
/// Scalars are optional so that partially written snapshots merge cleanly.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock_level: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_questions: Option<u32>,
    #[serde(default)]
    pub artifacts: HashMap<String, Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_artifact_id: Option<String>,
    #[serde(default)]
    pub artifact_progress: HashMap<String, ArtifactProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiz_history: Option<Vec<QuizHistoryItem>>,
}

//
// Per-artifact quiz API (external collaborator) responses
//

/// `fetch` / `generate` response for one artifact.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuizListing {
    pub items: Vec<WireQuiz>,
    pub total: u32,
    /// 1-based level of the next question to answer.
    pub current_level: u32,
    pub unlocked: bool,
}

/// `answer` response for one quiz id.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuizAnswerResult {
    pub correct: bool,
    /// 1-based level of the next question to answer.
    pub current_level: u32,
    pub total: u32,
    pub unlocked: bool,
    #[serde(default)]
    pub next_quiz: Option<WireQuiz>,
}

/// Authoritative progress for one artifact as reported by the quiz API, in internal form.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteQuizState {
    pub unlock_level: u32,
    pub total_questions: u32,
    pub pending: Option<Quiz>,
}

impl From<QuizListing> for RemoteQuizState {
    fn from(l: QuizListing) -> Self {
        let unlock_level = if l.unlocked { l.total } else { level_from_wire(l.current_level).min(l.total) };
        let pending = if l.unlocked {
            None
        } else {
            l.items
                .into_iter()
                .filter_map(WireQuiz::into_quiz)
                .find(|q| q.level == unlock_level)
        };
        Self { unlock_level, total_questions: l.total, pending }
    }
}

impl From<QuizAnswerResult> for RemoteQuizState {
    fn from(r: QuizAnswerResult) -> Self {
        let unlock_level = if r.unlocked { r.total } else { level_from_wire(r.current_level).min(r.total) };
        let pending = if r.unlocked { None } else { r.next_quiz.and_then(WireQuiz::into_quiz) };
        Self { unlock_level, total_questions: r.total, pending }
    }
}

//
// Outbound views
//

/// Quiz as served to the learner: 1-based level, no correct label.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizOut {
    pub level: u32,
    pub question: String,
    pub options: Vec<QuizOptionOut>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_language: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct QuizOptionOut {
    pub label: String,
    pub text: String,
}

pub fn quiz_out(q: &Quiz) -> QuizOut {
    QuizOut {
        level: level_to_wire(q.level),
        question: q.question.clone(),
        options: q
            .options
            .iter()
            .map(|o| QuizOptionOut { label: o.label.clone(), text: o.text.clone() })
            .collect(),
        code_snippet: q.code_snippet.clone(),
        code_language: q.code_language.clone(),
    }
}

/// Artifact view. Content is withheld while the artifact is gated.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactOut {
    pub id: String,
    pub title: String,
    pub language: String,
    pub version: u32,
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub phase: Phase,
    pub unlock_level: u32,
    pub total_questions: u32,
    pub active_artifact_id: Option<String>,
    pub artifacts: Vec<ArtifactOut>,
    pub current_quiz: Option<QuizOut>,
    pub quiz_history: Vec<QuizHistoryItem>,
    pub hydrated: bool,
}

//
// HTTP request/response DTOs
//

#[derive(Debug, Deserialize)]
pub struct StreamIn {
    pub text: String,
    #[serde(default)]
    pub done: bool,
}
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamOut {
    pub visible_text: String,
    pub session: SessionView,
}

#[derive(Debug, Deserialize)]
pub struct GenerateIn {
    pub prompt: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerIn {
    pub answer: String,
    #[serde(default)]
    pub message_index: Option<u32>,
}
#[derive(Debug, Serialize)]
pub struct AnswerOut {
    /// False when no quiz was pending.
    pub accepted: bool,
    pub correct: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    pub session: SessionView,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveIn {
    pub artifact_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GateIn {
    pub bypass: bool,
}

/// Body of the quiz-state endpoint: either response shape of the quiz API.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum QuizStateIn {
    Answer(QuizAnswerResult),
    Listing(QuizListing),
}

#[derive(Serialize)]
pub struct HealthOut {
    pub ok: bool,
}

//
// WebSocket
//

/// Messages the client can send over WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientWsMessage {
    Ping,
    Open {
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },
    Chunk {
        text: String,
        #[serde(default)]
        done: bool,
    },
    Answer {
        answer: String,
        #[serde(default, rename = "messageIndex")]
        message_index: Option<u32>,
    },
    Skip,
    SwitchArtifact {
        #[serde(rename = "artifactId")]
        artifact_id: String,
    },
}

/// Messages the server sends back over WebSocket.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerWsMessage {
    Pong,
    Session {
        session: SessionView,
    },
    Stream {
        #[serde(rename = "visibleText")]
        visible_text: String,
        session: SessionView,
    },
    AnswerResult {
        accepted: bool,
        correct: bool,
        hint: Option<String>,
        session: SessionView,
    },
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire() -> WireQuiz {
        serde_json::from_str(
            r#"{"level":2,"totalQuestions":3,"question":"Why await?","options":[{"label":"A","text":"x"},{"label":"B","text":"y","explanation":"because"}],"correctLabel":"B"}"#,
        )
        .expect("wire quiz")
    }

    #[test]
    fn level_conversion_applies_offset_once() {
        let q = wire().into_quiz().expect("quiz");
        assert_eq!(q.level, 1);
        let back = WireQuiz::from_quiz(&q, Some(3));
        assert_eq!(back.level, 2);
        assert_eq!(back.into_quiz().expect("quiz").level, 1);
    }

    #[test]
    fn level_zero_on_wire_maps_to_first_level() {
        assert_eq!(level_from_wire(0), 0);
        assert_eq!(level_from_wire(1), 0);
        assert_eq!(level_to_wire(0), 1);
    }

    #[test]
    fn missing_labels_are_filled_sequentially() {
        let mut w = wire();
        w.options.iter_mut().for_each(|o| o.label.clear());
        let q = w.into_quiz().expect("quiz");
        assert_eq!(q.options[0].label, "A");
        assert_eq!(q.options[1].label, "B");
    }

    #[test]
    fn invalid_payloads_are_rejected() {
        let mut w = wire();
        w.options.truncate(1);
        w.correct_label = "A".into();
        assert!(w.into_quiz().is_none());

        let mut w = wire();
        w.question = "   ".into();
        assert!(w.into_quiz().is_none());
    }

    #[test]
    fn listing_maps_to_internal_levels() {
        let listing = QuizListing { items: vec![wire()], total: 3, current_level: 2, unlocked: false };
        let state = RemoteQuizState::from(listing);
        assert_eq!(state.unlock_level, 1);
        assert_eq!(state.total_questions, 3);
        assert_eq!(state.pending.expect("pending").level, 1);
    }

    #[test]
    fn unlocked_answer_result_has_no_pending_quiz() {
        let r = QuizAnswerResult { correct: true, current_level: 4, total: 3, unlocked: true, next_quiz: Some(wire()) };
        let state = RemoteQuizState::from(r);
        assert_eq!(state.unlock_level, 3);
        assert!(state.pending.is_none());
    }

    #[test]
    fn snapshot_uses_camel_case_keys() {
        let snap = SessionSnapshot { unlock_level: Some(1), active_artifact_id: Some("a".into()), ..Default::default() };
        let v = serde_json::to_value(&snap).expect("json");
        assert_eq!(v["unlockLevel"], 1);
        assert_eq!(v["activeArtifactId"], "a");
        assert!(v.get("phase").is_none());
    }
}
