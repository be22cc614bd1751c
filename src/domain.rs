//! Domain models: artifacts, quizzes, answer history and per-artifact unlock progress.
//!
//! Levels stored here are always 0-based. The 1-based wire form lives in `protocol`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of content an artifact carries.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
  #[default]
  Code,
  Component,
  Config,
}

impl ArtifactKind {
  /// Lenient parse for the `kind` attribute of artifact blocks.
  pub fn from_attr(s: &str) -> Self {
    match s.trim().to_ascii_lowercase().as_str() {
      "component" => ArtifactKind::Component,
      "config" | "configuration" => ArtifactKind::Config,
      _ => ArtifactKind::Code,
    }
  }
}

/// A generated content unit. Editing replaces content and bumps `version`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
  pub id: String,
  pub kind: ArtifactKind,
  pub title: String,
  pub content: String,
  pub language: String,
  pub version: u32,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Artifact {
  pub fn new(id: impl Into<String>, kind: ArtifactKind, title: impl Into<String>, language: impl Into<String>, content: impl Into<String>) -> Self {
    let now = Utc::now();
    Self {
      id: id.into(),
      kind,
      title: title.into(),
      content: content.into(),
      language: language.into(),
      version: 1,
      created_at: now,
      updated_at: now,
    }
  }

  /// Replace content in place of a new version. No-op if nothing changed.
  pub fn revise(&mut self, title: &str, language: &str, content: &str) -> bool {
    if self.content == content && self.title == title && self.language == language {
      return false;
    }
    self.title = title.to_string();
    self.language = language.to_string();
    self.content = content.to_string();
    self.version += 1;
    self.updated_at = Utc::now();
    true
  }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuizOption {
  pub label: String,
  pub text: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub explanation: Option<String>,
}

impl QuizOption {
  pub fn new(label: impl Into<String>, text: impl Into<String>) -> Self {
    Self { label: label.into(), text: text.into(), explanation: None }
  }

  pub fn explained(label: impl Into<String>, text: impl Into<String>, explanation: impl Into<String>) -> Self {
    Self { label: label.into(), text: text.into(), explanation: Some(explanation.into()) }
  }
}

/// One multiple-choice question bound to an artifact level.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Quiz {
  /// 0-based.
  pub level: u32,
  pub question: String,
  pub options: Vec<QuizOption>,
  pub correct_label: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub hint: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub code_snippet: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub code_language: Option<String>,
}

impl Quiz {
  /// At least two options, non-empty question, and the correct label names one of them.
  pub fn is_well_formed(&self) -> bool {
    !self.question.trim().is_empty()
      && self.options.len() >= 2
      && self.option(&self.correct_label).is_some()
  }

  pub fn option(&self, label: &str) -> Option<&QuizOption> {
    let wanted = normalize_label(label)?;
    self.options.iter().find(|o| normalize_label(&o.label).as_deref() == Some(wanted.as_str()))
  }

  pub fn is_correct(&self, answer: &str) -> bool {
    match (normalize_label(answer), normalize_label(&self.correct_label)) {
      (Some(a), Some(c)) => a == c,
      _ => false,
    }
  }
}

/// Canonical label form: trimmed, uppercase, full-width Latin letters folded to ASCII.
/// Returns None for an empty label.
pub fn normalize_label(label: &str) -> Option<String> {
  let t = label.trim().trim_matches(|c: char| matches!(c, '(' | ')' | '（' | '）' | '.' | ':'));
  if t.is_empty() {
    return None;
  }
  Some(t.chars().map(fold_fullwidth).flat_map(char::to_uppercase).collect())
}

/// Map full-width ASCII variants (U+FF01..U+FF5E) onto their half-width form.
pub fn fold_fullwidth(c: char) -> char {
  match c {
    '\u{FF01}'..='\u{FF5E}' => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
    _ => c,
  }
}

/// Immutable record of one answer event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuizHistoryItem {
  pub level: u32,
  pub question: String,
  pub answer: String,
  pub correct: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub message_index: Option<u32>,
  /// Only present for correct answers, so the card can be redisplayed.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub quiz: Option<Quiz>,
}

/// Unlock ledger for one artifact.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactProgress {
  pub unlock_level: u32,
  /// 0 means no gate.
  pub total_questions: u32,
  #[serde(default)]
  pub current_quiz: Option<Quiz>,
  /// Extra quizzes recovered from the same reply, served after the pending one.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub queued: Vec<Quiz>,
  #[serde(default)]
  pub quiz_history: Vec<QuizHistoryItem>,
}

impl ArtifactProgress {
  pub fn new(total_questions: u32) -> Self {
    Self { total_questions, ..Default::default() }
  }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
  #[default]
  Initial,
  Planning,
  Coding,
  Unlocking,
  Unlocked,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn quiz() -> Quiz {
    Quiz {
      level: 0,
      question: "Why?".into(),
      options: vec![QuizOption::new("A", "x"), QuizOption::new("B", "y")],
      correct_label: "B".into(),
      hint: None,
      code_snippet: None,
      code_language: None,
    }
  }

  #[test]
  fn labels_fold_case_and_width() {
    assert_eq!(normalize_label("Ｂ").as_deref(), Some("B"));
    assert_eq!(normalize_label(" b ").as_deref(), Some("B"));
    assert_eq!(normalize_label("(c)").as_deref(), Some("C"));
    assert_eq!(normalize_label("  "), None);
  }

  #[test]
  fn answer_matching_ignores_width() {
    let q = quiz();
    assert!(q.is_correct("b"));
    assert!(q.is_correct("Ｂ"));
    assert!(!q.is_correct("A"));
    assert!(!q.is_correct(""));
  }

  #[test]
  fn well_formed_requires_existing_correct_label() {
    let mut q = quiz();
    assert!(q.is_well_formed());
    q.correct_label = "D".into();
    assert!(!q.is_well_formed());
    q.correct_label = "A".into();
    q.options.truncate(1);
    assert!(!q.is_well_formed());
  }

  #[test]
  fn revise_bumps_version_only_on_change() {
    let mut a = Artifact::new("a1", ArtifactKind::Code, "t", "rust", "fn main() {}");
    assert!(!a.revise("t", "rust", "fn main() {}"));
    assert_eq!(a.version, 1);
    assert!(a.revise("t", "rust", "fn main() { run(); }"));
    assert_eq!(a.version, 2);
    assert!(a.updated_at >= a.created_at);
  }
}
