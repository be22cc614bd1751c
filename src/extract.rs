//! Quiz extraction as an ordered chain of strategies.
//!
//! Each strategy answers `Parsed`, `NeedMoreData` or `NotFound`. The chain stops at
//! the first `Parsed`; `NeedMoreData` stops it only while the stream is still open.
//! Synthesis from the artifact source is not part of the chain: it needs the
//! artifact rather than the text, and the caller applies it when the chain ends
//! with `NotFound`.

use tracing::debug;

use crate::domain::Quiz;
use crate::heuristic::split_quiz_blocks;
use crate::markers::{scan_quiz_marker, visible_text, MarkerScan};

#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
  /// One or more quizzes, in the order they appeared.
  Parsed(Vec<Quiz>),
  NeedMoreData,
  NotFound,
}

pub trait QuizStrategy: Send + Sync {
  fn name(&self) -> &'static str;
  fn extract(&self, text: &str) -> Extraction;
}

/// In-band `<!--QUIZ:...-->` marker.
pub struct MarkerStrategy;

impl QuizStrategy for MarkerStrategy {
  fn name(&self) -> &'static str {
    "marker"
  }

  fn extract(&self, text: &str) -> Extraction {
    match scan_quiz_marker(text) {
      MarkerScan::Found(w) => match w.into_quiz() {
        Some(q) => Extraction::Parsed(vec![q]),
        None => Extraction::NotFound,
      },
      MarkerScan::Incomplete => Extraction::NeedMoreData,
      MarkerScan::Malformed | MarkerScan::Absent => Extraction::NotFound,
    }
  }
}

/// Loosely formatted options in free text, possibly several blocks. Artifact bodies
/// and markers are stripped first so option-like lines inside code are ignored.
pub struct HeuristicStrategy;

impl QuizStrategy for HeuristicStrategy {
  fn name(&self) -> &'static str {
    "heuristic"
  }

  fn extract(&self, text: &str) -> Extraction {
    let out = split_quiz_blocks(&visible_text(text));
    debug!(target: "quiz", quizzes = out.quizzes.len(), narrative_len = out.narrative.len(), "Heuristic split");
    if out.quizzes.is_empty() {
      Extraction::NotFound
    } else {
      Extraction::Parsed(out.quizzes)
    }
  }
}

pub struct ExtractionChain {
  strategies: Vec<Box<dyn QuizStrategy>>,
}

impl ExtractionChain {
  pub fn new(strategies: Vec<Box<dyn QuizStrategy>>) -> Self {
    Self { strategies }
  }

  /// Only the marker: safe to run on every streamed chunk.
  pub fn streaming() -> Self {
    Self::new(vec![Box::new(MarkerStrategy)])
  }

  /// Marker, then heuristics. For the complete reply.
  pub fn complete() -> Self {
    Self::new(vec![Box::new(MarkerStrategy), Box::new(HeuristicStrategy)])
  }

  /// Run strategies in order. Returns the outcome and the name of the strategy that
  /// produced it.
  pub fn run(&self, text: &str, stream_done: bool) -> (Extraction, Option<&'static str>) {
    for s in &self.strategies {
      match s.extract(text) {
        Extraction::Parsed(q) => {
          debug!(target: "quiz", strategy = s.name(), count = q.len(), "Quiz extracted");
          return (Extraction::Parsed(q), Some(s.name()));
        }
        Extraction::NeedMoreData if !stream_done => return (Extraction::NeedMoreData, Some(s.name())),
        Extraction::NeedMoreData => {
          debug!(target: "quiz", strategy = s.name(), "Stream ended inside a marker; falling through");
        }
        Extraction::NotFound => {}
      }
    }
    (Extraction::NotFound, None)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const MARKED: &str = r#"<!--QUIZ:{"question":"Why await?","options":[{"label":"A","text":"x"},{"label":"B","text":"y"}],"correctLabel":"B"}-->"#;

  #[test]
  fn marker_wins_over_heuristics() {
    let text = format!("A) one B) two\n{MARKED}");
    let (out, by) = ExtractionChain::complete().run(&text, true);
    assert_eq!(by, Some("marker"));
    match out {
      Extraction::Parsed(q) => assert_eq!(q[0].question, "Why await?"),
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn open_marker_waits_while_streaming() {
    let text = "A) one B) two <!--QUIZ:{\"question\"";
    let (out, _) = ExtractionChain::complete().run(text, false);
    assert_eq!(out, Extraction::NeedMoreData);
  }

  #[test]
  fn open_marker_falls_through_when_stream_done() {
    let text = "A) one B) two\n<!--QUIZ:{\"question\"";
    let (out, by) = ExtractionChain::complete().run(text, true);
    assert_eq!(by, Some("heuristic"));
    assert!(matches!(out, Extraction::Parsed(ref q) if q[0].options.len() == 2));
  }

  #[test]
  fn malformed_marker_falls_through_to_heuristics() {
    let text = "<!--QUIZ:{\"question\":\"\"}-->\nWhy?\nA. yes\nB. no";
    let (out, by) = ExtractionChain::complete().run(text, true);
    assert_eq!(by, Some("heuristic"));
    assert!(matches!(out, Extraction::Parsed(_)));
  }

  #[test]
  fn nothing_found() {
    let (out, by) = ExtractionChain::complete().run("plain prose only", true);
    assert_eq!(out, Extraction::NotFound);
    assert_eq!(by, None);
  }

  #[test]
  fn streaming_chain_ignores_loose_options() {
    let (out, _) = ExtractionChain::streaming().run("A) one B) two", false);
    assert_eq!(out, Extraction::NotFound);
  }
}
