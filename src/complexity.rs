//! Complexity estimation: how many quiz questions an artifact should require.
//!
//! The construct table here is shared with the fallback synthesizer, which asks
//! about the same constructs the estimator scores.

use std::sync::OnceLock;

use regex::Regex;

pub const MIN_QUESTIONS: u32 = 1;
pub const MAX_QUESTIONS: u32 = 7;

/// Advanced constructs worth a point of complexity (and a fallback question).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstructKind {
  AsyncFlow,
  MemoHook,
  ErrorHandling,
  Reduce,
  OptionalChaining,
  Concurrency,
  TypeDeclaration,
}

/// Priority order used by the synthesizer.
pub const CONSTRUCTS: [ConstructKind; 7] = [
  ConstructKind::AsyncFlow,
  ConstructKind::MemoHook,
  ConstructKind::ErrorHandling,
  ConstructKind::Reduce,
  ConstructKind::OptionalChaining,
  ConstructKind::Concurrency,
  ConstructKind::TypeDeclaration,
];

impl ConstructKind {
  fn pattern(self) -> &'static str {
    match self {
      ConstructKind::AsyncFlow => r"\bawait\b|\basync\s+(?:fn|function|def)\b|\basync\s*\(|\.then\s*\(",
      ConstructKind::MemoHook => r"\buse(?:Memo|Callback)\s*\(",
      ConstructKind::ErrorHandling => r"\btry\s*\{|\bcatch\s*\(|\btry\s*:|\bexcept\b|\?;|\bResult<",
      ConstructKind::Reduce => r"\.reduce\s*\(|\.fold\s*\(|\breduce\s*\(",
      ConstructKind::OptionalChaining => r"\?\.|\?\?",
      ConstructKind::Concurrency => {
        r"Promise\.(?:all|race|allSettled|any)\s*\(|\bjoin!\s*\(|\bselect!\s*\{|asyncio\.gather\s*\("
      }
      ConstructKind::TypeDeclaration => {
        r"\b(?:class|interface|trait)\s+[A-Z]\w*|\b[A-Z]\w*<[A-Z]\w*(?:\s*,\s*[A-Z]\w*)*>"
      }
    }
  }

  fn regex(self) -> &'static Regex {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    let all = RES.get_or_init(|| {
      CONSTRUCTS
        .iter()
        .map(|k| Regex::new(k.pattern()).expect("construct regex"))
        .collect()
    });
    let idx = CONSTRUCTS.iter().position(|k| *k == self).unwrap_or(0);
    &all[idx]
  }

  /// First match in the source, if any.
  pub fn find<'a>(self, source: &'a str) -> Option<&'a str> {
    self.regex().find(source).map(|m| m.as_str())
  }
}

/// A construct found in source text, with the line it appears on.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstructHit {
  pub kind: ConstructKind,
  pub matched: String,
  pub line: String,
}

/// Every construct kind present in the source, in priority order.
pub fn detect_constructs(source: &str) -> Vec<ConstructHit> {
  CONSTRUCTS
    .iter()
    .filter_map(|&kind| {
      let m = kind.regex().find(source)?;
      let line_start = source[..m.start()].rfind('\n').map(|i| i + 1).unwrap_or(0);
      let line_end = source[m.end()..].find('\n').map(|i| m.end() + i).unwrap_or(source.len());
      Some(ConstructHit {
        kind,
        matched: m.as_str().trim().to_string(),
        line: source[line_start..line_end].trim().to_string(),
      })
    })
    .collect()
}

fn definition_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| {
    Regex::new(r"\bfunction\s+\w+|\bfn\s+\w+|\bdef\s+\w+|=>|\b(?:const|let)\s+\w+\s*=\s*(?:async\s*)?\(")
      .expect("definition regex")
  })
}

fn line_points(non_blank: usize) -> u32 {
  match non_blank {
    0..=19 => 0,
    20..=49 => 1,
    50..=99 => 2,
    100..=199 => 3,
    _ => 4,
  }
}

/// Bonus when definitions are dense (at least one per ten lines).
fn density_points(definitions: usize, non_blank: usize) -> u32 {
  let dense = definitions * 10 >= non_blank;
  match definitions {
    d if d >= 8 && dense => 2,
    d if d >= 3 && dense => 1,
    _ => 0,
  }
}

/// Raw complexity score of a source text.
pub fn complexity_score(source: &str) -> u32 {
  let non_blank = source.lines().filter(|l| !l.trim().is_empty()).count();
  let constructs = detect_constructs(source).len() as u32;
  let definitions = definition_re().find_iter(source).count();
  line_points(non_blank) + constructs + density_points(definitions, non_blank)
}

/// Map a score onto a question count. Monotonic, 1..=7.
pub fn questions_for_score(score: u32) -> u32 {
  let n = match score {
    0 => 1,
    1..=2 => 2,
    3..=4 => 3,
    5..=6 => 4,
    7..=9 => 5,
    s => 5 + (s - 10) / 3,
  };
  n.clamp(MIN_QUESTIONS, MAX_QUESTIONS)
}

/// Recommended number of quiz questions for an artifact. Advisory only.
pub fn estimate_question_count(source: &str) -> u32 {
  if source.trim().is_empty() {
    return MIN_QUESTIONS;
  }
  questions_for_score(complexity_score(source))
}
