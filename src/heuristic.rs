//! Heuristic quiz recovery from loosely formatted model text.
//!
//! Used when the reply carries no quiz marker. Three option layouts are tried in
//! priority order:
//!   1. one option per line, optional bullet       `- A. uses cache`
//!   2. several options inline on one line         `A) uses cache B) avoids recompute`
//!   3. options wrapped in parentheses             `(A) uses cache (B) ...`
//! A layout is accepted only with 2..=4 options and distinct labels. Half-width and
//! full-width A-D share one label space.
//!
//! `split_quiz_blocks` handles replies that contain several option sets in a row.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::domain::{normalize_label, Quiz, QuizOption};

/// Used when no question sentence can be recovered.
pub const QUESTION_FALLBACK: &str =
  "Sorry, the question text could not be recovered. Choose the option that best explains the code above.";

const MIN_OPTIONS: usize = 2;
const MAX_OPTIONS: usize = 4;
/// Inline options this long mean the line was mis-segmented.
const INLINE_OPTION_MAX_CHARS: usize = 200;

fn line_option_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| {
    Regex::new(r"(?m)^[ \t]*(?:[-*•·][ \t]*)?([A-DＡ-Ｄ])[ \t]*[.．)）:：、][ \t]*(\S[^\n]*?)[ \t]*$")
      .expect("line option regex")
  })
}

fn inline_label_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"(?:^|[\s,;，；])([A-DＡ-Ｄ])[.．)）:：、]").expect("inline label regex"))
}

fn paren_option_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"[(（]([A-DＡ-Ｄ])[)）][ \t]*([^(（\n]+)").expect("paren option regex"))
}

fn bracket_header_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"^(?:\[(.+)\]|【(.+)】)$").expect("bracket header regex"))
}

fn question_sentence_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"[^.!?。！？\n]*[?？]").expect("question sentence regex"))
}

fn answer_key_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| {
    Regex::new(r"(?:(?i:correct[ \t]+answer|answer)|正确答案|答案)[ \t]*(?:(?i:is)[ \t]*)?[:：]?[ \t]*[(（]?([A-DＡ-Ｄ])\b")
      .expect("answer key regex")
  })
}

fn block_boundary_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| {
    Regex::new(
      r"(?mi)^[ \t]*(?:#{1,6}[ \t]*)?(?:\*\*)?(?:question[ \t]*\d+|q[ \t]*[-.]?[ \t]*\d+\b|\[[ \t]*(?:question|q)?[ \t]*\d+[ \t]*\]|【[ \t]*(?:问题|题目|question|q)?[ \t]*\d+[ \t]*】|问题[ \t]*\d+|第[ \t]*\d+[ \t]*题)",
    )
    .expect("block boundary regex")
  })
}

/// Which layout produced the options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionLayout {
  PerLine,
  Inline,
  Parenthesized,
}

/// Options recovered from a text, with the byte range they cover.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionSet {
  pub layout: OptionLayout,
  pub options: Vec<QuizOption>,
  pub start: usize,
  pub end: usize,
}

/// 2..=4 options with pairwise-distinct normalized labels.
fn acceptable(options: &[QuizOption]) -> bool {
  if !(MIN_OPTIONS..=MAX_OPTIONS).contains(&options.len()) {
    return false;
  }
  let mut seen = HashSet::new();
  options.iter().all(|o| normalize_label(&o.label).map(|l| seen.insert(l)).unwrap_or(false))
}

fn option(label: &str, text: &str) -> QuizOption {
  QuizOption::new(normalize_label(label).unwrap_or_else(|| label.to_string()), text.trim())
}

fn per_line_options(text: &str) -> Option<OptionSet> {
  let caps: Vec<_> = line_option_re().captures_iter(text).collect();
  let options: Vec<QuizOption> = caps.iter().map(|c| option(&c[1], &c[2])).collect();
  if !acceptable(&options) {
    return None;
  }
  let start = caps.first()?.get(0)?.start();
  let end = caps.last()?.get(0)?.end();
  Some(OptionSet { layout: OptionLayout::PerLine, options, start, end })
}

fn inline_options(text: &str) -> Option<OptionSet> {
  let mut line_start = 0;
  for line in text.split_inclusive('\n') {
    let body = line.trim_end_matches(['\n', '\r']);
    let labels: Vec<_> = inline_label_re()
      .captures_iter(body)
      .filter_map(|c| c.get(1).zip(c.get(0)))
      .map(|(label, whole)| (label.as_str(), label.start(), whole.end()))
      .collect();

    if labels.len() >= MIN_OPTIONS {
      let mut options = Vec::with_capacity(labels.len());
      let mut segmented = true;
      for (i, (label, _, text_start)) in labels.iter().enumerate() {
        let text_end = labels.get(i + 1).map(|n| n.1).unwrap_or(body.len());
        let opt_text = body[*text_start..text_end].trim();
        if opt_text.is_empty() || opt_text.chars().count() >= INLINE_OPTION_MAX_CHARS {
          segmented = false;
          break;
        }
        options.push(option(label, opt_text));
      }
      if segmented && acceptable(&options) {
        return Some(OptionSet {
          layout: OptionLayout::Inline,
          options,
          start: line_start + labels[0].1,
          end: line_start + body.len(),
        });
      }
    }
    line_start += line.len();
  }
  None
}

fn parenthesized_options(text: &str) -> Option<OptionSet> {
  let caps: Vec<_> = paren_option_re().captures_iter(text).collect();
  let options: Vec<QuizOption> = caps
    .iter()
    .map(|c| option(&c[1], &c[2]))
    .filter(|o| !o.text.is_empty())
    .collect();
  if options.len() != caps.len() || !acceptable(&options) {
    return None;
  }
  let start = caps.first()?.get(0)?.start();
  let end = caps.last()?.get(0)?.end();
  Some(OptionSet { layout: OptionLayout::Parenthesized, options, start, end })
}

/// Try the three layouts in priority order.
pub fn find_options(text: &str) -> Option<OptionSet> {
  per_line_options(text)
    .or_else(|| inline_options(text))
    .or_else(|| parenthesized_options(text))
}

/// Question text for the options starting at `options_start`.
pub fn recover_question(text: &str, options_start: usize) -> String {
  let before = &text[..options_start];

  if let Some(last_line) = before.lines().map(str::trim).filter(|l| !l.is_empty()).last() {
    if let Some(cap) = bracket_header_re().captures(last_line) {
      let inner = cap.get(1).or_else(|| cap.get(2)).map(|m| m.as_str().trim()).unwrap_or("");
      // "[Question 2]" is a block header, not a question.
      if !inner.is_empty() && !block_boundary_re().is_match(&format!("[{inner}]")) {
        return inner.to_string();
      }
    }
  }

  if let Some(m) = question_sentence_re().find_iter(before).last() {
    let q = clean_question(m.as_str());
    if q.chars().any(|c| c.is_alphanumeric()) {
      return q;
    }
  }

  QUESTION_FALLBACK.to_string()
}

/// Strip list bullets, emphasis and "Question 1:" style prefixes.
fn clean_question(raw: &str) -> String {
  let mut q = raw.trim().trim_start_matches(['-', '*', '#', '•', ' ', '\t']).trim();
  if let Some(m) = block_boundary_re().find(q) {
    if m.start() == 0 {
      q = q[m.end()..].trim_start_matches([':', '：', '.', ')', ' ', '*']).trim();
    }
  }
  q.trim_matches('*').trim().to_string()
}

/// Label named by an "Answer: B" style key, if the text carries one.
pub fn find_answer_key(text: &str) -> Option<String> {
  answer_key_re()
    .captures_iter(text)
    .last()
    .and_then(|c| normalize_label(&c[1]))
}

/// Recover one quiz from free text. None when no acceptable option layout exists.
///
/// The correct label comes from an "Answer: B" style key, preferring one after the
/// options. Without a key the first option is graded as correct; callers that care
/// should check `find_answer_key` themselves.
pub fn extract_quiz(text: &str) -> Option<Quiz> {
  let set = find_options(text)?;
  let question = recover_question(text, set.start);

  let correct_label = match find_answer_key(&text[set.end..]).or_else(|| find_answer_key(text)) {
    Some(l) if set.options.iter().any(|o| o.label == l) => l,
    _ => {
      warn!(target: "quiz", layout = ?set.layout, "No answer key next to recovered options; grading against the first option");
      set.options[0].label.clone()
    }
  };

  debug!(target: "quiz", layout = ?set.layout, options = set.options.len(), "Heuristic quiz recovered");
  Some(Quiz {
    level: 0,
    question,
    options: set.options,
    correct_label,
    hint: None,
    code_snippet: None,
    code_language: None,
  })
}

/// Result of splitting a reply into quiz blocks and narrative.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SplitOutcome {
  pub quizzes: Vec<Quiz>,
  /// Non-quiz text between blocks, concatenated for display.
  pub narrative: String,
}

/// Split a longer reply into independent quizzes.
///
/// Boundaries are numbered headers ("Question 2", "[3]", "Q-4", "第5题") when present,
/// otherwise the re-occurrence of label A after at least two options.
pub fn split_quiz_blocks(text: &str) -> SplitOutcome {
  let mut cuts: Vec<usize> = block_boundary_re().find_iter(text).map(|m| m.start()).collect();
  if cuts.is_empty() {
    cuts = label_recurrence_cuts(text);
  }

  let mut bounds = Vec::with_capacity(cuts.len() + 2);
  bounds.push(0);
  bounds.extend(cuts.into_iter().filter(|&c| c > 0));
  bounds.push(text.len());
  bounds.dedup();

  let mut quizzes = Vec::new();
  let mut narrative: Vec<&str> = Vec::new();
  for pair in bounds.windows(2) {
    let segment = &text[pair[0]..pair[1]];
    match extract_quiz(segment) {
      Some(q) => quizzes.push(q),
      None => {
        let t = segment.trim();
        if !t.is_empty() {
          narrative.push(t);
        }
      }
    }
  }

  debug!(target: "quiz", blocks = bounds.len() - 1, quizzes = quizzes.len(), "Split reply into quiz blocks");
  SplitOutcome { quizzes, narrative: narrative.join("\n\n") }
}

/// Cut after the line of the last option whenever a new "A" starts once two or more
/// options were consumed in the current block.
fn label_recurrence_cuts(text: &str) -> Vec<usize> {
  let mut cuts = Vec::new();
  let mut consumed = 0usize;
  let mut prev_end = 0usize;
  for cap in line_option_re().captures_iter(text) {
    let (Some(whole), Some(label)) = (cap.get(0), cap.get(1)) else { continue };
    if normalize_label(label.as_str()).as_deref() == Some("A") && consumed >= MIN_OPTIONS {
      cuts.push(prev_end);
      consumed = 0;
    }
    consumed += 1;
    prev_end = whole.end();
  }
  cuts
}
