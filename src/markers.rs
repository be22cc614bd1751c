//! In-band markers embedded in model output.
//!
//! Quiz marker:
//!   <!--QUIZ:{ ...json... }-->
//! The model sometimes truncates the close to `->` directly after the payload's
//! closing brace (`}->`); that form is accepted too.
//!
//! Artifact marker:
//!   <artifact id="..." title="..." language="rust" kind="code">
//!   ...raw content...
//!   </artifact>
//!
//! Everything here works on the full text accumulated so far, so it can be
//! called again each time a new chunk arrives.

use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::domain::ArtifactKind;
use crate::protocol::WireQuiz;

pub const QUIZ_OPEN: &str = "<!--QUIZ:";
pub const QUIZ_CLOSE: &str = "-->";
const QUIZ_CLOSE_TRUNCATED: &str = "->";

pub const ARTIFACT_OPEN: &str = "<artifact";
pub const ARTIFACT_CLOSE: &str = "</artifact>";

/// Result of looking for a quiz marker.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkerScan {
  /// Marker complete and payload valid.
  Found(WireQuiz),
  /// Opening marker seen, no closing marker yet.
  Incomplete,
  /// Marker complete but payload unusable.
  Malformed,
  Absent,
}

/// Locate the close of a quiz marker whose payload starts at `from`.
/// Returns (payload_end, marker_end).
fn find_quiz_close(text: &str, from: usize) -> Option<(usize, usize)> {
  let rest = &text[from..];
  let canonical = rest.find(QUIZ_CLOSE).map(|i| (from + i, from + i + QUIZ_CLOSE.len()));

  // `}->` where the dash is not itself the second dash of `-->`.
  let truncated = rest
    .match_indices(QUIZ_CLOSE_TRUNCATED)
    .find(|(i, _)| {
      let before = rest[..*i].trim_end();
      before.ends_with('}') && !rest[..*i].ends_with('-')
    })
    .map(|(i, _)| (from + i, from + i + QUIZ_CLOSE_TRUNCATED.len()));

  match (canonical, truncated) {
    (Some(c), Some(t)) => Some(if t.0 < c.0 { t } else { c }),
    (c, t) => c.or(t),
  }
}

/// Scan the text for the first quiz marker.
pub fn scan_quiz_marker(text: &str) -> MarkerScan {
  let Some(open) = text.find(QUIZ_OPEN) else {
    return MarkerScan::Absent;
  };
  let start = open + QUIZ_OPEN.len();
  let Some((end, _)) = find_quiz_close(text, start) else {
    return MarkerScan::Incomplete;
  };

  let payload = join_payload_lines(&text[start..end]);
  match serde_json::from_str::<WireQuiz>(&payload) {
    Ok(w) if !w.question.trim().is_empty() && w.options.len() >= 2 => MarkerScan::Found(w),
    Ok(_) => {
      debug!(target: "quiz", "Quiz marker payload lacks question or options");
      MarkerScan::Malformed
    }
    Err(e) => {
      debug!(target: "quiz", error = %e, payload_len = payload.len(), "Quiz marker payload is not valid JSON");
      MarkerScan::Malformed
    }
  }
}

/// Per-line trimming; lines are re-joined with a space so a string literal the model
/// wrapped across lines still parses.
fn join_payload_lines(raw: &str) -> String {
  raw
    .lines()
    .map(str::trim)
    .filter(|l| !l.is_empty())
    .collect::<Vec<_>>()
    .join(" ")
}

/// A complete artifact block found in model output.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactBlock {
  pub id: Option<String>,
  pub kind: ArtifactKind,
  pub title: String,
  pub language: String,
  pub content: String,
}

fn attr_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r#"([A-Za-z_][\w-]*)\s*=\s*"([^"]*)""#).expect("attribute regex"))
}

/// All complete artifact blocks, in order of appearance.
pub fn parse_artifact_blocks(text: &str) -> Vec<ArtifactBlock> {
  let mut out = Vec::new();
  let mut cursor = 0;
  while let Some(rel) = text[cursor..].find(ARTIFACT_OPEN) {
    let open = cursor + rel;
    let Some(tag_end_rel) = text[open..].find('>') else { break };
    let tag_end = open + tag_end_rel;
    let Some(close_rel) = text[tag_end + 1..].find(ARTIFACT_CLOSE) else { break };
    let close = tag_end + 1 + close_rel;

    let attrs = &text[open + ARTIFACT_OPEN.len()..tag_end];
    let mut block = ArtifactBlock {
      id: None,
      kind: ArtifactKind::Code,
      title: String::new(),
      language: String::new(),
      content: strip_code_fence(&text[tag_end + 1..close]),
    };
    for cap in attr_re().captures_iter(attrs) {
      let value = cap[2].trim().to_string();
      match &cap[1] {
        "id" if !value.is_empty() => block.id = Some(value),
        "kind" | "type" => block.kind = ArtifactKind::from_attr(&value),
        "title" => block.title = value,
        "language" | "lang" => block.language = value,
        _ => {}
      }
    }
    if block.title.is_empty() {
      block.title = "Untitled".into();
    }
    out.push(block);
    cursor = close + ARTIFACT_CLOSE.len();
  }
  out
}

/// An artifact block has opened but its close tag has not arrived yet.
pub fn artifact_block_open(text: &str) -> bool {
  match (text.rfind(ARTIFACT_OPEN), text.rfind(ARTIFACT_CLOSE)) {
    (Some(open), Some(close)) => open > close,
    (Some(_), None) => true,
    _ => false,
  }
}

/// Drop a surrounding ``` fence the model sometimes adds inside the block.
fn strip_code_fence(raw: &str) -> String {
  let t = raw.trim_matches(|c| c == '\n' || c == '\r');
  let trimmed = t.trim();
  if let Some(rest) = trimmed.strip_prefix("```") {
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
    return body.trim_end().trim_end_matches("```").trim_end().to_string();
  }
  t.to_string()
}

/// Text safe to render: complete quiz markers and artifact blocks removed, and any
/// trailing marker whose close has not streamed in yet cut off.
pub fn visible_text(text: &str) -> String {
  let mut out = String::with_capacity(text.len());
  let mut cursor = 0;

  loop {
    let rest = &text[cursor..];
    let next_quiz = rest.find(QUIZ_OPEN);
    let next_artifact = rest.find(ARTIFACT_OPEN);
    let (rel, is_quiz) = match (next_quiz, next_artifact) {
      (Some(q), Some(a)) if q <= a => (q, true),
      (Some(_), Some(a)) => (a, false),
      (Some(q), None) => (q, true),
      (None, Some(a)) => (a, false),
      (None, None) => {
        out.push_str(rest);
        break;
      }
    };
    out.push_str(&rest[..rel]);
    let open = cursor + rel;

    let end = if is_quiz {
      find_quiz_close(text, open + QUIZ_OPEN.len()).map(|(_, e)| e)
    } else {
      text[open..].find(ARTIFACT_CLOSE).map(|i| open + i + ARTIFACT_CLOSE.len())
    };
    match end {
      Some(e) => cursor = e,
      // Un-terminated: nothing after the opening is shown yet.
      None => break,
    }
  }

  // A partial opening token at the very end ("<!--QU", "<arti") is hidden as well.
  for token in [QUIZ_OPEN, ARTIFACT_OPEN] {
    for n in (2..token.len()).rev() {
      if out.ends_with(&token[..n]) {
        out.truncate(out.len() - n);
        break;
      }
    }
  }
  out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse_quiz_marker(text: &str) -> Option<crate::domain::Quiz> {
    match scan_quiz_marker(text) {
      MarkerScan::Found(w) => w.into_quiz(),
      _ => None,
    }
  }

  const MARKED: &str = r#"Here is the code.
<!--QUIZ:{"level":1,"question":"Why await?","options":[{"label":"A","text":"x"},{"label":"B","text":"y"}],"correctLabel":"B"}-->
Done."#;

  #[test]
  fn parses_canonical_marker() {
    let q = parse_quiz_marker(MARKED).expect("quiz");
    assert_eq!(q.level, 0);
    assert_eq!(q.question, "Why await?");
    assert_eq!(q.options.len(), 2);
    assert_eq!(q.correct_label, "B");
  }

  #[test]
  fn tolerates_truncated_close() {
    let text = r#"<!--QUIZ:{"question":"Q?","options":[{"label":"A","text":"x"},{"label":"B","text":"y"}],"correctLabel":"A"}->"#;
    let q = parse_quiz_marker(text).expect("quiz");
    assert_eq!(q.correct_label, "A");
  }

  #[test]
  fn tolerates_multiline_indented_payload() {
    let text = "<!--QUIZ:\n   {\n  \"level\": 2,\n   \"question\": \"Why memoize\n   this?\",\n \"options\": [\n  {\"label\": \"A\", \"text\": \"x\"},\n  {\"label\": \"B\", \"text\": \"y\"}\n ],\n \"correctLabel\": \"A\"\n }\n-->";
    let q = parse_quiz_marker(text).expect("quiz");
    assert_eq!(q.level, 1);
    assert_eq!(q.question, "Why memoize this?");
  }

  #[test]
  fn open_without_close_is_incomplete() {
    let text = r#"intro <!--QUIZ:{"question":"Q?","options":["#;
    assert_eq!(scan_quiz_marker(text), MarkerScan::Incomplete);
    assert!(parse_quiz_marker(text).is_none());
  }

  #[test]
  fn payload_without_enough_options_is_malformed() {
    let text = r#"<!--QUIZ:{"question":"Q?","options":[{"label":"A","text":"x"}],"correctLabel":"A"}-->"#;
    assert_eq!(scan_quiz_marker(text), MarkerScan::Malformed);
    let text = r#"<!--QUIZ:{not json}-->"#;
    assert_eq!(scan_quiz_marker(text), MarkerScan::Malformed);
  }

  #[test]
  fn char_by_char_stream_yields_quiz_only_once_closed() {
    let full = MARKED.split("\nDone.").next().expect("prefix");
    let close_at = full.len();
    for end in 0..close_at {
      if !full.is_char_boundary(end) {
        continue;
      }
      assert!(parse_quiz_marker(&full[..end]).is_none(), "prefix of len {end} parsed early");
    }
    assert!(parse_quiz_marker(full).is_some());
  }

  #[test]
  fn artifact_blocks_parse_attributes_and_fences() {
    let text = "intro\n<artifact id=\"a1\" title=\"Fetcher\" language=\"ts\" kind=\"component\">\n```ts\nawait fetchData();\n```\n</artifact>\noutro";
    let blocks = parse_artifact_blocks(text);
    assert_eq!(blocks.len(), 1);
    let b = &blocks[0];
    assert_eq!(b.id.as_deref(), Some("a1"));
    assert_eq!(b.kind, ArtifactKind::Component);
    assert_eq!(b.language, "ts");
    assert_eq!(b.content, "await fetchData();");
  }

  #[test]
  fn unterminated_artifact_is_not_parsed() {
    let text = "<artifact title=\"x\">\nfn main() {";
    assert!(parse_artifact_blocks(text).is_empty());
  }

  #[test]
  fn visible_text_strips_markers() {
    let text = format!("{MARKED}\n<artifact title=\"t\">secret_body</artifact>tail");
    let v = visible_text(&text);
    assert!(!v.contains("QUIZ"));
    assert!(!v.contains("secret_body"));
    assert!(v.starts_with("Here is the code."));
    assert!(v.ends_with("tail"));
  }

  #[test]
  fn visible_text_hides_incomplete_markers() {
    assert_eq!(visible_text("Hello <!--QUIZ:{\"question\":"), "Hello");
    assert_eq!(visible_text("Hello <artifact title=\"t\">fn ma"), "Hello");
    assert_eq!(visible_text("Hello <!--QU"), "Hello");
  }

  #[test]
  fn open_artifact_detection() {
    assert!(artifact_block_open("x <artifact title=\"t\">fn"));
    assert!(!artifact_block_open("x <artifact title=\"t\">fn</artifact> y"));
    assert!(!artifact_block_open("plain"));
  }
}
