//! Deterministic quiz synthesis from an artifact's own source.
//!
//! Last resort when neither the quiz marker nor the heuristic extractor produced a
//! usable quiz. Always returns a well-formed quiz: a "why is it written this way"
//! question about a construct found in the code, or, failing that, about the first
//! named declaration.

use std::sync::OnceLock;

use regex::Regex;

use crate::complexity::{detect_constructs, ConstructHit, ConstructKind};
use crate::domain::{Quiz, QuizOption};

/// Fixed reasoning options for one construct: (correct, wrong, wrong) and where the
/// correct one is placed.
struct Rationale {
  question: &'static str,
  correct: (&'static str, &'static str),
  wrong: [(&'static str, &'static str); 2],
  correct_slot: usize,
  hint: &'static str,
}

fn rationale(kind: ConstructKind) -> Rationale {
  match kind {
    ConstructKind::AsyncFlow => Rationale {
      question: "Why does this code await the asynchronous call instead of using its result directly?",
      correct: (
        "The call returns a pending result; awaiting suspends until it resolves so the next lines see the real value.",
        "Asynchronous calls hand back a promise/future, not the value itself.",
      ),
      wrong: [
        (
          "Awaiting makes the request run faster because it gets priority on the event loop.",
          "Await does not speed anything up; it only sequences the code after completion.",
        ),
        (
          "Awaiting is needed so that errors are silently ignored if the request fails.",
          "A rejected await throws at that point; it does not swallow errors.",
        ),
      ],
      correct_slot: 1,
      hint: "Think about what the call returns before it has finished.",
    },
    ConstructKind::MemoHook => Rationale {
      question: "Why is this value or callback wrapped in a memoization hook?",
      correct: (
        "It keeps the same reference between renders unless its dependencies change, avoiding needless recomputation and re-renders.",
        "Memoization caches by dependency list.",
      ),
      wrong: [
        (
          "It runs the wrapped function on a background thread so the UI never blocks.",
          "Memo hooks run synchronously during render.",
        ),
        (
          "It persists the value to storage so it survives a page reload.",
          "Memoized values live only as long as the component instance.",
        ),
      ],
      correct_slot: 0,
      hint: "Look at the dependency list passed to the hook.",
    },
    ConstructKind::ErrorHandling => Rationale {
      question: "Why does this code handle the error explicitly at this point?",
      correct: (
        "The operation can fail at runtime, and handling it here lets the code recover or report instead of crashing the caller.",
        "Failure is expected for I/O and parsing, so it is handled where context is available.",
      ),
      wrong: [
        (
          "Explicit error handling makes the happy path execute faster.",
          "Error handling adds no speed to the success path.",
        ),
        (
          "The compiler requires every function call to be wrapped this way.",
          "Only fallible operations need handling; most calls do not.",
        ),
      ],
      correct_slot: 2,
      hint: "Which line here can fail at runtime?",
    },
    ConstructKind::Reduce => Rationale {
      question: "Why is a reduce/fold used here rather than a plain loop with mutation?",
      correct: (
        "It folds the whole collection into a single accumulated value in one expression, without external mutable state.",
        "The accumulator carries the running result.",
      ),
      wrong: [
        (
          "Reduce sorts the collection before processing it, which a loop cannot do.",
          "Reduce does not reorder elements.",
        ),
        (
          "Reduce processes the elements in parallel, so it is always faster than a loop.",
          "Reduce is sequential over the elements.",
        ),
      ],
      correct_slot: 0,
      hint: "Follow what the accumulator holds after each element.",
    },
    ConstructKind::OptionalChaining => Rationale {
      question: "Why does this code use optional chaining / nullish coalescing on this access?",
      correct: (
        "The value may be null or undefined; the operator short-circuits instead of throwing and supplies a fallback.",
        "It guards access to values that may be missing.",
      ),
      wrong: [
        (
          "It converts the value to a string so it can be displayed safely.",
          "No type conversion happens.",
        ),
        (
          "It makes the property read-only so later code cannot change it.",
          "Access operators do not change mutability.",
        ),
      ],
      correct_slot: 1,
      hint: "What happens if the left-hand side is missing?",
    },
    ConstructKind::Concurrency => Rationale {
      question: "Why are these operations combined with a concurrent combinator instead of awaited one by one?",
      correct: (
        "The operations are independent, so starting them together lets them overlap and the total wait is roughly the slowest one.",
        "Independent work can run concurrently.",
      ),
      wrong: [
        (
          "The combinator guarantees the operations finish in the order they were listed.",
          "Completion order is not guaranteed, only result order.",
        ),
        (
          "The combinator retries each operation automatically until it succeeds.",
          "There is no built-in retry.",
        ),
      ],
      correct_slot: 2,
      hint: "Do the operations depend on each other's results?",
    },
    ConstructKind::TypeDeclaration => Rationale {
      question: "Why is this type declared explicitly (class / interface / generic) instead of using loose values?",
      correct: (
        "It gives the data a named, checked shape that the rest of the code can rely on and reuse.",
        "Declared types let the compiler catch shape mismatches.",
      ),
      wrong: [
        (
          "Declaring the type makes the program allocate less memory at runtime.",
          "Type declarations are mostly a compile-time contract.",
        ),
        (
          "Type declarations are required before any function can be called.",
          "Plenty of code calls functions without declaring types.",
        ),
      ],
      correct_slot: 0,
      hint: "Who relies on this shape elsewhere in the code?",
    },
  }
}

fn declaration_re() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| {
    Regex::new(r"\b(?:function|fn|def|class|struct|interface|trait|enum|type|const|let)\s+([A-Za-z_]\w*)")
      .expect("declaration regex")
  })
}

/// First declared name of at least three characters.
pub fn first_declaration(source: &str) -> Option<String> {
  declaration_re()
    .captures_iter(source)
    .map(|c| c[1].to_string())
    .find(|name| name.trim_start_matches('_').len() >= 3)
}

fn construct_quiz(hit: &ConstructHit, language: &str, level: u32) -> Quiz {
  let r = rationale(hit.kind);
  let mut texts = vec![r.wrong[0], r.wrong[1]];
  texts.insert(r.correct_slot.min(texts.len()), r.correct);

  let options: Vec<QuizOption> = texts
    .iter()
    .enumerate()
    .map(|(i, (text, why))| QuizOption::explained(crate::protocol::sequential_label(i), *text, *why))
    .collect();
  let correct_label = crate::protocol::sequential_label(r.correct_slot);

  Quiz {
    level,
    question: format!("{} (`{}`)", r.question, hit.matched),
    options,
    correct_label,
    hint: Some(r.hint.to_string()),
    code_snippet: Some(hit.line.clone()),
    code_language: non_empty(language),
  }
}

fn design_quiz(source: &str, language: &str, level: u32) -> Quiz {
  let subject = first_declaration(source)
    .map(|n| format!("`{n}`"))
    .unwrap_or_else(|| "the main logic".to_string());

  Quiz {
    level,
    question: format!("Why is {subject} structured the way it is in this code?"),
    options: vec![
      QuizOption::explained(
        "A",
        "It is written for the current framework version only and must be rewritten for any upgrade.",
        "Nothing in the code ties it to one framework version.",
      ),
      QuizOption::explained(
        "B",
        "It groups one responsibility behind a name so callers depend on what it does, not how.",
        "Naming a unit of behavior is what makes it reusable and testable.",
      ),
      QuizOption::explained(
        "C",
        "It is structured this way mainly to reduce the number of lines in the file.",
        "Line count is not the driver of this structure.",
      ),
    ],
    correct_label: "B".into(),
    hint: Some(format!("Look at how {subject} is used by the rest of the code.")),
    code_snippet: None,
    code_language: non_empty(language),
  }
}

fn non_empty(s: &str) -> Option<String> {
  let t = s.trim();
  (!t.is_empty()).then(|| t.to_string())
}

/// Synthesize a quiz for the artifact source at `level` (0-based). Levels rotate
/// through the detected constructs so consecutive levels ask different things.
pub fn synthesize_quiz(source: &str, language: &str, level: u32) -> Quiz {
  let hits = detect_constructs(source);
  if hits.is_empty() {
    return design_quiz(source, language, level);
  }
  let hit = &hits[level as usize % hits.len()];
  construct_quiz(hit, language, level)
}
