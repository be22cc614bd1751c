//! Option shuffling that keeps track of the correct answer.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::domain::{normalize_label, Quiz, QuizOption};
use crate::protocol::sequential_label;

/// Shuffle `options` uniformly and relabel them A, B, C, ...
///
/// Returns the new options and the label now carried by the option whose text
/// matched the originally correct one. Lists of length 0 or 1 come back unchanged.
pub fn shuffle_options<R: Rng + ?Sized>(
  options: &[QuizOption],
  correct_label: &str,
  rng: &mut R,
) -> (Vec<QuizOption>, String) {
  if options.len() < 2 {
    return (options.to_vec(), correct_label.to_string());
  }

  let wanted = normalize_label(correct_label);
  let correct_text = options
    .iter()
    .find(|o| normalize_label(&o.label) == wanted)
    .map(|o| o.text.clone());

  let mut shuffled = options.to_vec();
  shuffled.shuffle(rng);
  for (i, o) in shuffled.iter_mut().enumerate() {
    o.label = sequential_label(i);
  }

  let new_correct = correct_text
    .and_then(|t| shuffled.iter().find(|o| o.text == t))
    .map(|o| o.label.clone())
    .unwrap_or_else(|| correct_label.to_string());

  (shuffled, new_correct)
}

/// Shuffle a quiz's options in place.
pub fn shuffle_quiz<R: Rng + ?Sized>(quiz: &mut Quiz, rng: &mut R) {
  let (options, correct) = shuffle_options(&quiz.options, &quiz.correct_label, rng);
  quiz.options = options;
  quiz.correct_label = correct;
}

#[cfg(test)]
mod tests {
  use super::*;
  use rand::rngs::StdRng;
  use rand::SeedableRng;

  fn opts() -> Vec<QuizOption> {
    vec![
      QuizOption::explained("A", "uses cache", "no"),
      QuizOption::explained("B", "avoids recompute", "yes"),
      QuizOption::explained("C", "improves types", "no"),
      QuizOption::explained("D", "logs calls", "no"),
    ]
  }

  #[test]
  fn preserves_texts_and_correct_identity() {
    for seed in 0..50 {
      let mut rng = StdRng::seed_from_u64(seed);
      let (shuffled, correct) = shuffle_options(&opts(), "B", &mut rng);

      let mut before: Vec<_> = opts().into_iter().map(|o| o.text).collect();
      let mut after: Vec<_> = shuffled.iter().map(|o| o.text.clone()).collect();
      before.sort();
      after.sort();
      assert_eq!(before, after);

      let labels: Vec<_> = shuffled.iter().map(|o| o.label.as_str()).collect();
      assert_eq!(labels, vec!["A", "B", "C", "D"]);

      let c = shuffled.iter().find(|o| o.label == correct).expect("correct");
      assert_eq!(c.text, "avoids recompute");
    }
  }

  #[test]
  fn explanations_travel_with_their_text() {
    let mut rng = StdRng::seed_from_u64(7);
    let (shuffled, _) = shuffle_options(&opts(), "B", &mut rng);
    for o in shuffled {
      let expected = if o.text == "avoids recompute" { "yes" } else { "no" };
      assert_eq!(o.explanation.as_deref(), Some(expected));
    }
  }

  #[test]
  fn short_lists_are_identity() {
    let mut rng = StdRng::seed_from_u64(1);
    let one = vec![QuizOption::new("C", "only")];
    assert_eq!(shuffle_options(&one, "C", &mut rng), (one.clone(), "C".to_string()));
    assert_eq!(shuffle_options(&[], "A", &mut rng), (vec![], "A".to_string()));
  }

  #[test]
  fn correct_label_matches_ignoring_width() {
    let mut rng = StdRng::seed_from_u64(3);
    let (shuffled, correct) = shuffle_options(&opts(), "ｂ", &mut rng);
    assert_eq!(shuffled.iter().find(|o| o.label == correct).expect("correct").text, "avoids recompute");
  }

  #[test]
  fn every_position_is_reachable() {
    let mut seen = std::collections::HashSet::new();
    for seed in 0..200 {
      let mut rng = StdRng::seed_from_u64(seed);
      seen.insert(shuffle_options(&opts(), "B", &mut rng).1);
    }
    assert_eq!(seen.len(), 4);
  }
}
