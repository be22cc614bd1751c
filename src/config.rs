//! Loading service configuration (prompts + gate override) from TOML.
//!
//! See `QuizgateConfig` and `Prompts` for expected schema:
//!
//! ```toml
//! [prompts]
//! reply_system = "..."
//! reply_user_template = "... {prompt} ... {question_count} ..."
//!
//! [gate]
//! bypass = false
//! ```

use serde::Deserialize;
use tracing::{error, info};

#[derive(Clone, Debug, Deserialize, Default)]
pub struct QuizgateConfig {
  #[serde(default)]
  pub prompts: Prompts,
  #[serde(default)]
  pub gate: GateCfg,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct GateCfg {
  /// Start with the "no gate required" override on.
  #[serde(default)]
  pub bypass: bool,
}

/// Prompts used by the model client. Placeholders: `{prompt}`, `{question_count}`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Prompts {
  pub reply_system: String,
  pub reply_user_template: String,
}

impl Default for Prompts {
  fn default() -> Self {
    Self {
      reply_system: concat!(
        "You are a coding assistant that teaches while it builds. ",
        "Put every piece of generated code in one block: ",
        "<artifact id=\"<stable-id>\" title=\"<title>\" language=\"<lang>\" kind=\"code|component|config\">...</artifact>. ",
        "Reuse the same id when you revise an artifact. ",
        "After the artifact, add exactly one comprehension quiz about WHY the code is written that way, as ",
        "<!--QUIZ:{\"level\":1,\"totalQuestions\":N,\"question\":\"...\",\"options\":[{\"label\":\"A\",\"text\":\"...\",\"explanation\":\"...\"}],\"correctLabel\":\"A\",\"hint\":\"...\"}-->. ",
        "Use 3 or 4 options. Never reveal the answer in the visible text."
      )
      .into(),
      reply_user_template: "{prompt}\n\nAim for {question_count} quiz question(s) in total for this artifact.".into(),
    }
  }
}

/// Attempt to load `QuizgateConfig` from QUIZGATE_CONFIG_PATH. On any parsing/IO error, returns None.
pub fn load_config_from_env() -> Option<QuizgateConfig> {
  let path = std::env::var("QUIZGATE_CONFIG_PATH").ok()?;
  match std::fs::read_to_string(&path) {
    Ok(s) => match parse_config(&s) {
      Ok(cfg) => {
        info!(target: "quizgate", %path, "Loaded config (TOML)");
        Some(cfg)
      }
      Err(e) => {
        error!(target: "quizgate", %path, error = %e, "Failed to parse TOML config");
        None
      }
    },
    Err(e) => {
      error!(target: "quizgate", %path, error = %e, "Failed to read TOML config file");
      None
    }
  }
}

pub fn parse_config(s: &str) -> Result<QuizgateConfig, toml::de::Error> {
  toml::from_str::<QuizgateConfig>(s)
}

/// QUIZGATE_BYPASS_GATE: "1"/"true"/"yes" (case-insensitive) turn the override on,
/// "0"/"false"/"no" turn it off, anything else is ignored.
pub fn bypass_from_env() -> Option<bool> {
  parse_flag(&std::env::var("QUIZGATE_BYPASS_GATE").ok()?)
}

fn parse_flag(v: &str) -> Option<bool> {
  match v.trim().to_ascii_lowercase().as_str() {
    "1" | "true" | "yes" | "on" => Some(true),
    "0" | "false" | "no" | "off" => Some(false),
    _ => None,
  }
}
