//! Quizgate · Comprehension-gated code artifacts backend
//!
//! - Axum HTTP + WebSocket API
//! - Streamed model output is split into prose, code artifacts and quiz markers
//! - Artifacts stay locked until their quiz questions are answered
//! - Sessions are persisted per conversation and hydrated on first access
//! - Optional OpenAI integration (via environment variables)
//!
//! Important env variables:
//!   PORT                  : u16 (default 3000)
//!   OPENAI_API_KEY        : enables OpenAI integration if present
//!   OPENAI_BASE_URL       : default "https://api.openai.com/v1"
//!   OPENAI_MODEL          : default "gpt-4o-mini"
//!   QUIZGATE_CONFIG_PATH  : path to TOML config (prompts + gate defaults)
//!   QUIZGATE_DATA_DIR     : directory for session snapshots (in-memory if unset)
//!   QUIZGATE_BYPASS_GATE  : "1"/"true" disables gating for every session
//!   LOG_LEVEL             : tracing filter, e.g. "debug" or full directives
//!   LOG_FORMAT            : "pretty" (default) or "json"

mod telemetry;
mod util;
mod domain;
mod protocol;
mod markers;
mod heuristic;
mod extract;
mod complexity;
mod fallback;
mod shuffle;
mod gate;
mod session;
mod error;
mod store;
mod reconcile;
mod logic;
mod openai;
mod config;
mod state;
mod routes;

use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::{info, instrument};

use crate::routes::build_router;
use crate::state::AppState;

#[instrument(level = "info", skip_all)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  telemetry::init_tracing();

  // Shared state: live sessions, snapshot store, gate override, OpenAI client, prompts.
  let state = Arc::new(AppState::new());

  let app = build_router(state.clone());

  let addr: SocketAddr = std::env::var("PORT")
    .ok()
    .and_then(|p| p.parse::<u16>().ok())
    .map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

  let listener = TcpListener::bind(addr).await?;
  info!(target: "quizgate", %addr, "HTTP server listening");
  axum::serve(listener, app).await?;
  Ok(())
}
