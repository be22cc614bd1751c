//! HTTP endpoint handlers. These are thin wrappers that forward to core logic.
//! Each handler is instrumented and logs its parameters and basic result info.

use std::sync::Arc;
use axum::{extract::{Path, State}, Json, response::IntoResponse};
use tracing::{info, instrument};

use crate::error::ApiError;
use crate::protocol::*;
use crate::state::AppState;
use crate::logic::*;

#[instrument(level = "info")]
pub async fn http_health() -> impl IntoResponse { Json(HealthOut { ok: true }) }

#[instrument(level = "info", skip(state))]
pub async fn http_get_session(
  State(state): State<Arc<AppState>>,
  Path(conversation_id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
  Ok(Json(session_view(&state, &conversation_id).await?))
}

#[instrument(level = "info", skip(state, body), fields(text_len = body.text.len(), done = body.done))]
pub async fn http_post_stream(
  State(state): State<Arc<AppState>>,
  Path(conversation_id): Path<String>,
  Json(body): Json<StreamIn>,
) -> Result<Json<StreamOut>, ApiError> {
  Ok(Json(ingest_chunk(&state, &conversation_id, &body.text, body.done).await?))
}

#[instrument(level = "info", skip(state, body), fields(prompt_len = body.prompt.len()))]
pub async fn http_post_generate(
  State(state): State<Arc<AppState>>,
  Path(conversation_id): Path<String>,
  Json(body): Json<GenerateIn>,
) -> Result<Json<StreamOut>, ApiError> {
  Ok(Json(generate(&state, &conversation_id, &body.prompt).await?))
}

#[instrument(level = "info", skip(state, body), fields(answer_len = body.answer.len()))]
pub async fn http_post_answer(
  State(state): State<Arc<AppState>>,
  Path(conversation_id): Path<String>,
  Json(body): Json<AnswerIn>,
) -> Result<Json<AnswerOut>, ApiError> {
  let out = submit_answer(&state, &conversation_id, &body.answer, body.message_index).await?;
  info!(target: "quiz", %conversation_id, accepted = out.accepted, correct = out.correct, "HTTP answer evaluated");
  Ok(Json(out))
}

#[instrument(level = "info", skip(state))]
pub async fn http_post_skip(
  State(state): State<Arc<AppState>>,
  Path(conversation_id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
  Ok(Json(skip_quiz(&state, &conversation_id).await?))
}

#[instrument(level = "info", skip(state, body), fields(artifact_id = %body.artifact_id))]
pub async fn http_post_active(
  State(state): State<Arc<AppState>>,
  Path(conversation_id): Path<String>,
  Json(body): Json<ActiveIn>,
) -> Result<Json<SessionView>, ApiError> {
  Ok(Json(switch_artifact(&state, &conversation_id, &body.artifact_id).await?))
}

#[instrument(level = "info", skip(state, body))]
pub async fn http_post_quiz_state(
  State(state): State<Arc<AppState>>,
  Path((conversation_id, artifact_id)): Path<(String, String)>,
  Json(body): Json<QuizStateIn>,
) -> Result<Json<SessionView>, ApiError> {
  Ok(Json(apply_quiz_state(&state, &conversation_id, &artifact_id, body).await?))
}

#[instrument(level = "info", skip(state))]
pub async fn http_post_gate(
  State(state): State<Arc<AppState>>,
  Json(body): Json<GateIn>,
) -> impl IntoResponse {
  state.gate.set_bypass(body.bypass);
  Json(GateIn { bypass: state.gate.is_bypassed() })
}
