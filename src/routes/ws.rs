//! WebSocket upgrade + message loop. Each client message is parsed as JSON and
//! forwarded to core logic. We reply with a single JSON message per request.
//!
//! A connection works on one conversation at a time, chosen with an `open` message.

use std::sync::Arc;
use axum::{
  extract::{
    ws::{Message, WebSocket},
    State, WebSocketUpgrade,
  },
  response::IntoResponse,
};
use tracing::{info, error, instrument, debug};

use crate::error::ApiError;
use crate::protocol::{ClientWsMessage, ServerWsMessage};
use crate::logic::*;
use crate::state::AppState;

#[instrument(level = "info", skip(state))]
pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
  info!(target: "quizgate", "WebSocket upgrade requested");
  ws.on_upgrade(move |socket| handle_ws(socket, state))
}

#[instrument(level = "info", skip(socket, state))]
async fn handle_ws(mut socket: WebSocket, state: Arc<AppState>) {
  info!(target: "quizgate", "WebSocket connected");
  let mut conversation: Option<String> = None;
  while let Some(Ok(msg)) = socket.recv().await {
    match msg {
      Message::Text(txt) => {
        let reply_msg = match serde_json::from_str::<ClientWsMessage>(&txt) {
          Ok(incoming) => {
            debug!(target: "quizgate", "WS received: {:?}", &incoming);
            handle_client_ws(incoming, &mut conversation, &state).await
          }
          Err(e) => ServerWsMessage::Error { message: format!("Invalid JSON: {}", e) },
        };

        let out = serde_json::to_string(&reply_msg).unwrap_or_else(|e| {
          serde_json::json!({ "type": "error", "message": format!("Serialization error: {}", e) }).to_string()
        });

        if let Err(e) = socket.send(Message::Text(out)).await {
          error!(target: "quizgate", error = %e, "WS send error");
          break;
        }
      }
      Message::Ping(payload) => { let _ = socket.send(Message::Pong(payload)).await; }
      Message::Close(_) => break,
      _ => {}
    }
  }
  info!(target: "quizgate", "WebSocket disconnected");
}

fn ws_error(e: ApiError) -> ServerWsMessage {
  ServerWsMessage::Error { message: e.to_string() }
}

async fn handle_client_ws(msg: ClientWsMessage, conversation: &mut Option<String>, state: &AppState) -> ServerWsMessage {
  match msg {
    ClientWsMessage::Ping => ServerWsMessage::Pong,
    ClientWsMessage::Open { conversation_id } => match session_view(state, &conversation_id).await {
      Ok(session) => {
        info!(target: "quizgate", %conversation_id, "WS conversation opened");
        *conversation = Some(conversation_id);
        ServerWsMessage::Session { session }
      }
      Err(e) => ws_error(e),
    },
    other => match conversation.as_deref() {
      Some(id) => dispatch(other, id, state).await.unwrap_or_else(ws_error),
      None => ServerWsMessage::Error { message: "Send an `open` message with a conversationId first.".into() },
    },
  }
}

async fn dispatch(msg: ClientWsMessage, id: &str, state: &AppState) -> Result<ServerWsMessage, ApiError> {
  Ok(match msg {
    ClientWsMessage::Chunk { text, done } => {
      let o = ingest_chunk(state, id, &text, done).await?;
      ServerWsMessage::Stream { visible_text: o.visible_text, session: o.session }
    }
    ClientWsMessage::Answer { answer, message_index } => {
      let o = submit_answer(state, id, &answer, message_index).await?;
      ServerWsMessage::AnswerResult { accepted: o.accepted, correct: o.correct, hint: o.hint, session: o.session }
    }
    ClientWsMessage::Skip => ServerWsMessage::Session { session: skip_quiz(state, id).await? },
    ClientWsMessage::SwitchArtifact { artifact_id } => {
      ServerWsMessage::Session { session: switch_artifact(state, id, &artifact_id).await? }
    }
    ClientWsMessage::Ping => ServerWsMessage::Pong,
    ClientWsMessage::Open { .. } => return Err(ApiError::BadRequest("conversation already open".into())),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Prompts;
  use crate::gate::GateOverride;
  use crate::store::MemoryStore;

  fn state() -> AppState {
    AppState::with_parts(Arc::new(MemoryStore::new()), GateOverride::default(), None, Prompts::default())
  }

  fn parse(json: &str) -> ClientWsMessage {
    serde_json::from_str(json).expect("client message")
  }

  #[tokio::test]
  async fn messages_before_open_are_rejected() {
    let s = state();
    let mut conv = None;
    let reply = handle_client_ws(parse(r#"{"type":"skip"}"#), &mut conv, &s).await;
    assert!(matches!(reply, ServerWsMessage::Error { .. }));
    assert!(matches!(handle_client_ws(parse(r#"{"type":"ping"}"#), &mut conv, &s).await, ServerWsMessage::Pong));
  }

  #[tokio::test]
  async fn open_then_chunk_streams_visible_text() {
    let s = state();
    let mut conv = None;
    let opened = handle_client_ws(parse(r#"{"type":"open","conversationId":"c1"}"#), &mut conv, &s).await;
    assert!(matches!(opened, ServerWsMessage::Session { .. }));
    assert_eq!(conv.as_deref(), Some("c1"));

    let reply = handle_client_ws(parse(r#"{"type":"chunk","text":"Hello <!--QUIZ:{\"q"}"#), &mut conv, &s).await;
    match reply {
      ServerWsMessage::Stream { visible_text, .. } => assert_eq!(visible_text, "Hello"),
      other => panic!("unexpected {other:?}"),
    }
  }

  #[tokio::test]
  async fn unknown_artifact_switch_is_an_error() {
    let s = state();
    let mut conv = Some("c1".to_string());
    let reply = handle_client_ws(parse(r#"{"type":"switch_artifact","artifactId":"nope"}"#), &mut conv, &s).await;
    assert!(matches!(reply, ServerWsMessage::Error { .. }));
  }
}
