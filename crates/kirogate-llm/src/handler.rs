//! Axum route handlers for the OpenAI-compatible endpoints

use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing};
use futures_util::{Stream, StreamExt, stream};
use http::HeaderValue;
use http::header::RETRY_AFTER;
use kirogate_core::{HttpError, RequestContext};

use crate::convert;
use crate::error::LlmError;
use crate::protocol::openai::{
    OpenAiErrorDetail, OpenAiErrorResponse, OpenAiModel, OpenAiModelList, OpenAiRequest, OpenAiResponse,
};
use crate::relay::RelayResponse;
use crate::state::LlmState;
use crate::types::{CompletionRequest, StreamEvent};

/// Build the router serving `/v1/chat/completions` and `/v1/models`
pub fn llm_router(state: LlmState) -> Router {
    Router::new()
        .route("/v1/chat/completions", routing::post(chat_completions))
        .route("/v1/models", routing::get(list_models))
        .with_state(state)
}

/// Handle `POST /v1/chat/completions`
async fn chat_completions(
    State(state): State<LlmState>,
    axum::Extension(context): axum::Extension<RequestContext>,
    body: Result<Json<OpenAiRequest>, JsonRejection>,
) -> Response {
    let request = match body
        .map_err(|e| LlmError::Validation(e.body_text()))
        .and_then(|Json(wire)| CompletionRequest::try_from(wire))
    {
        Ok(request) => request,
        Err(e) => return error_response(&e),
    };

    if request.stream {
        match state.relay.stream(&request, &context).await {
            Ok(response) => sse_response(response).into_response(),
            Err(e) => error_response(&e),
        }
    } else {
        match state.relay.complete(&request, &context).await {
            Ok(response) => Json(OpenAiResponse::from(response)).into_response(),
            Err(e) => error_response(&e),
        }
    }
}

/// Handle `GET /v1/models`
async fn list_models(State(state): State<LlmState>) -> Json<OpenAiModelList> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let data = state
        .relay
        .catalog()
        .public_names()
        .map(|name| OpenAiModel {
            id: name.to_owned(),
            object: "model",
            created: now,
            owned_by: "anthropic",
        })
        .collect();

    Json(OpenAiModelList {
        object: "list",
        data,
    })
}

/// Relay events as `data:` frames, ending with `[DONE]`
///
/// A failure after the stream started becomes an error frame followed by
/// `[DONE]`.
fn sse_response(response: RelayResponse) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let RelayResponse {
        id,
        model,
        created,
        events,
    } = response;

    let frames = events.flat_map(move |event| {
        let frames = match event {
            Ok(StreamEvent::Delta(delta)) => {
                vec![json_event(&convert::openai::delta_to_openai_chunk(&delta, &id, &model, created))]
            }
            Ok(StreamEvent::Usage(usage)) => {
                vec![json_event(&convert::openai::usage_to_openai_chunk(&usage, &id, &model, created))]
            }
            Ok(StreamEvent::Done) => vec![Ok(Event::default().data("[DONE]"))],
            Err(e) => vec![json_event(&error_body(&e)), Ok(Event::default().data("[DONE]"))],
        };
        stream::iter(frames)
    });

    Sse::new(frames).keep_alive(KeepAlive::default())
}

fn json_event(value: &impl serde::Serialize) -> Result<Event, axum::Error> {
    Event::default().json_data(value)
}

fn error_body(error: &LlmError) -> OpenAiErrorResponse {
    OpenAiErrorResponse {
        error: OpenAiErrorDetail {
            message: error.client_message(),
            kind: error.error_type().to_owned(),
            param: None,
            code: None,
        },
    }
}

/// Render an error as an `OpenAI`-style JSON response
fn error_response(error: &LlmError) -> Response {
    tracing::debug!(error = %error, "chat request failed");

    let mut response = (error.status_code(), Json(error_body(error))).into_response();
    if let Some(secs) = error.retry_after() {
        response.headers_mut().insert(RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}
