//! Mock upstream for integration tests
//!
//! Serves the chat endpoint as CRC-valid binary event-stream frames, a
//! social token endpoint and the model listing, counting every call.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing};
use bytes::Bytes;
use futures_util::stream;
use kirogate_llm::eventstream::{event_frame, exception_frame};
use tokio_util::sync::CancellationToken;

/// One scripted chat reply
#[derive(Clone)]
pub enum Reply {
    /// Stream these frames, pausing `gap` between them
    Frames { frames: Vec<Bytes>, gap: Duration },
    /// Answer with a bare status
    Status { status: StatusCode, retry_after: Option<u64> },
}

impl Reply {
    pub fn frames(frames: Vec<Bytes>) -> Self {
        Self::Frames {
            frames,
            gap: Duration::ZERO,
        }
    }

    pub const fn status(status: StatusCode) -> Self {
        Self::Status {
            status,
            retry_after: None,
        }
    }
}

/// Text reply split into one frame per piece
pub fn text_frames(pieces: &[&str]) -> Vec<Bytes> {
    pieces
        .iter()
        .map(|piece| {
            let payload = serde_json::json!({ "content": piece }).to_string();
            event_frame("assistantResponseEvent", payload.as_bytes())
        })
        .chain([
            event_frame("contextUsageEvent", br#"{"contextUsagePercentage":1.0}"#),
            event_frame("meteringEvent", br#"{"unit":"credit","usage":0.02}"#),
        ])
        .collect()
}

/// Tool use delivered as a start event and argument fragments
pub fn tool_frames(id: &str, name: &str, fragments: &[&str]) -> Vec<Bytes> {
    let mut frames = vec![event_frame(
        "toolUseEvent",
        serde_json::json!({ "toolUseId": id, "name": name }).to_string().as_bytes(),
    )];
    for fragment in fragments {
        frames.push(event_frame(
            "toolUseEvent",
            serde_json::json!({ "toolUseId": id, "name": name, "input": fragment })
                .to_string()
                .as_bytes(),
        ));
    }
    frames.push(event_frame(
        "toolUseEvent",
        serde_json::json!({ "toolUseId": id, "name": name, "stop": true })
            .to_string()
            .as_bytes(),
    ));
    frames
}

/// Exception frame as the upstream sends it mid-stream
pub fn exception(kind: &str, message: &str) -> Bytes {
    exception_frame(kind, serde_json::json!({ "message": message }).to_string().as_bytes())
}

/// Mock upstream with a scripted chat endpoint
pub struct MockKiro {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<MockState>,
}

struct MockState {
    chat_hits: AtomicU32,
    refresh_hits: AtomicU32,
    model_hits: AtomicU32,
    /// Consumed one per chat call; the fallback answers once it is empty
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    /// Delay before any chat response headers
    chat_delay: Mutex<Duration>,
    /// Delay before the token endpoint answers
    refresh_delay: Mutex<Duration>,
    /// Chat requests must carry this bearer token, or get 403
    accept_token: Mutex<Option<String>>,
    chat_bodies: Mutex<Vec<serde_json::Value>>,
    chat_tokens: Mutex<Vec<String>>,
}

impl MockKiro {
    /// Start a mock answering every chat call with `Hello from Kiro`
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with(Reply::frames(text_frames(&["Hello", " from", " Kiro"]))).await
    }

    /// Start a mock whose default chat reply is `fallback`
    pub async fn start_with(fallback: Reply) -> anyhow::Result<Self> {
        let state = Arc::new(MockState {
            chat_hits: AtomicU32::new(0),
            refresh_hits: AtomicU32::new(0),
            model_hits: AtomicU32::new(0),
            script: Mutex::new(VecDeque::new()),
            fallback,
            chat_delay: Mutex::new(Duration::ZERO),
            refresh_delay: Mutex::new(Duration::ZERO),
            accept_token: Mutex::new(None),
            chat_bodies: Mutex::new(Vec::new()),
            chat_tokens: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/generateAssistantResponse", routing::post(handle_chat))
            .route("/refreshToken", routing::post(handle_refresh))
            .route("/ListAvailableModels", routing::get(handle_models))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_clone.cancelled().await;
                })
                .await
                .ok();
        });

        Ok(Self { addr, shutdown, state })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Queue replies for the next chat calls
    pub fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        self.state.script.lock().unwrap().extend(replies);
    }

    pub fn delay_chat(&self, delay: Duration) {
        *self.state.chat_delay.lock().unwrap() = delay;
    }

    pub fn delay_refresh(&self, delay: Duration) {
        *self.state.refresh_delay.lock().unwrap() = delay;
    }

    /// Reject chat calls not bearing `token` with 403
    pub fn accept_only(&self, token: &str) {
        *self.state.accept_token.lock().unwrap() = Some(token.to_owned());
    }

    pub fn chat_count(&self) -> u32 {
        self.state.chat_hits.load(Ordering::SeqCst)
    }

    pub fn refresh_count(&self) -> u32 {
        self.state.refresh_hits.load(Ordering::SeqCst)
    }

    pub fn model_list_count(&self) -> u32 {
        self.state.model_hits.load(Ordering::SeqCst)
    }

    /// Payloads of every chat call so far
    pub fn chat_bodies(&self) -> Vec<serde_json::Value> {
        self.state.chat_bodies.lock().unwrap().clone()
    }

    /// Bearer tokens of every chat call so far
    pub fn chat_tokens(&self) -> Vec<String> {
        self.state.chat_tokens.lock().unwrap().clone()
    }
}

impl Drop for MockKiro {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn handle_chat(State(state): State<Arc<MockState>>, headers: HeaderMap, body: Bytes) -> Response {
    state.chat_hits.fetch_add(1, Ordering::SeqCst);

    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_owned();
    state.chat_tokens.lock().unwrap().push(token.clone());
    if let Ok(json) = serde_json::from_slice(&body) {
        state.chat_bodies.lock().unwrap().push(json);
    }

    let delay = *state.chat_delay.lock().unwrap();
    tokio::time::sleep(delay).await;

    let accepted = state.accept_token.lock().unwrap().clone();
    if accepted.is_some_and(|accepted| accepted != token) {
        return (StatusCode::FORBIDDEN, r#"{"message":"The bearer token included in the request is invalid."}"#)
            .into_response();
    }

    let reply = state
        .script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| state.fallback.clone());

    match reply {
        Reply::Status { status, retry_after } => {
            let mut response = (status, r#"{"message":"scripted failure"}"#).into_response();
            if let Some(secs) = retry_after {
                response.headers_mut().insert("retry-after", secs.into());
            }
            response
        }
        Reply::Frames { frames, gap } => {
            let body = stream::unfold(frames.into_iter(), move |mut frames| async move {
                let frame = frames.next()?;
                tokio::time::sleep(gap).await;
                Some((Ok::<_, Infallible>(frame), frames))
            });
            Response::builder()
                .header("content-type", "application/vnd.amazon.eventstream")
                .body(Body::from_stream(body))
                .unwrap()
        }
    }
}

async fn handle_refresh(State(state): State<Arc<MockState>>, Json(body): Json<serde_json::Value>) -> Response {
    let n = state.refresh_hits.fetch_add(1, Ordering::SeqCst) + 1;

    let delay = *state.refresh_delay.lock().unwrap();
    tokio::time::sleep(delay).await;

    let Some(refresh_token) = body["refreshToken"].as_str() else {
        return (StatusCode::BAD_REQUEST, "missing refreshToken").into_response();
    };
    if refresh_token == "revoked" {
        return (StatusCode::UNAUTHORIZED, r#"{"message":"Invalid refresh token"}"#).into_response();
    }

    Json(serde_json::json!({
        "accessToken": format!("{refresh_token}-access-{n}"),
        "expiresIn": 3600,
    }))
    .into_response()
}

async fn handle_models(State(state): State<Arc<MockState>>) -> Json<serde_json::Value> {
    state.model_hits.fetch_add(1, Ordering::SeqCst);

    Json(serde_json::json!({
        "models": [
            { "modelId": "claude-sonnet-4.5", "tokenLimits": { "maxInputTokens": 100_000 } },
            { "modelId": "CLAUDE_SONNET_4_5_20250929_V1_0", "tokenLimits": { "maxInputTokens": 100_000 } }
        ]
    }))
}
