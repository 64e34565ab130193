//! Test server wrapper that starts kirogate on a random port

use std::net::SocketAddr;

use kirogate_config::Config;
use kirogate_server::Server;
use tokio_util::sync::CancellationToken;

/// Gateway key every test configuration uses
pub const API_KEY: &str = "test-gateway-key";

/// A running test server instance
pub struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    client: reqwest::Client,
}

impl TestServer {
    /// Start a test server with the given configuration
    ///
    /// Binds to port 0 for automatic port assignment
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let server = Server::new(config).await?;
        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        tokio::spawn(async move {
            axum::serve(listener, server.into_router())
                .with_graceful_shutdown(async move {
                    shutdown_clone.cancelled().await;
                })
                .await
                .ok();
        });

        Ok(Self {
            addr,
            shutdown,
            client: reqwest::Client::new(),
        })
    }

    /// Base URL of the running test server
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Get a reference to the HTTP client
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// `POST /v1/chat/completions` with the gateway key
    pub async fn chat(&self, body: &serde_json::Value) -> reqwest::Response {
        self.chat_as(API_KEY, body).await
    }

    /// `POST /v1/chat/completions` with an arbitrary bearer value
    pub async fn chat_as(&self, bearer: &str, body: &serde_json::Value) -> reqwest::Response {
        self.client
            .post(self.url("/v1/chat/completions"))
            .bearer_auth(bearer)
            .json(body)
            .send()
            .await
            .unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// `data:` payloads of an SSE body, in order
pub fn sse_data(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(str::to_owned)
        .collect()
}

/// JSON chunks of an SSE body, without the `[DONE]` sentinel
pub fn sse_chunks(text: &str) -> Vec<serde_json::Value> {
    sse_data(text)
        .iter()
        .filter(|data| data.as_str() != "[DONE]")
        .map(|data| serde_json::from_str(data).unwrap())
        .collect()
}
