mod harness;

use std::time::Duration;

use harness::config::ConfigBuilder;
use harness::mock_kiro::{MockKiro, Reply, exception, text_frames, tool_frames};
use harness::server::{TestServer, sse_chunks, sse_data};

fn streaming_body(model: &str) -> serde_json::Value {
    serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": "Hello"}],
        "stream": true
    })
}

#[tokio::test]
async fn streaming_text_arrives_as_openai_chunks() {
    let mock = MockKiro::start().await.unwrap();
    let server = TestServer::start(ConfigBuilder::new(&mock).build()).await.unwrap();

    let response = server.chat(&streaming_body("claude-sonnet-4-5")).await;

    assert_eq!(response.status(), 200);
    assert!(
        response.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    let text = response.text().await.unwrap();
    let data = sse_data(&text);
    assert_eq!(data.last().map(String::as_str), Some("[DONE]"));

    let chunks = sse_chunks(&text);
    assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
    assert!(chunks.iter().all(|chunk| chunk["object"] == "chat.completion.chunk"));
    assert!(chunks.iter().all(|chunk| chunk["id"] == chunks[0]["id"]));

    let content: String = chunks
        .iter()
        .filter_map(|chunk| chunk["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(content, "Hello from Kiro");

    let finish = chunks
        .iter()
        .find_map(|chunk| chunk["choices"][0]["finish_reason"].as_str())
        .unwrap();
    assert_eq!(finish, "stop");

    // Usage rides on its own chunk right before the sentinel
    let usage = &chunks.last().unwrap()["usage"];
    assert!(usage["completion_tokens"].as_u64().unwrap() > 0);
    assert_eq!(
        usage["total_tokens"].as_u64().unwrap(),
        usage["prompt_tokens"].as_u64().unwrap() + usage["completion_tokens"].as_u64().unwrap()
    );
}

#[tokio::test]
async fn streaming_tool_call_is_emitted_whole() {
    let mock = MockKiro::start_with(Reply::frames(tool_frames(
        "tooluse_abc",
        "get_weather",
        &[r#"{"loc"#, r#"ation": "Paris"}"#],
    )))
    .await
    .unwrap();
    let server = TestServer::start(ConfigBuilder::new(&mock).build()).await.unwrap();

    let body = serde_json::json!({
        "model": "claude-sonnet-4-5",
        "messages": [{"role": "user", "content": "What is the weather in Paris?"}],
        "stream": true,
        "tools": [{
            "type": "function",
            "function": {
                "name": "get_weather",
                "description": "Get current weather",
                "parameters": {"type": "object", "properties": {"location": {"type": "string"}}}
            }
        }]
    });
    let text = server.chat(&body).await.text().await.unwrap();
    let chunks = sse_chunks(&text);

    let calls: Vec<&serde_json::Value> = chunks
        .iter()
        .filter_map(|chunk| chunk["choices"][0]["delta"]["tool_calls"].as_array())
        .flatten()
        .collect();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["id"], "tooluse_abc");
    assert_eq!(calls[0]["index"], 0);
    assert_eq!(calls[0]["function"]["name"], "get_weather");
    let arguments: serde_json::Value =
        serde_json::from_str(calls[0]["function"]["arguments"].as_str().unwrap()).unwrap();
    assert_eq!(arguments, serde_json::json!({"location": "Paris"}));

    let finish = chunks
        .iter()
        .find_map(|chunk| chunk["choices"][0]["finish_reason"].as_str())
        .unwrap();
    assert_eq!(finish, "tool_calls");

    // Tool definitions reach the upstream on the current message
    let sent = &mock.chat_bodies()[0];
    let tools = &sent["conversationState"]["currentMessage"]["userInputMessage"]["userInputMessageContext"]["tools"];
    assert_eq!(tools[0]["toolSpecification"]["name"], "get_weather");
}

#[tokio::test]
async fn mid_stream_exception_ends_with_error_chunk() {
    let mut frames = text_frames(&["partial"]);
    frames.truncate(1);
    frames.push(exception("ThrottlingException", "slow down"));
    let mock = MockKiro::start_with(Reply::frames(frames)).await.unwrap();
    let server = TestServer::start(ConfigBuilder::new(&mock).build()).await.unwrap();

    let response = server.chat(&streaming_body("claude-sonnet-4-5")).await;

    // Headers were already sent, so the failure travels in-band
    assert_eq!(response.status(), 200);
    let text = response.text().await.unwrap();
    let data = sse_data(&text);
    assert_eq!(data.last().map(String::as_str), Some("[DONE]"));

    let chunks = sse_chunks(&text);
    assert_eq!(chunks[0]["choices"][0]["delta"]["content"], "partial");
    let error = &chunks.last().unwrap()["error"];
    assert_eq!(error["type"], "upstream_error");
    assert!(error["message"].as_str().unwrap().contains("slow down"));
    assert_eq!(mock.chat_count(), 1);
}

#[tokio::test]
async fn content_length_exception_finishes_with_length() {
    let mut frames = text_frames(&["truncated answer"]);
    frames.truncate(1);
    frames.push(exception("ContentLengthExceededException", "too long"));
    let mock = MockKiro::start_with(Reply::frames(frames)).await.unwrap();
    let server = TestServer::start(ConfigBuilder::new(&mock).build()).await.unwrap();

    let text = server.chat(&streaming_body("claude-sonnet-4-5")).await.text().await.unwrap();
    let chunks = sse_chunks(&text);

    assert!(chunks.iter().all(|chunk| chunk.get("error").is_none()));
    let finish = chunks
        .iter()
        .find_map(|chunk| chunk["choices"][0]["finish_reason"].as_str())
        .unwrap();
    assert_eq!(finish, "length");
}

#[tokio::test]
async fn stalled_stream_reports_idle_timeout() {
    let frames = text_frames(&["one", "two"]);
    let mock = MockKiro::start_with(Reply::Frames {
        frames,
        gap: Duration::from_millis(1500),
    })
    .await
    .unwrap();
    let config = ConfigBuilder::new(&mock).with_idle_timeout(1).build();
    let server = TestServer::start(config).await.unwrap();

    let text = server.chat(&streaming_body("claude-sonnet-4-5")).await.text().await.unwrap();

    let chunks = sse_chunks(&text);
    let error = &chunks.last().unwrap()["error"];
    assert_eq!(error["type"], "timeout_error");
    assert_eq!(sse_data(&text).last().map(String::as_str), Some("[DONE]"));
}
