use pretty_assertions::assert_eq;
use scenecraft_core::{CallPurpose, ChatRequest, ModelError, ModelService, Persona};
use scenecraft_providers::OllamaClient;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn planning_request() -> ChatRequest {
    ChatRequest::text(
        &Persona::new("llama4:maverick", 0.0),
        CallPurpose::Planning,
        "plan a red cube",
    )
}

#[tokio::test]
async fn chat_posts_to_api_chat_and_returns_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({
            "model": "llama4:maverick",
            "stream": false,
            "messages": [{ "role": "user", "content": "plan a red cube" }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "llama4:maverick",
            "message": { "role": "assistant", "content": "A = {cube}" },
            "done": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = OllamaClient::new(server.uri()).unwrap();
    let reply = client.chat(planning_request()).await.unwrap();
    assert_eq!(reply.content, "A = {cube}");
    assert!(reply.tool_calls.is_empty());
}

#[tokio::test]
async fn error_status_is_reported_with_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(404).set_body_string("model not found"))
        .mount(&server)
        .await;

    let client = OllamaClient::new(format!("{}/", server.uri())).unwrap();
    match client.chat(planning_request()).await {
        Err(ModelError::Status { status, body }) => {
            assert_eq!(status, 404);
            assert_eq!(body, "model not found");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn undecodable_reply_is_a_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let client = OllamaClient::new(server.uri()).unwrap();
    assert!(matches!(
        client.chat(planning_request()).await,
        Err(ModelError::Decode(_))
    ));
}

#[tokio::test]
async fn unreachable_server_is_a_transport_error() {
    let client = OllamaClient::new("http://127.0.0.1:9").unwrap();
    assert!(matches!(
        client.chat(planning_request()).await,
        Err(ModelError::Transport(_))
    ));
}
