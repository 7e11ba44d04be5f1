//! `OllamaClient` against a fake Ollama server on a local port.

use axum::{
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::StreamExt;
use lib::llm::{ChatMessage, GatewayError, ModelGateway, OllamaClient};
use lib::params::GenerationParams;
use serde_json::{json, Value};

fn ndjson(frames: &[Value]) -> String {
    frames.iter().map(|f| format!("{}\n", f)).collect()
}

async fn tags() -> Json<Value> {
    Json(json!({
        "models": [
            {"name": "llama3:latest", "model": "llama3:latest", "size": 4_661_224_676u64,
             "details": {"family": "llama"}},
            {"name": "mistral:7b", "size": 4_113_301_824u64}
        ]
    }))
}

async fn chat(Json(body): Json<Value>) -> (StatusCode, String) {
    match body["model"].as_str().unwrap_or_default() {
        "missing" => (
            StatusCode::NOT_FOUND,
            json!({"error": "model 'missing' not found"}).to_string(),
        ),
        "broken" => (
            StatusCode::OK,
            ndjson(&[json!({"message": {"role": "assistant", "content": "Partial "}, "done": false})]),
        ),
        "erroring" => (
            StatusCode::OK,
            ndjson(&[
                json!({"message": {"role": "assistant", "content": "Par"}, "done": false}),
                json!({"error": "out of memory"}),
            ]),
        ),
        _ => {
            // Echo num_predict back so the test can check how options were sent.
            let predict = body["options"]
                .get("num_predict")
                .map(|v| v.to_string())
                .unwrap_or_else(|| "none".to_string());
            (
                StatusCode::OK,
                ndjson(&[
                    json!({"message": {"role": "assistant", "content": "Hel"}, "done": false}),
                    json!({"message": {"role": "assistant", "content": ""}, "done": false}),
                    json!({"message": {"role": "assistant", "content": "lo"}, "done": false}),
                    json!({"message": {"role": "assistant", "content": format!(" [{}]", predict)}, "done": false}),
                    json!({"done": true, "done_reason": "stop"}),
                ]),
            )
        }
    }
}

async fn pull(Json(body): Json<Value>) -> (StatusCode, String) {
    if body["model"] == "bogus" {
        return (
            StatusCode::OK,
            ndjson(&[
                json!({"status": "pulling manifest"}),
                json!({"error": "pull model manifest: file does not exist"}),
            ]),
        );
    }
    (
        StatusCode::OK,
        ndjson(&[
            json!({"status": "pulling manifest"}),
            json!({"status": "downloading", "digest": "sha256:abc", "total": 200, "completed": 50}),
            json!({"status": "downloading", "digest": "sha256:abc", "total": 200, "completed": 200}),
            json!({"status": "verifying sha256 digest"}),
            json!({"status": "success"}),
        ]),
    )
}

async fn remove(Json(body): Json<Value>) -> StatusCode {
    if body["model"] == "llama3:latest" {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn fake_ollama() -> String {
    let app = Router::new()
        .route("/api/tags", get(tags))
        .route("/api/chat", post(chat))
        .route("/api/pull", post(pull))
        .route("/api/delete", delete(remove));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}/", addr)
}

async fn collect(client: &OllamaClient, model: &str, params: &GenerationParams) -> Vec<Result<String, GatewayError>> {
    let stream = client
        .chat_stream(model, vec![ChatMessage::user("hi")], params)
        .await
        .expect("stream opens");
    stream.collect().await
}

#[tokio::test]
async fn lists_local_models_normalized() {
    let client = OllamaClient::new(Some(fake_ollama().await));
    let models = client.list_local().await.unwrap();
    assert_eq!(models.len(), 2);
    assert_eq!(models[0].id, "llama3:latest");
    assert_eq!(models[0].family.as_deref(), Some("llama"));
    assert_eq!(models[0].size_bytes, Some(4_661_224_676));
    assert_eq!(models[1].id, "mistral:7b");
    assert!(models.iter().all(|m| m.is_local));
}

#[tokio::test]
async fn chat_stream_yields_non_empty_increments() {
    let client = OllamaClient::new(Some(fake_ollama().await));
    let items = collect(&client, "llama3", &GenerationParams::default()).await;
    let text: Vec<String> = items.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(text, vec!["Hel", "lo", " [none]"]);

    let capped = GenerationParams::new(0.7, 0.9, Some(64), None).unwrap();
    let items = collect(&client, "llama3", &capped).await;
    assert_eq!(items.last().unwrap().as_ref().unwrap(), " [64]");
}

#[tokio::test]
async fn chat_stream_without_done_is_interrupted_with_partial() {
    let client = OllamaClient::new(Some(fake_ollama().await));
    let items = collect(&client, "broken", &GenerationParams::default()).await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_ref().unwrap(), "Partial ");
    match &items[1] {
        Err(GatewayError::StreamInterrupted { partial, .. }) => assert_eq!(partial, "Partial "),
        other => panic!("expected interruption, got {:?}", other),
    }
}

#[tokio::test]
async fn chat_error_frame_is_interrupted() {
    let client = OllamaClient::new(Some(fake_ollama().await));
    let items = collect(&client, "erroring", &GenerationParams::default()).await;
    match items.last().unwrap() {
        Err(GatewayError::StreamInterrupted { partial, reason }) => {
            assert_eq!(partial, "Par");
            assert_eq!(reason, "out of memory");
        }
        other => panic!("expected interruption, got {:?}", other),
    }
}

#[tokio::test]
async fn chat_with_unknown_model_is_not_found() {
    let client = OllamaClient::new(Some(fake_ollama().await));
    let err = client
        .chat_stream("missing", vec![ChatMessage::user("hi")], &GenerationParams::default())
        .await
        .err()
        .expect("request fails");
    assert!(matches!(err, GatewayError::NotFound(ref m) if m == "missing"));
}

#[tokio::test]
async fn pull_reports_progress_until_success() {
    let client = OllamaClient::new(Some(fake_ollama().await));
    let frames: Vec<_> = client.pull("mistral").await.unwrap().collect().await;
    let frames: Vec<_> = frames.into_iter().map(|f| f.unwrap()).collect();
    assert_eq!(frames.first().unwrap().status, "pulling manifest");
    assert_eq!(frames[1].percent(), 25);
    let last = frames.last().unwrap();
    assert_eq!(last.status, "success");
    assert_eq!((last.bytes_done, last.bytes_total), (200, 200));
}

#[tokio::test]
async fn pull_error_frame_fails() {
    let client = OllamaClient::new(Some(fake_ollama().await));
    let frames: Vec<_> = client.pull("bogus").await.unwrap().collect().await;
    match frames.last().unwrap() {
        Err(GatewayError::PullFailed { model, reason }) => {
            assert_eq!(model, "bogus");
            assert!(reason.contains("file does not exist"));
        }
        other => panic!("expected pull failure, got {:?}", other),
    }
}

#[tokio::test]
async fn delete_maps_missing_model_to_not_found() {
    let client = OllamaClient::new(Some(fake_ollama().await));
    client.delete("llama3:latest").await.unwrap();
    assert!(matches!(
        client.delete("phi3").await,
        Err(GatewayError::NotFound(_))
    ));
}

#[tokio::test]
async fn browse_marks_installed_catalog_entries() {
    let client = OllamaClient::new(Some(fake_ollama().await))
        .with_catalog(vec!["llama3".into(), "mistral".into(), "phi3".into()]);
    let models = client.list_remote(None).await.unwrap();
    let installed: Vec<(&str, bool)> = models.iter().map(|m| (m.id.as_str(), m.is_local)).collect();
    assert_eq!(
        installed,
        vec![("llama3", true), ("mistral", false), ("phi3", false)]
    );
    assert!(matches!(
        client.list_remote(Some("[")).await,
        Err(GatewayError::InvalidFilter(_))
    ));
}

#[tokio::test]
async fn unreachable_daemon_is_unavailable() {
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let client = OllamaClient::new(Some(format!("http://127.0.0.1:{}", port)));
    assert!(matches!(
        client.list_local().await,
        Err(GatewayError::Unavailable(_))
    ));
}
