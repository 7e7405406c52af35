use async_trait::async_trait;
use std::sync::Arc;

use nl2kql::config::Config;
use nl2kql::embedding::EmbeddingProvider;
use nl2kql::generation::{DisabledGenerator, GenerationRequest, QueryGenerator};
use nl2kql::server::router;
use nl2kql::workflow::WorkflowContext;
use nl2kql_core::store::memory::InMemoryStore;
use nl2kql_core::Result;

struct EchoTable;

#[async_trait]
impl QueryGenerator for EchoTable {
    fn name(&self) -> &str {
        "echo"
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<String> {
        Ok("Heartbeat\n| where TimeGenerated > ago(1h)\n| summarize count() by Computer".to_string())
    }
}

async fn spawn_server(generator: Arc<dyn QueryGenerator>) -> String {
    let mut config = Config::minimal("unused.sqlite");
    config.embedding.dims = 32;
    let ctx = WorkflowContext::new(
        Arc::new(InMemoryStore::new()),
        Arc::new(EmbeddingProvider::hash_only(32)),
        generator,
        Arc::new(config),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(ctx)).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_health() {
    let base = spawn_server(Arc::new(EchoTable)).await;
    let body: serde_json::Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_nl2kql_round_trip() {
    let base = spawn_server(Arc::new(EchoTable)).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/nl2kql", base))
        .json(&serde_json::json!({"natural_language": "heartbeats per computer"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["kql_query"].as_str().unwrap().starts_with("Heartbeat"));
    assert_eq!(body["is_valid"], true);
    assert_eq!(body["rag_workflow_used"], true);
    assert!(body["context_used"]["tables_considered"].is_number());
    assert!(body["complexity"]["complexity_score"].is_number());
}

#[tokio::test]
async fn test_empty_question_is_bad_request() {
    let base = spawn_server(Arc::new(EchoTable)).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/nl2kql", base))
        .json(&serde_json::json!({"natural_language": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
    assert_eq!(body["error"]["retryable"], false);
}

#[tokio::test]
async fn test_disabled_generator_is_service_unavailable() {
    let base = spawn_server(Arc::new(DisabledGenerator::default())).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/nl2kql", base))
        .json(&serde_json::json!({"natural_language": "cpu usage", "use_rag": false}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "generation_unavailable");
}

#[tokio::test]
async fn test_feedback_and_status() {
    let base = spawn_server(Arc::new(EchoTable)).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/feedback", base))
        .json(&serde_json::json!({
            "natural_language": "heartbeats per computer",
            "generated_query": "Heartbeat | summarize count() by Computer",
            "rating": "good"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let ack: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(ack["usage_count"], 1);

    let status: serde_json::Value = client
        .get(format!("{}/status", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["total_items"], 1);
    assert_eq!(status["generation_provider"], "echo");
}
