//! Reasoning providers against mocked HTTP endpoints
//!
//! These tests do NOT require a running Ollama instance or an OpenAI key.
//! wiremock serves the provider APIs; the planner's validation and rule
//! fallback are exercised through the public `Planner` trait.

use crmflow_engine::conductor::{Intent, Planner, PlanningContext, ReasoningPlanner, StepInput};
use crmflow_engine::config::OpenAIConfig;
use crmflow_engine::llm::ollama::OllamaProvider;
use crmflow_engine::llm::openai::OpenAIProvider;
use crmflow_engine::llm::{LLMError, LLMProvider, Message};
use crmflow_engine::tools::{ToolName, ToolRegistry};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ollama_reply(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "model": "llama3.1:8b",
        "message": {"role": "assistant", "content": content},
        "done": true
    }))
}

fn group_plan() -> String {
    json!({
        "intent": "aggregation",
        "summary": "Leads grouped by owner",
        "steps": [
            {"tool": "store.read", "args": {"collection": "leads"}},
            {"tool": "table.transform", "args": {"operation": "group", "by": ["owner"]}}
        ]
    })
    .to_string()
}

async fn ollama_planner(server: &MockServer) -> ReasoningPlanner {
    let provider = Arc::new(OllamaProvider::new(server.uri(), "llama3.1:8b"));
    ReasoningPlanner::new(provider, ToolRegistry::default())
}

#[tokio::test]
async fn test_ollama_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({"model": "llama3.1:8b", "stream": false, "format": "json"})))
        .respond_with(ollama_reply("{\"ok\": true}"))
        .expect(1)
        .mount(&server)
        .await;

    let provider = OllamaProvider::new(server.uri(), "llama3.1:8b");
    let text = provider.complete(&[Message::user("hi")]).await.unwrap();
    assert_eq!(text, "{\"ok\": true}");
}

#[tokio::test]
async fn test_ollama_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(500).set_body_string("model not loaded"))
        .mount(&server)
        .await;

    let provider = OllamaProvider::new(server.uri(), "llama3.1:8b");
    match provider.complete(&[Message::user("hi")]).await {
        Err(LLMError::ProviderUnavailable(msg)) => assert!(msg.contains("model not loaded")),
        other => panic!("Expected ProviderUnavailable, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_ollama_health() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"models": []})))
        .mount(&server)
        .await;

    assert!(OllamaProvider::new(server.uri(), "m").check_health().await);
    assert!(!OllamaProvider::new("http://127.0.0.1:9", "m").check_health().await);
}

#[tokio::test]
async fn test_reasoning_plan_is_accepted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ollama_reply(&format!("Here you go:\n```json\n{}\n```", group_plan())))
        .mount(&server)
        .await;

    let planner = ollama_planner(&server).await;
    let plan = planner.plan(&PlanningContext::new("who has the biggest pipeline")).await;

    assert_eq!(plan.intent, Intent::Aggregation);
    assert_eq!(plan.summary.as_deref(), Some("Leads grouped by owner"));
    assert_eq!(plan.steps.len(), 2);
    assert_eq!(plan.steps[1].tool, ToolName::TableTransform);
    assert_eq!(plan.steps[1].input, StepInput::Step(1));
}

#[tokio::test]
async fn test_unknown_tool_falls_back_to_rules() {
    let server = MockServer::start().await;
    let bogus = json!({
        "intent": "record_query",
        "steps": [{"tool": "shell.exec", "args": {"cmd": "rm -rf /"}}]
    });
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ollama_reply(&bogus.to_string()))
        .mount(&server)
        .await;

    let planner = ollama_planner(&server).await;
    let plan = planner.plan(&PlanningContext::new("Show me all qualified leads")).await;

    assert_eq!(plan.intent, Intent::RecordQuery);
    assert_eq!(plan.steps.len(), 1);
    assert_eq!(plan.steps[0].tool, ToolName::StoreRead);
    assert_eq!(plan.steps[0].args["filter"], json!({"status": "Qualified"}));
}

#[tokio::test]
async fn test_forbidden_operator_falls_back_to_rules() {
    let server = MockServer::start().await;
    let bogus = json!({
        "intent": "record_query",
        "steps": [{"tool": "store.read", "args": {"collection": "leads", "filter": {"$where": "sleep(1000)"}}}]
    });
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ollama_reply(&bogus.to_string()))
        .mount(&server)
        .await;

    let planner = ollama_planner(&server).await;
    let plan = planner.plan(&PlanningContext::new("Show me all qualified leads")).await;

    assert!(plan.steps[0].args.get("filter").is_some());
    assert!(plan.steps[0].args["filter"].get("$where").is_none());
}

#[tokio::test]
async fn test_unreachable_service_falls_back_to_rules() {
    let provider = Arc::new(OllamaProvider::new("http://127.0.0.1:9", "llama3.1:8b"));
    let planner = ReasoningPlanner::new(provider, ToolRegistry::default());

    let plan = planner.plan(&PlanningContext::new("Group leads by status")).await;
    assert_eq!(plan.intent, Intent::Aggregation);
    assert_eq!(plan.steps.len(), 2);
}

#[tokio::test]
async fn test_slow_service_hits_deadline() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ollama_reply(&group_plan()).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let planner = ollama_planner(&server)
        .await
        .with_deadline(Duration::from_millis(100));

    assert!(planner
        .draft(&PlanningContext::new("who has the biggest pipeline"))
        .await
        .is_err());

    // The Planner path still answers, from the rules
    let plan = planner.plan(&PlanningContext::new("Group leads by status")).await;
    assert_eq!(plan.steps.len(), 2);
}

#[tokio::test]
async fn test_openai_completion_and_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({"model": "gpt-4o-mini", "response_format": {"type": "json_object"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": group_plan()}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = OpenAIConfig {
        base_url: server.uri(),
        model: "gpt-4o-mini".to_string(),
        api_key: Some("sk-test".to_string()),
    };
    let planner = ReasoningPlanner::new(Arc::new(OpenAIProvider::new(config)), ToolRegistry::default());
    let plan = planner
        .draft(&PlanningContext::new("who has the biggest pipeline"))
        .await
        .unwrap();
    assert_eq!(plan.intent, Intent::Aggregation);
}

#[tokio::test]
async fn test_openai_error_mapping() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let config = OpenAIConfig {
        base_url: server.uri(),
        model: "gpt-4o-mini".to_string(),
        api_key: Some("sk-test".to_string()),
    };
    let provider = OpenAIProvider::new(config.clone());
    assert!(matches!(
        provider.complete(&[Message::user("hi")]).await,
        Err(LLMError::RateLimitExceeded)
    ));

    let keyless = OpenAIProvider::new(OpenAIConfig { api_key: None, ..config });
    assert!(!keyless.check_health().await);
    assert!(matches!(
        keyless.complete(&[Message::user("hi")]).await,
        Err(LLMError::AuthenticationFailed(_))
    ));
}
