//! End-to-end conversations through a fully wired conductor
//!
//! The conductor is built from configuration exactly as the binary builds it:
//! demo document store, SQLite database in a temp dir, and BI/CRM services
//! served by wiremock.

use crmflow_engine::conductor::{ChatRequest, Conductor, Intent, PlanStatus, StepStatus};
use crmflow_engine::config::{Config, UserPolicyConfig};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{body_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn base_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.core.data_dir = dir.path().to_path_buf();
    config.core.preview_rows = 5;
    config
}

async fn conductor_with(config: &Config) -> Conductor {
    Conductor::from_config(config).await.unwrap()
}

#[tokio::test]
async fn test_qualified_leads_are_redacted_and_remembered() {
    let dir = TempDir::new().unwrap();
    let conductor = conductor_with(&base_config(&dir)).await;

    let response = conductor
        .handle_message(ChatRequest::new(Some("s1".into()), "priya", "Show me all qualified leads"))
        .await
        .unwrap();

    assert_eq!(response.plan.intent, Intent::RecordQuery);
    assert_eq!(response.plan.status, PlanStatus::Completed);
    assert_eq!(response.preview_rows.len(), 3);
    assert!(response.preview_rows.iter().all(|r| r["status"] == "Qualified"));
    assert!(response.preview_rows.iter().all(|r| !r.contains_key("ssn")));
    assert!(response.artifacts.is_empty());

    let info = conductor.session_info("s1").await.unwrap();
    assert_eq!(info.last_result_rows, Some(3));
}

#[tokio::test]
async fn test_follow_up_export_uses_last_result() {
    let dir = TempDir::new().unwrap();
    let conductor = conductor_with(&base_config(&dir)).await;

    conductor
        .handle_message(ChatRequest::new(Some("s1".into()), "priya", "Show me all qualified leads"))
        .await
        .unwrap();
    let response = conductor
        .handle_message(ChatRequest::new(Some("s1".into()), "priya", "export those to csv"))
        .await
        .unwrap();

    assert_eq!(response.plan.steps.len(), 1);
    let csv = &response.artifacts["csv"];
    assert_eq!(csv.mime, "text/csv");
    assert!(csv.download_url.ends_with(&csv.artifact_id));

    let bytes = conductor.artifacts().retrieve(&csv.artifact_id).await.unwrap();
    let text = String::from_utf8(bytes).unwrap();
    // header plus the three qualified leads
    assert_eq!(text.lines().count(), 4);
    assert!(!text.contains("ssn"));
}

#[tokio::test]
async fn test_follow_up_without_context_reads_fresh() {
    let dir = TempDir::new().unwrap();
    let conductor = conductor_with(&base_config(&dir)).await;

    let response = conductor
        .handle_message(ChatRequest::new(Some("fresh".into()), "priya", "export those to csv"))
        .await
        .unwrap();

    // Nothing to refer to: the plan starts from the store instead of failing
    assert_eq!(response.plan.status, PlanStatus::Completed);
    assert!(response.plan.steps.len() >= 2);
}

#[tokio::test]
async fn test_sessions_do_not_share_context() {
    let dir = TempDir::new().unwrap();
    let conductor = conductor_with(&base_config(&dir)).await;

    conductor
        .handle_message(ChatRequest::new(Some("a".into()), "priya", "Show me all qualified leads"))
        .await
        .unwrap();
    conductor
        .handle_message(ChatRequest::new(Some("b".into()), "priya", "sing me a song"))
        .await
        .unwrap();

    assert_eq!(conductor.session_info("a").await.unwrap().last_result_rows, Some(3));
    assert_eq!(conductor.session_info("b").await.unwrap().last_result_rows, None);
}

#[tokio::test]
async fn test_unauthorized_collection_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(&dir);
    config.rbac.users.insert(
        "intern".to_string(),
        UserPolicyConfig {
            collections: Some(vec!["tasks".to_string()]),
            deny_fields: Vec::new(),
        },
    );
    let conductor = conductor_with(&config).await;

    let response = conductor
        .handle_message(ChatRequest::new(None, "intern", "Show me all qualified leads"))
        .await
        .unwrap();

    assert_eq!(response.plan.status, PlanStatus::Error);
    assert_eq!(response.plan.steps[0].status(), StepStatus::Error);
    assert!(response.preview_rows.is_empty());
    assert!(response.message.contains("failed"));

    // Allowed collection still works for the same user
    let response = conductor
        .handle_message(ChatRequest::new(None, "intern", "how many open tasks"))
        .await
        .unwrap();
    assert_eq!(response.plan.status, PlanStatus::Completed);
}

#[tokio::test]
async fn test_chart_request_stores_png() {
    let dir = TempDir::new().unwrap();
    let conductor = conductor_with(&base_config(&dir)).await;

    let response = conductor
        .handle_message(ChatRequest::new(None, "priya", "bar chart of leads by status"))
        .await
        .unwrap();

    assert_eq!(response.plan.status, PlanStatus::Completed);
    let chart = &response.artifacts["chart"];
    assert_eq!(chart.mime, "image/png");

    let bytes = conductor.artifacts().retrieve(&chart.artifact_id).await.unwrap();
    assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
}

#[tokio::test]
async fn test_mark_lead_won_patches_crm() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/leads/lead_005"))
        .and(header("x-api-key", "k-123"))
        .and(body_json(json!({"status": "Won"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "lead_005"})))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = base_config(&dir);
    config.crm.base_url = Some(server.uri());
    config.crm.auth_header = "x-api-key".to_string();
    config.crm.auth_value = Some("k-123".to_string());
    let conductor = conductor_with(&config).await;

    let response = conductor
        .handle_message(ChatRequest::new(None, "priya", "Mark lead 5 as won"))
        .await
        .unwrap();

    assert_eq!(response.plan.intent, Intent::Mutation);
    assert_eq!(response.plan.status, PlanStatus::Completed);
    assert_eq!(response.writes.len(), 1);
    assert_eq!(response.writes[0].action, "update_record");
    assert_eq!(response.writes[0].record_id.as_deref(), Some("lead_005"));
}

#[tokio::test]
async fn test_crm_catalog_relocates_actions() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/openapi.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "paths": {"/v2/notes": {"post": {"operationId": "create_note"}}}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/notes"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"data": {"_id": "n-9"}})))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = base_config(&dir);
    config.crm.base_url = Some(server.uri());
    config.crm.catalog_url = Some(format!("{}/openapi.json", server.uri()));
    let conductor = conductor_with(&config).await;

    let response = conductor
        .handle_message(ChatRequest::new(None, "priya", "Add a note to lead 3: client wants a discount"))
        .await
        .unwrap();

    assert_eq!(response.plan.status, PlanStatus::Completed);
    assert_eq!(response.writes[0].record_id.as_deref(), Some("n-9"));
    assert_eq!(response.writes[0].status, 201);
}

#[tokio::test]
async fn test_crm_rejection_fails_the_step() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .respond_with(ResponseTemplate::new(422).set_body_string("status not allowed"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = base_config(&dir);
    config.crm.base_url = Some(server.uri());
    let conductor = conductor_with(&config).await;

    let response = conductor
        .handle_message(ChatRequest::new(None, "priya", "Mark lead 5 as won"))
        .await
        .unwrap();

    assert_eq!(response.plan.status, PlanStatus::Error);
    assert_eq!(response.plan.steps[0].status(), StepStatus::Error);
    let error = response.plan.steps[0].error().unwrap();
    assert!(error.message.contains("422"));
    assert!(response.writes.is_empty());
}

#[tokio::test]
async fn test_card_query_then_export() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/card/42/query"))
        .and(header("X-Metabase-Session", "sess"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {
            "cols": [{"name": "owner"}, {"name": "total"}, {"name": "ssn"}],
            "rows": [["Priya", 67000, "x"], ["Aryan", 99000, "y"]]
        }})))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = base_config(&dir);
    config.bi.site_url = Some(server.uri());
    config.bi.session_token = Some("sess".to_string());
    let conductor = conductor_with(&config).await;

    let response = conductor
        .handle_message(ChatRequest::new(Some("bi".into()), "priya", "run card 42 and export it to csv"))
        .await
        .unwrap();

    assert_eq!(response.plan.status, PlanStatus::Completed);
    let bytes = conductor
        .artifacts()
        .retrieve(&response.artifacts["csv"].artifact_id)
        .await
        .unwrap();
    let text = String::from_utf8(bytes).unwrap();
    assert!(text.starts_with("owner,total"));
    assert!(!text.contains("ssn"));
}

#[tokio::test]
async fn test_embed_without_secret_is_unavailable() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(&dir);
    config.bi.site_url = Some("https://bi.example.com".to_string());
    let conductor = conductor_with(&config).await;

    let response = conductor
        .handle_message(ChatRequest::new(None, "priya", "embed dashboard 3"))
        .await
        .unwrap();

    assert_eq!(response.plan.status, PlanStatus::Error);
    assert!(response.embed_urls.is_empty());
}

#[tokio::test]
async fn test_embed_url_is_returned() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(&dir);
    config.bi.site_url = Some("https://bi.example.com".to_string());
    config.bi.embed_secret = Some("s3cret".to_string());
    let conductor = conductor_with(&config).await;

    let response = conductor
        .handle_message(ChatRequest::new(None, "priya", "embed dashboard 3 in dark mode"))
        .await
        .unwrap();

    assert_eq!(response.embed_urls.len(), 1);
    assert!(response.embed_urls[0].starts_with("https://bi.example.com/embed/dashboard/"));
    assert!(response.embed_urls[0].contains("theme=dark"));
}

#[tokio::test]
async fn test_history_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = base_config(&dir);

    let plan_id = {
        let conductor = conductor_with(&config).await;
        let plan_id = conductor
            .handle_message(ChatRequest::new(None, "priya", "Group leads by status"))
            .await
            .unwrap()
            .plan
            .id;
        conductor.shutdown().await.unwrap();
        plan_id
    };

    let conductor = conductor_with(&config).await;
    let history = conductor.history(5).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, plan_id);
    assert_eq!(history[0].status, "completed");
    assert_eq!(conductor.history_steps(&plan_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_concurrent_messages_on_one_session() {
    let dir = TempDir::new().unwrap();
    let conductor = std::sync::Arc::new(conductor_with(&base_config(&dir)).await);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let conductor = std::sync::Arc::clone(&conductor);
            tokio::spawn(async move {
                conductor
                    .handle_message(ChatRequest::new(Some("shared".into()), "priya", "Show me all qualified leads"))
                    .await
                    .unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap().plan.status, PlanStatus::Completed);
    }

    // Every exchange appended its user and agent turn
    assert_eq!(conductor.session_info("shared").await.unwrap().turns, 8);
}

fn ollama_config(dir: &TempDir, server: &MockServer) -> Config {
    let mut config = base_config(dir);
    config.reasoning.provider = "ollama".to_string();
    config.reasoning.ollama.base_url = server.uri();
    config
}

#[tokio::test]
async fn test_reasoning_prompt_lists_only_readable_fields() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"models": []})))
        .mount(&server)
        .await;
    let plan = json!({
        "intent": "record_query",
        "summary": "Open tasks",
        "steps": [{"tool": "store.read", "args": {"collection": "tasks", "filter": {"status": "Open"}}}]
    });
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_string_contains("  - tasks: _id, due_date, lead_id, owner_id, priority, status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": {"role": "assistant", "content": plan.to_string()}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = ollama_config(&dir, &server);
    config.rbac.users.insert(
        "intern".to_string(),
        UserPolicyConfig {
            collections: Some(vec!["tasks".to_string()]),
            deny_fields: vec!["title".to_string()],
        },
    );
    let conductor = conductor_with(&config).await;
    assert_eq!(conductor.planner_name(), "ollama");

    let response = conductor
        .handle_message(ChatRequest::new(None, "intern", "which tasks are still open"))
        .await
        .unwrap();
    assert_eq!(response.plan.status, PlanStatus::Completed);
    assert!(response.message.starts_with("Open tasks."));

    let requests = server.received_requests().await.unwrap();
    let chat = requests.iter().find(|r| r.url.path() == "/api/chat").unwrap();
    let body: serde_json::Value = serde_json::from_slice(&chat.body).unwrap();
    let system = body["messages"][0]["content"].as_str().unwrap();
    assert!(!system.contains("  - leads"));
    assert!(!system.contains("priority, status, title"));
}

#[tokio::test]
async fn test_unhealthy_reasoning_service_falls_back_to_rules() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let conductor = conductor_with(&ollama_config(&dir, &server)).await;
    assert_eq!(conductor.planner_name(), "rules");

    let response = conductor
        .handle_message(ChatRequest::new(None, "priya", "Group leads by status"))
        .await
        .unwrap();
    assert_eq!(response.plan.status, PlanStatus::Completed);
    let chats = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/api/chat")
        .count();
    assert_eq!(chats, 0);
}

#[tokio::test]
async fn test_follow_up_on_someone_elses_session_is_refused() {
    let dir = TempDir::new().unwrap();
    let mut config = base_config(&dir);
    config.rbac.users.insert(
        "bob".to_string(),
        UserPolicyConfig {
            collections: Some(vec!["tasks".to_string()]),
            deny_fields: vec!["email".to_string()],
        },
    );
    let conductor = conductor_with(&config).await;

    conductor
        .handle_message(ChatRequest::new(Some("s1".into()), "priya", "Show me all qualified leads"))
        .await
        .unwrap();
    let refused = conductor
        .handle_message(ChatRequest::new(Some("s1".into()), "bob", "export this filtered list to Excel"))
        .await;
    assert!(refused.is_err());
    assert_eq!(conductor.session_info("s1").await.unwrap().turns, 2);
    assert!(conductor.list_sessions("bob").await.is_empty());
    assert_eq!(conductor.list_sessions("priya").await.len(), 1);
}

#[tokio::test]
async fn test_saved_report_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = base_config(&dir);

    let report_id = {
        let conductor = conductor_with(&config).await;
        let plan = conductor
            .plan_only(None, "priya", "Build a weekly sales report")
            .await
            .unwrap();
        let spec = plan.steps[0].args.clone();
        let saved = conductor
            .save_report("priya", "Weekly sales", "", spec)
            .await
            .unwrap();
        conductor.shutdown().await.unwrap();
        saved.id
    };

    let conductor = conductor_with(&config).await;
    let response = conductor.run_report(&report_id, "priya").await.unwrap();
    assert_eq!(response.plan.status, PlanStatus::Completed);
    assert!(response.artifacts.contains_key("report"));
    assert_eq!(conductor.history(5).await.unwrap()[0].intent, "report");
}
