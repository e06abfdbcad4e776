//! CRM action surface
//!
//! Record mutations (tasks, notes, call logs, activities, lead updates) are
//! HTTP calls against the CRM API. [`ActionCatalog`] maps each action to a
//! method and path template; an OpenAPI document can relocate any action by
//! declaring an operation whose `operationId` is the action name.

use async_trait::async_trait;
use reqwest::{Client, Method};
use sdk::errors::EngineError;
use sdk::types::RecordRef;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::CrmConfig;

const COLLABORATOR: &str = "crm";
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrmAction {
    CreateTask,
    CreateNote,
    LogCall,
    CreateActivity,
    UpdateRecord,
}

impl CrmAction {
    pub const ALL: [CrmAction; 5] = [
        CrmAction::CreateTask,
        CrmAction::CreateNote,
        CrmAction::LogCall,
        CrmAction::CreateActivity,
        CrmAction::UpdateRecord,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CrmAction::CreateTask => "create_task",
            CrmAction::CreateNote => "create_note",
            CrmAction::LogCall => "log_call",
            CrmAction::CreateActivity => "create_activity",
            CrmAction::UpdateRecord => "update_record",
        }
    }
}

/// HTTP method plus path template (`/leads/{lead_id}`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub method: Method,
    pub path: String,
}

impl Endpoint {
    fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
        }
    }

    /// Substitute `{name}` placeholders; every placeholder must be supplied
    pub fn render_path(&self, params: &Map<String, Value>) -> Result<String, EngineError> {
        let mut path = self.path.clone();
        for (key, value) in params {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            path = path.replace(&format!("{{{}}}", key), &text);
        }
        if path.contains('{') {
            return Err(EngineError::validation(
                "crm",
                format!("missing path parameter in {}", self.path),
            ));
        }
        Ok(path)
    }
}

#[derive(Debug, Clone)]
pub struct ActionCatalog {
    endpoints: HashMap<CrmAction, Endpoint>,
}

impl Default for ActionCatalog {
    fn default() -> Self {
        Self {
            endpoints: HashMap::from([
                (CrmAction::CreateTask, Endpoint::new(Method::POST, "/tasks")),
                (CrmAction::CreateNote, Endpoint::new(Method::POST, "/notes")),
                (CrmAction::LogCall, Endpoint::new(Method::POST, "/call-logs")),
                (CrmAction::CreateActivity, Endpoint::new(Method::POST, "/activity")),
                (CrmAction::UpdateRecord, Endpoint::new(Method::PATCH, "/leads/{lead_id}")),
            ]),
        }
    }
}

impl ActionCatalog {
    /// Defaults overridden by matching `operationId`s in an OpenAPI document
    pub fn with_openapi(mut self, document: &Value) -> Self {
        let Some(paths) = document.get("paths").and_then(Value::as_object) else {
            return self;
        };
        for (path, operations) in paths {
            let Some(operations) = operations.as_object() else {
                continue;
            };
            for (method, operation) in operations {
                let Some(op_id) = operation.get("operationId").and_then(Value::as_str) else {
                    continue;
                };
                let Some(action) = CrmAction::ALL.into_iter().find(|a| a.as_str() == op_id) else {
                    continue;
                };
                match Method::from_bytes(method.to_uppercase().as_bytes()) {
                    Ok(method) => {
                        debug!("CRM action {} mapped to {} {}", op_id, method, path);
                        self.endpoints.insert(action, Endpoint { method, path: path.clone() });
                    }
                    Err(_) => warn!("Ignoring operation {} with method '{}'", op_id, method),
                }
            }
        }
        self
    }

    pub fn resolve(&self, action: CrmAction) -> Option<&Endpoint> {
        self.endpoints.get(&action)
    }
}

/// Record identifier from a create/update response
pub fn record_id(body: &Value) -> Option<String> {
    let candidates = [
        body.get("id"),
        body.get("_id"),
        body.get("data").and_then(|d| d.get("id")),
        body.get("data").and_then(|d| d.get("_id")),
    ];
    candidates.into_iter().flatten().find_map(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

#[async_trait]
pub trait CrmActions: Send + Sync {
    fn name(&self) -> &str {
        COLLABORATOR
    }

    async fn execute(
        &self,
        action: CrmAction,
        path_params: &Map<String, Value>,
        body: &Value,
    ) -> Result<RecordRef, EngineError>;
}

pub struct HttpCrmClient {
    base_url: Option<String>,
    catalog_url: Option<String>,
    auth: Option<(String, String)>,
    catalog: ActionCatalog,
    client: Client,
}

impl HttpCrmClient {
    pub fn from_config(config: &CrmConfig) -> Self {
        let auth = config
            .auth_value
            .as_ref()
            .filter(|v| !v.is_empty())
            .map(|v| (config.auth_header.clone(), v.clone()));
        Self {
            base_url: config
                .base_url
                .as_ref()
                .map(|s| s.trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty()),
            catalog_url: config.catalog_url.clone().filter(|s| !s.is_empty()),
            auth,
            catalog: ActionCatalog::default(),
            client: Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn with_catalog(mut self, catalog: ActionCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn catalog(&self) -> &ActionCatalog {
        &self.catalog
    }

    /// Fetch the OpenAPI document, keeping the defaults if it is unreachable
    pub async fn load_catalog(mut self) -> Self {
        let Some(url) = self.catalog_url.clone() else {
            return self;
        };
        let mut request = self.client.get(&url);
        if let Some((header, value)) = &self.auth {
            request = request.header(header.as_str(), value.as_str());
        }
        let document = match request.send().await {
            Ok(resp) if resp.status().is_success() => resp.json::<Value>().await.ok(),
            Ok(resp) => {
                warn!("CRM catalog at {} returned {}", url, resp.status());
                None
            }
            Err(e) => {
                warn!("Unable to load CRM catalog at {}: {}", url, e);
                None
            }
        };
        if let Some(document) = document {
            self.catalog = self.catalog.with_openapi(&document);
        }
        self
    }

    fn map_send_error(e: reqwest::Error) -> EngineError {
        if e.is_timeout() {
            EngineError::CollaboratorTimeout {
                collaborator: COLLABORATOR.to_string(),
                secs: REQUEST_TIMEOUT_SECS,
            }
        } else if e.is_connect() {
            EngineError::unavailable(COLLABORATOR, "cannot connect to CRM API")
        } else {
            EngineError::unavailable(COLLABORATOR, e.to_string())
        }
    }
}

#[async_trait]
impl CrmActions for HttpCrmClient {
    async fn execute(
        &self,
        action: CrmAction,
        path_params: &Map<String, Value>,
        body: &Value,
    ) -> Result<RecordRef, EngineError> {
        let base = self
            .base_url
            .as_deref()
            .ok_or_else(|| EngineError::unavailable(COLLABORATOR, "CRM base URL not configured"))?;
        let endpoint = self.catalog.resolve(action).ok_or_else(|| {
            EngineError::unavailable(COLLABORATOR, format!("no endpoint for {}", action.as_str()))
        })?;
        let url = format!("{}{}", base, endpoint.render_path(path_params)?);

        let mut request = self.client.request(endpoint.method.clone(), &url).json(body);
        if let Some((header, value)) = &self.auth {
            request = request.header(header.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(Self::map_send_error)?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(EngineError::CollaboratorRejected {
                collaborator: COLLABORATOR.to_string(),
                status: status.as_u16(),
                message: text.chars().take(200).collect(),
            });
        }

        let parsed: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        let record = RecordRef {
            action: action.as_str().to_string(),
            record_id: record_id(&parsed),
            status: status.as_u16(),
        };
        info!(
            "CRM {} {} -> {} ({:?})",
            endpoint.method, endpoint.path, record.status, record.record_id
        );
        Ok(record)
    }
}
