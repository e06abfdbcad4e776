//! BI service collaborator (Metabase)
//!
//! Two capabilities: signed embed URLs for dashboards and questions, and
//! saved-card queries returned as tables. Embedding needs the site URL and
//! the embed secret; card queries need the site URL and a session token.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use reqwest::Client;
use sdk::errors::EngineError;
use sdk::types::{Row, Table};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::BiConfig;

const COLLABORATOR: &str = "bi_service";
const REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Dashboard,
    Question,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Dashboard => "dashboard",
            ResourceType::Question => "question",
        }
    }
}

#[async_trait]
pub trait BiService: Send + Sync {
    fn name(&self) -> &str {
        COLLABORATOR
    }

    /// Signed, expiring URL embedding one dashboard or question
    fn embed_url(
        &self,
        resource_type: ResourceType,
        resource_id: i64,
        params: &Map<String, Value>,
        theme: Option<&str>,
    ) -> Result<String, EngineError>;

    /// Run a saved card and return its result set
    async fn query_card(&self, card_id: i64, params: &Map<String, Value>)
        -> Result<Table, EngineError>;
}

pub struct MetabaseClient {
    site_url: Option<String>,
    embed_secret: Option<String>,
    session_token: Option<String>,
    expiry_minutes: u64,
    default_theme: String,
    client: Client,
}

impl MetabaseClient {
    pub fn from_config(config: &BiConfig) -> Self {
        Self {
            site_url: config
                .site_url
                .as_ref()
                .map(|s| s.trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty()),
            embed_secret: config.embed_secret.clone().filter(|s| !s.is_empty()),
            session_token: config.session_token.clone().filter(|s| !s.is_empty()),
            expiry_minutes: config.embed_expiry_minutes,
            default_theme: config.default_theme.clone(),
            client: Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
        }
    }

    fn site(&self) -> Result<&str, EngineError> {
        self.site_url
            .as_deref()
            .ok_or_else(|| EngineError::unavailable(COLLABORATOR, "BI site URL not configured"))
    }

    fn map_send_error(&self, e: reqwest::Error) -> EngineError {
        if e.is_timeout() {
            EngineError::CollaboratorTimeout {
                collaborator: COLLABORATOR.to_string(),
                secs: REQUEST_TIMEOUT_SECS,
            }
        } else if e.is_connect() {
            EngineError::unavailable(COLLABORATOR, "cannot connect to BI service")
        } else {
            EngineError::unavailable(COLLABORATOR, e.to_string())
        }
    }
}

/// Compact JWS with HS256
pub fn sign_hs256(claims: &Value, secret: &str) -> Result<String, EngineError> {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    let signing_input = format!("{}.{}", header, payload);

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| EngineError::Config(format!("Invalid embed secret: {}", e)))?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{}.{}", signing_input, signature))
}

/// `{data: {rows, cols}}` or a bare `{results: [...]}` into a table
pub fn table_from_card_response(body: &Value) -> Table {
    let data = body.get("data").unwrap_or(body);

    let cols: Vec<String> = data
        .get("cols")
        .and_then(Value::as_array)
        .map(|cols| {
            cols.iter()
                .map(|c| c.get("name").and_then(Value::as_str).unwrap_or_default().to_string())
                .collect()
        })
        .unwrap_or_default();

    if let Some(rows) = data.get("rows").and_then(Value::as_array) {
        if !cols.is_empty() {
            let rows = rows
                .iter()
                .filter_map(Value::as_array)
                .map(|cells| {
                    cols.iter()
                        .cloned()
                        .zip(cells.iter().cloned())
                        .collect::<Row>()
                })
                .collect();
            return Table::from_rows(rows);
        }
    }

    let results = data
        .get("results")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|i| i.as_object().cloned()).collect())
        .unwrap_or_default();
    Table::from_rows(results)
}

#[async_trait]
impl BiService for MetabaseClient {
    fn embed_url(
        &self,
        resource_type: ResourceType,
        resource_id: i64,
        params: &Map<String, Value>,
        theme: Option<&str>,
    ) -> Result<String, EngineError> {
        let site = self.site()?;
        let secret = self
            .embed_secret
            .as_deref()
            .ok_or_else(|| EngineError::unavailable(COLLABORATOR, "BI embed secret not configured"))?;

        let exp = chrono::Utc::now().timestamp() + (self.expiry_minutes as i64) * 60;
        let mut resource = Map::new();
        resource.insert(resource_type.as_str().to_string(), Value::from(resource_id));
        let claims = json!({
            "resource": resource,
            "params": params,
            "exp": exp,
        });
        let token = sign_hs256(&claims, secret)?;
        let theme = theme.unwrap_or(&self.default_theme);

        debug!("Signed {} {} embed (exp {})", resource_type.as_str(), resource_id, exp);
        Ok(format!(
            "{}/embed/{}/{}#theme={}&bordered=true&titled=true",
            site,
            resource_type.as_str(),
            token,
            theme
        ))
    }

    async fn query_card(
        &self,
        card_id: i64,
        params: &Map<String, Value>,
    ) -> Result<Table, EngineError> {
        let url = format!("{}/api/card/{}/query", self.site()?, card_id);

        let mut request = self.client.post(&url).json(&json!({ "parameters": params }));
        if let Some(token) = &self.session_token {
            request = request.header("X-Metabase-Session", token);
        }

        let start = std::time::Instant::now();
        let response = request.send().await.map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::CollaboratorRejected {
                collaborator: COLLABORATOR.to_string(),
                status,
                message: text.chars().take(200).collect(),
            });
        }

        let body: Value = response.json().await.map_err(|e| {
            EngineError::unavailable(COLLABORATOR, format!("unreadable card response: {}", e))
        })?;
        let table = table_from_card_response(&body);

        info!(
            "Card {} returned {} rows in {:.1}s",
            card_id,
            table.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(table)
    }
}
