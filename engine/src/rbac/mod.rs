//! RBAC / Field Policy
//!
//! Collection authorization runs before any read reaches the document store;
//! redaction runs on every record-reading result before it is threaded to
//! another step, stored as the session's last result, or returned.
//!
//! Redaction removes denied keys at every nesting depth (joined documents
//! included). It is idempotent and never changes row order or row count.

use crate::config::{RbacConfig, StoreConfig};
use sdk::errors::EngineError;
use sdk::types::{Row, Table};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Per-user access record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RbacPolicy {
    pub user_id: String,
    pub collections: BTreeSet<String>,
    pub redacted_fields: BTreeSet<String>,
}

impl RbacPolicy {
    pub fn allows(&self, collection: &str) -> bool {
        self.collections.contains(collection)
    }
}

/// Supplies read-only policies to the engine
pub trait PolicySource: Send + Sync {
    fn policy_for(&self, user_id: &str) -> RbacPolicy;
}

/// Policy source built from the `[store]` and `[rbac]` config sections
pub struct ConfigPolicySource {
    collections: BTreeSet<String>,
    deny_fields: BTreeSet<String>,
    users: BTreeMap<String, (Option<BTreeSet<String>>, BTreeSet<String>)>,
}

impl ConfigPolicySource {
    pub fn from_config(store: &StoreConfig, rbac: &RbacConfig) -> Self {
        let users = rbac
            .users
            .iter()
            .map(|(id, user)| {
                let collections = user
                    .collections
                    .as_ref()
                    .map(|c| c.iter().cloned().collect());
                let deny = user.deny_fields.iter().cloned().collect();
                (id.clone(), (collections, deny))
            })
            .collect();

        Self {
            collections: store.allowed_collections.iter().cloned().collect(),
            deny_fields: rbac.deny_fields.iter().cloned().collect(),
            users,
        }
    }
}

impl PolicySource for ConfigPolicySource {
    fn policy_for(&self, user_id: &str) -> RbacPolicy {
        let mut collections = self.collections.clone();
        let mut redacted_fields = self.deny_fields.clone();

        if let Some((user_collections, user_deny)) = self.users.get(user_id) {
            if let Some(allowed) = user_collections {
                // A user override narrows the store allow-list, never widens it
                collections = collections.intersection(allowed).cloned().collect();
            }
            redacted_fields.extend(user_deny.iter().cloned());
        }

        RbacPolicy {
            user_id: user_id.to_string(),
            collections,
            redacted_fields,
        }
    }
}

/// Policy enforcement point used by the executor
#[derive(Clone)]
pub struct Rbac {
    source: Arc<dyn PolicySource>,
}

impl Rbac {
    pub fn new(source: Arc<dyn PolicySource>) -> Self {
        Self { source }
    }

    pub fn policy(&self, user_id: &str) -> RbacPolicy {
        self.source.policy_for(user_id)
    }

    pub fn authorize_collection(&self, user_id: &str, collection: &str) -> bool {
        self.policy(user_id).allows(collection)
    }

    /// `authorize_collection` as a step error
    pub fn check_collection(&self, user_id: &str, collection: &str) -> Result<(), EngineError> {
        if self.authorize_collection(user_id, collection) {
            Ok(())
        } else {
            Err(EngineError::Authorization {
                user: user_id.to_string(),
                collection: collection.to_string(),
            })
        }
    }

    pub fn redact(&self, user_id: &str, rows: Vec<Row>) -> Vec<Row> {
        let policy = self.policy(user_id);
        redact_rows(rows, &policy.redacted_fields)
    }

    /// Redact rows and drop denied columns from the table header
    pub fn redact_table(&self, user_id: &str, table: Table) -> Table {
        let policy = self.policy(user_id);
        let Table {
            mut columns,
            rows,
            sources,
        } = table;
        columns.retain(|c| !policy.redacted_fields.contains(&c.name));
        Table {
            columns,
            rows: redact_rows(rows, &policy.redacted_fields),
            sources,
        }
    }
}

/// Remove `fields` from every row, at any depth
pub fn redact_rows(mut rows: Vec<Row>, fields: &BTreeSet<String>) -> Vec<Row> {
    if fields.is_empty() {
        return rows;
    }
    let mut removed = 0usize;
    for row in rows.iter_mut() {
        removed += redact_map(row, fields);
    }
    if removed > 0 {
        debug!("Redacted {} field occurrences ({:?})", removed, fields);
    }
    rows
}

fn redact_map(map: &mut Row, fields: &BTreeSet<String>) -> usize {
    let before = map.len();
    map.retain(|key, _| !fields.contains(key));
    let mut removed = before - map.len();
    for value in map.values_mut() {
        removed += redact_value(value, fields);
    }
    removed
}

fn redact_value(value: &mut Value, fields: &BTreeSet<String>) -> usize {
    match value {
        Value::Object(map) => redact_map(map, fields),
        Value::Array(items) => items.iter_mut().map(|v| redact_value(v, fields)).sum(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserPolicyConfig;
    use serde_json::json;

    fn rbac_with_user(user: &str, collections: Option<Vec<&str>>) -> Rbac {
        let mut rbac_config = RbacConfig::default();
        rbac_config.users.insert(
            user.to_string(),
            UserPolicyConfig {
                collections: collections.map(|c| c.iter().map(|s| s.to_string()).collect()),
                deny_fields: vec!["phone".to_string()],
            },
        );
        let source = ConfigPolicySource::from_config(&StoreConfig::default(), &rbac_config);
        Rbac::new(Arc::new(source))
    }

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_default_user_gets_store_allow_list() {
        let rbac = rbac_with_user("rep-7", Some(vec!["tasks"]));
        assert!(rbac.authorize_collection("manager", "leads"));
        assert!(!rbac.authorize_collection("manager", "payroll"));
    }

    #[test]
    fn test_user_override_narrows() {
        let rbac = rbac_with_user("rep-7", Some(vec!["tasks", "payroll"]));
        assert!(rbac.authorize_collection("rep-7", "tasks"));
        assert!(!rbac.authorize_collection("rep-7", "leads"));
        // not in the store allow-list, so still denied
        assert!(!rbac.authorize_collection("rep-7", "payroll"));

        let err = rbac.check_collection("rep-7", "leads").unwrap_err();
        assert!(matches!(err, EngineError::Authorization { .. }));
    }

    #[test]
    fn test_redact_removes_nested_fields() {
        let rbac = rbac_with_user("rep-7", None);
        let rows = vec![
            row(json!({"name": "A", "ssn": "1", "owner": {"name": "x", "salary": 10}})),
            row(json!({"name": "B", "phone": "555", "tasks": [{"salary": 1, "t": 2}]})),
        ];

        let redacted = rbac.redact("rep-7", rows);
        assert_eq!(redacted.len(), 2);
        assert_eq!(redacted[0], row(json!({"name": "A", "owner": {"name": "x"}})));
        assert_eq!(redacted[1], row(json!({"name": "B", "tasks": [{"t": 2}]})));
    }

    #[test]
    fn test_per_user_fields_only_apply_to_that_user() {
        let rbac = rbac_with_user("rep-7", None);
        let rows = vec![row(json!({"name": "A", "phone": "555"}))];
        assert!(rbac.redact("manager", rows.clone())[0].contains_key("phone"));
        assert!(!rbac.redact("rep-7", rows)[0].contains_key("phone"));
    }

    #[test]
    fn test_redact_table_drops_columns() {
        let rbac = rbac_with_user("rep-7", None);
        let table = Table::from_rows(vec![row(json!({"name": "A", "salary": 5}))]);
        let redacted = rbac.redact_table("manager", table);
        assert_eq!(redacted.column_names(), vec!["name"]);
    }
}
