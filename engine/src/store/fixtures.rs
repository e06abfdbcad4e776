//! Demo dataset for the in-process document store
//!
//! Dates are relative to `now` so time-window queries ("last week",
//! "this month") always return something.

use chrono::{DateTime, Duration, Utc};
use sdk::errors::EngineError;
use sdk::types::Row;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;

fn days_ago(now: DateTime<Utc>, days: i64) -> String {
    (now - Duration::days(days)).to_rfc3339()
}

fn to_rows(value: Value) -> Vec<Row> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// The five demo collections
pub fn demo_collections(now: DateTime<Utc>) -> HashMap<String, Vec<Row>> {
    // (id, name, company, owner, status, amount, source, region, age_days)
    let leads = [
        ("lead_001", "Acme Corp Renewal", "Acme Corporation", "Priya", "Proposal", 24000, "Referral", "North", 45),
        ("lead_002", "Globex Expansion", "Globex Industries", "Aryan", "Qualified", 85000, "Website", "South", 30),
        ("lead_003", "TechCorp Integration", "TechCorp Solutions", "Sneha", "Discovery", 45000, "Cold Outreach", "West", 15),
        ("lead_004", "StartupXYZ Deal", "StartupXYZ", "Priya", "Won", 35000, "Referral", "North", 60),
        ("lead_005", "Initech Upgrade", "Initech", "Aryan", "Qualified", 12000, "Event", "East", 5),
        ("lead_006", "Umbrella Pilot", "Umbrella Health", "Sneha", "Lost", 18000, "Website", "South", 40),
        ("lead_007", "Hooli Analytics", "Hooli", "Priya", "Negotiation", 99000, "Partner", "West", 3),
        ("lead_008", "Stark Logistics", "Stark Industries", "Aryan", "Won", 64000, "Referral", "East", 20),
        ("lead_009", "Wayne Security", "Wayne Enterprises", "Sneha", "Qualified", 27000, "Cold Outreach", "North", 2),
        ("lead_010", "Soylent Supply", "Soylent Foods", "Priya", "Proposal", 8000, "Website", "South", 10),
        ("lead_011", "Cyberdyne Renewal", "Cyberdyne Systems", "Aryan", "Discovery", 52000, "Partner", "West", 1),
        ("lead_012", "Tyrell Expansion", "Tyrell Corp", "Sneha", "Won", 41000, "Event", "East", 75),
    ];

    let lead_rows: Vec<Row> = leads
        .iter()
        .enumerate()
        .filter_map(
            |(i, (id, name, company, owner, status, amount, source, region, age))| {
                let slug = company.to_lowercase().replace(' ', "");
                let row = json!({
                    "_id": id,
                    "name": name,
                    "company": company,
                    "email": format!("contact@{}.com", slug),
                    "owner": owner,
                    "status": status,
                    "amount": amount,
                    "source": source,
                    "region": region,
                    "created_date": days_ago(now, *age),
                    "ssn": format!("900-00-{:04}", i + 1),
                });
                row.as_object().cloned()
            },
        )
        .collect();

    let tasks = to_rows(json!([
        {"_id": "task_001", "title": "Follow up with Acme Corp", "lead_id": "lead_001", "owner_id": "Priya",
         "due_date": days_ago(now, -2), "priority": "High", "status": "Open"},
        {"_id": "task_002", "title": "Send Globex pricing", "lead_id": "lead_002", "owner_id": "Aryan",
         "due_date": days_ago(now, -1), "priority": "Medium", "status": "Open"},
        {"_id": "task_003", "title": "Book Hooli demo", "lead_id": "lead_007", "owner_id": "Priya",
         "due_date": days_ago(now, 1), "priority": "High", "status": "Done"},
        {"_id": "task_004", "title": "Security review call", "lead_id": "lead_009", "owner_id": "Sneha",
         "due_date": days_ago(now, -5), "priority": "Low", "status": "Open"},
    ]));

    let notes = to_rows(json!([
        {"_id": "note_001", "lead_id": "lead_001", "body": "Client interested in annual contract",
         "created_date": days_ago(now, 3), "created_by": "Priya"},
        {"_id": "note_002", "lead_id": "lead_007", "body": "Procurement wants a 3 year term",
         "created_date": days_ago(now, 1), "created_by": "Priya"},
    ]));

    let call_logs = to_rows(json!([
        {"_id": "call_001", "lead_id": "lead_002", "direction": "outbound", "duration_seconds": 540,
         "summary": "Walked through pricing tiers", "created_date": days_ago(now, 4), "created_by": "Aryan", "salary": 91000},
        {"_id": "call_002", "lead_id": "lead_003", "direction": "inbound", "duration_seconds": 300,
         "summary": "Integration questions", "created_date": days_ago(now, 8), "created_by": "Sneha", "salary": 87000},
    ]));

    let activity = to_rows(json!([
        {"_id": "activity_001", "lead_id": "lead_001", "type": "email", "when": days_ago(now, 2),
         "notes": "Sent proposal document", "created_by": "Priya"},
        {"_id": "activity_002", "lead_id": "lead_008", "type": "meeting", "when": days_ago(now, 6),
         "notes": "Contract signing", "created_by": "Aryan"},
        {"_id": "activity_003", "lead_id": "lead_011", "type": "demo", "when": days_ago(now, 1),
         "notes": "Platform walkthrough", "created_by": "Aryan"},
    ]));

    HashMap::from([
        ("leads".to_string(), lead_rows),
        ("tasks".to_string(), tasks),
        ("notes".to_string(), notes),
        ("call_logs".to_string(), call_logs),
        ("activity".to_string(), activity),
    ])
}

/// Load `{collection: [documents]}` from a JSON file
pub fn load_fixtures(path: &Path) -> Result<HashMap<String, Vec<Row>>, EngineError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Config(format!("Failed to read fixtures: {}", e)))?;
    let value: Value = serde_json::from_str(&contents)
        .map_err(|e| EngineError::Config(format!("Failed to parse fixtures: {}", e)))?;

    match value {
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(collection, docs)| (collection, to_rows(docs)))
            .collect()),
        _ => Err(EngineError::Config(
            "Fixtures must be an object of collection arrays".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_collections_shape() {
        let data = demo_collections(Utc::now());
        assert_eq!(data.len(), 5);
        assert_eq!(data["leads"].len(), 12);
        let qualified = data["leads"]
            .iter()
            .filter(|l| l["status"] == "Qualified")
            .count();
        assert_eq!(qualified, 3);
    }

    #[test]
    fn test_load_fixtures_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fixtures.json");
        std::fs::write(&path, r#"{"leads": [{"_id": "x", "status": "Won"}], "tasks": []}"#).unwrap();

        let data = load_fixtures(&path).unwrap();
        assert_eq!(data["leads"].len(), 1);
        assert!(data["tasks"].is_empty());
    }
}
