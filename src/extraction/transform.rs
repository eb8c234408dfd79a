use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::extraction::source::RawRecord;

const SOURCE_SYSTEM: &str = "crm";
const API_VERSION: &str = "v3";

/// A normalized deal record ready for the sink.
#[derive(Debug, Clone, Serialize)]
pub struct DealRecord {
    pub id: String,
    pub source_record_id: String,
    pub organization_id: String,
    pub scan_id: String,
    pub extracted_at: DateTime<Utc>,
    pub source_system: String,
    pub api_version: String,
    pub page_number: i64,
    pub deal_name: Option<String>,
    pub amount: Option<Decimal>,
    pub pipeline: String,
    pub deal_stage: Option<String>,
    pub deal_type: Option<String>,
    pub description: Option<String>,
    pub close_date: Option<DateTime<Utc>>,
    pub create_date: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
    pub currency_code: String,
    pub owner_id: Option<String>,
    pub is_closed: Option<bool>,
    pub is_closed_won: Option<bool>,
    pub num_associated_contacts: Option<i64>,
    pub days_to_close: Option<i64>,
    pub archived: bool,
    pub source_created_at: Option<DateTime<Utc>>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub custom_properties: Option<Value>,
}

/// Property keys this mapping consumes; anything else the upstream sends
/// lands in `custom_properties`.
fn mapped_properties() -> BTreeSet<&'static str> {
    [
        "dealname",
        "amount",
        "pipeline",
        "dealstage",
        "dealtype",
        "description",
        "closedate",
        "createdate",
        "lastmodifieddate",
        "currency_code",
        "owner_id",
        "is_closed",
        "is_closed_won",
        "num_associated_contacts",
        "days_to_close",
    ]
    .into()
}

/// Map one raw CRM record into the sink schema. Pure: no I/O, invoked once
/// per record.
pub fn transform_record(
    record: &RawRecord,
    scan_id: &str,
    organization_id: &str,
    page_number: i64,
) -> DealRecord {
    let props = &record.properties;

    let custom: Map<String, Value> = {
        let mapped = mapped_properties();
        props
            .iter()
            .filter(|(k, v)| !mapped.contains(k.as_str()) && !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    };

    DealRecord {
        id: Uuid::new_v4().to_string(),
        source_record_id: record.id.clone(),
        organization_id: organization_id.to_string(),
        scan_id: scan_id.to_string(),
        extracted_at: Utc::now(),
        source_system: SOURCE_SYSTEM.to_string(),
        api_version: API_VERSION.to_string(),
        page_number,
        deal_name: as_string(props.get("dealname")),
        amount: as_decimal(props.get("amount")),
        pipeline: as_string(props.get("pipeline")).unwrap_or_else(|| "default".to_string()),
        deal_stage: as_string(props.get("dealstage")),
        deal_type: as_string(props.get("dealtype")),
        description: as_string(props.get("description")),
        close_date: as_datetime(props.get("closedate")),
        create_date: as_datetime(props.get("createdate")),
        last_modified: as_datetime(props.get("lastmodifieddate")),
        currency_code: as_string(props.get("currency_code")).unwrap_or_else(|| "USD".to_string()),
        owner_id: as_string(props.get("owner_id")),
        is_closed: as_bool(props.get("is_closed")),
        is_closed_won: as_bool(props.get("is_closed_won")),
        num_associated_contacts: as_int(props.get("num_associated_contacts")),
        days_to_close: as_int(props.get("days_to_close")),
        archived: record.archived,
        source_created_at: parse_datetime_str(record.created_at.as_deref()),
        source_updated_at: parse_datetime_str(record.updated_at.as_deref()),
        custom_properties: if custom.is_empty() {
            None
        } else {
            Some(Value::Object(custom))
        },
    }
}

fn as_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// ISO 8601 with a tolerated trailing `Z`, as the upstream emits.
fn as_datetime(value: Option<&Value>) -> Option<DateTime<Utc>> {
    parse_datetime_str(value?.as_str())
}

fn parse_datetime_str(value: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = value?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn as_decimal(value: Option<&Value>) -> Option<Decimal> {
    match value? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

fn as_bool(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => Some(matches!(s.to_lowercase().as_str(), "true" | "1" | "yes")),
        _ => None,
    }
}

fn as_int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(properties: serde_json::Value) -> RawRecord {
        RawRecord {
            id: "obj-77".to_string(),
            properties: properties.as_object().cloned().unwrap_or_default(),
            archived: false,
            created_at: Some("2025-06-01T10:00:00Z".to_string()),
            updated_at: Some("2025-06-02T11:30:00Z".to_string()),
        }
    }

    #[test]
    fn maps_known_fields_and_coercions() {
        let record = raw(serde_json::json!({
            "dealname": "Enterprise renewal",
            "amount": "150000.50",
            "dealstage": "contractsent",
            "closedate": "2025-09-30T00:00:00Z",
            "is_closed": "true",
            "num_associated_contacts": "4",
        }));

        let deal = transform_record(&record, "scan-1", "org-1", 3);

        assert_eq!(deal.source_record_id, "obj-77");
        assert_eq!(deal.scan_id, "scan-1");
        assert_eq!(deal.organization_id, "org-1");
        assert_eq!(deal.page_number, 3);
        assert_eq!(deal.deal_name.as_deref(), Some("Enterprise renewal"));
        assert_eq!(deal.amount, Some("150000.50".parse().unwrap()));
        assert_eq!(deal.is_closed, Some(true));
        assert_eq!(deal.num_associated_contacts, Some(4));
        assert!(deal.close_date.is_some());
        assert_eq!(deal.pipeline, "default");
        assert_eq!(deal.currency_code, "USD");
        assert!(deal.source_created_at.is_some());
    }

    #[test]
    fn unmapped_properties_go_to_custom() {
        let record = raw(serde_json::json!({
            "dealname": "Widget order",
            "custom_score": "0.92",
            "region": "emea",
            "nullable_thing": null,
        }));

        let deal = transform_record(&record, "scan-1", "org-1", 1);

        let custom = deal.custom_properties.unwrap();
        assert_eq!(custom["custom_score"], "0.92");
        assert_eq!(custom["region"], "emea");
        // Nulls and mapped keys are excluded.
        assert!(custom.get("nullable_thing").is_none());
        assert!(custom.get("dealname").is_none());
    }

    #[test]
    fn garbage_values_become_none_not_errors() {
        let record = raw(serde_json::json!({
            "amount": "not-a-number",
            "closedate": "yesterday",
            "num_associated_contacts": {"nested": true},
        }));

        let deal = transform_record(&record, "scan-1", "org-1", 1);

        assert!(deal.amount.is_none());
        assert!(deal.close_date.is_none());
        assert!(deal.num_associated_contacts.is_none());
    }

    #[test]
    fn generated_ids_are_unique_per_invocation() {
        let record = raw(serde_json::json!({"dealname": "x"}));
        let a = transform_record(&record, "s", "o", 1);
        let b = transform_record(&record, "s", "o", 1);
        assert_ne!(a.id, b.id);
        assert_eq!(a.source_record_id, b.source_record_id);
    }
}
