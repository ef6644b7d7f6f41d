//! Dataverse Web API client
//!
//! Implements [`BackendClient`] over HTTPS: queries are sent as FetchXML to
//! the entity set of the queried table, tokens come from the client
//! credentials flow of the configured tenant. Rows are decoded from the
//! annotated JSON into typed [`AttributeValue`]s.

use std::collections::HashMap;

use async_trait::async_trait;
use crmtrail_core::error::{CrmTrailError, Result};
use crmtrail_core::query::QueryExpression;
use crmtrail_core::record::BackendRecord;
use crmtrail_core::value::AttributeValue;
use log::debug;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::BackendConfig;
use crate::connection::{ConnectionCandidate, Credential};
use crate::gateway::BackendClient;

const FORMATTED_VALUE: &str = "@OData.Community.Display.V1.FormattedValue";
const LOOKUP_LOGICAL_NAME: &str = "@Microsoft.Dynamics.CRM.lookuplogicalname";
const MORE_RECORDS: &str = "@Microsoft.Dynamics.CRM.morerecords";

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct EntityDefinition {
    #[serde(rename = "EntitySetName")]
    entity_set_name: String,
}

#[derive(Deserialize)]
struct RecordCountResponse {
    #[serde(rename = "EntityRecordCountCollection")]
    collection: RecordCountCollection,
}

#[derive(Deserialize)]
struct RecordCountCollection {
    #[serde(rename = "Keys", default)]
    keys: Vec<String>,
    #[serde(rename = "Values", default)]
    values: Vec<u64>,
}

/// HTTP client for the Dataverse Web API
pub struct DataverseClient {
    http_client: reqwest::Client,
    tenant_id: Option<String>,
    authority_host: String,
    api_version: String,
    page_size: u32,
    tokens: Mutex<HashMap<String, String>>,
    entity_sets: Mutex<HashMap<String, String>>,
}

impl DataverseClient {
    /// Create a client from the backend settings
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| CrmTrailError::Http(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            tenant_id: config.tenant_id.clone(),
            authority_host: config.authority_host.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
            page_size: config.page_size,
            tokens: Mutex::new(HashMap::new()),
            entity_sets: Mutex::new(HashMap::new()),
        })
    }

    fn api_base(&self, candidate: &ConnectionCandidate) -> String {
        format!(
            "{}/api/data/v{}",
            candidate.endpoint.as_str().trim_end_matches('/'),
            self.api_version
        )
    }

    async fn access_token(&self, candidate: &ConnectionCandidate) -> Result<Option<String>> {
        let (client_id, client_secret) = match &candidate.credential {
            Credential::ClientSecret { client_id, client_secret } => (client_id, client_secret),
            Credential::Implicit => return Ok(None),
        };

        let mut tokens = self.tokens.lock().await;
        if let Some(token) = tokens.get(client_id) {
            return Ok(Some(token.clone()));
        }

        let tenant_id = self
            .tenant_id
            .as_deref()
            .ok_or_else(|| CrmTrailError::Config("backend.tenant_id is required for client credentials".into()))?;
        let url = format!("{}/{}/oauth2/v2.0/token", self.authority_host, tenant_id);
        let scope = format!("{}/.default", candidate.endpoint.as_str().trim_end_matches('/'));

        let response = self
            .http_client
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await
            .map_err(|e| CrmTrailError::Connection(format!("Token request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(CrmTrailError::Connection(format!(
                "Token request for client {} rejected with {}",
                client_id,
                response.status()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| CrmTrailError::Connection(format!("Invalid token response: {}", e)))?;
        tokens.insert(client_id.clone(), token.access_token.clone());
        Ok(Some(token.access_token))
    }

    async fn get_json(&self, candidate: &ConnectionCandidate, url: &str, query: &[(&str, &str)]) -> Result<Value> {
        let mut request = self
            .http_client
            .get(url)
            .query(query)
            .header("Accept", "application/json")
            .header("OData-MaxVersion", "4.0")
            .header("OData-Version", "4.0")
            .header("Prefer", "odata.include-annotations=\"*\"");

        if let Some(token) = self.access_token(candidate).await? {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CrmTrailError::Connection(format!("Request to {} failed: {}", url, e)))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(CrmTrailError::Connection(format!(
                "Candidate {} not authorized ({})",
                candidate.index, status
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_else(|_| "Could not read response body".to_string());
            return Err(CrmTrailError::Query(format!("{} responded with {}: {}", url, status, text)));
        }

        response
            .json()
            .await
            .map_err(|e| CrmTrailError::Serialization(format!("Invalid response from {}: {}", url, e)))
    }

    async fn entity_set_name(&self, candidate: &ConnectionCandidate, entity_name: &str) -> Result<String> {
        if let Some(name) = self.entity_sets.lock().await.get(entity_name) {
            return Ok(name.clone());
        }

        let url = format!("{}/EntityDefinitions(LogicalName='{}')", self.api_base(candidate), entity_name);
        let body = self.get_json(candidate, &url, &[("$select", "EntitySetName")]).await?;
        let definition: EntityDefinition = serde_json::from_value(body)?;

        self.entity_sets
            .lock()
            .await
            .insert(entity_name.to_string(), definition.entity_set_name.clone());
        Ok(definition.entity_set_name)
    }
}

#[async_trait]
impl BackendClient for DataverseClient {
    async fn retrieve_multiple(
        &self,
        candidate: &ConnectionCandidate,
        query: &QueryExpression,
    ) -> Result<Vec<BackendRecord>> {
        let entity_set = self.entity_set_name(candidate, &query.entity_name).await?;
        let url = format!("{}/{}", self.api_base(candidate), entity_set);

        let mut records = Vec::new();
        let mut page = 1;
        loop {
            let fetch_xml = if query.top.is_some() {
                query.to_fetch_xml()
            } else {
                query.page(page, self.page_size).to_fetch_xml()
            };
            debug!("{} page {}: {}", query.describe(), page, fetch_xml);

            let body = self.get_json(candidate, &url, &[("fetchXml", fetch_xml.as_str())]).await?;
            let (rows, more) = decode_page(&query.entity_name, &body)?;
            records.extend(rows);

            if query.top.is_some() || !more {
                break;
            }
            page += 1;
        }

        debug!("{} returned {} record(s)", query.describe(), records.len());
        Ok(records)
    }

    async fn retrieve_total_record_count(
        &self,
        candidate: &ConnectionCandidate,
        entity_names: &[String],
    ) -> Result<HashMap<String, u64>> {
        let url = format!("{}/RetrieveTotalRecordCount(EntityNames=@p1)", self.api_base(candidate));
        let names = serde_json::to_string(entity_names)?;
        let body = self.get_json(candidate, &url, &[("@p1", names.as_str())]).await?;

        let response: RecordCountResponse = serde_json::from_value(body)?;
        Ok(response.collection.keys.into_iter().zip(response.collection.values).collect())
    }
}

/// Decode one page of a query response; returns the rows and whether more
/// pages follow
pub fn decode_page(entity_name: &str, body: &Value) -> Result<(Vec<BackendRecord>, bool)> {
    let rows = body
        .get("value")
        .and_then(Value::as_array)
        .ok_or_else(|| CrmTrailError::Serialization("Query response has no 'value' array".into()))?;

    let records = rows
        .iter()
        .filter_map(Value::as_object)
        .map(|row| decode_row(entity_name, row))
        .collect();

    let more = body.get(MORE_RECORDS).and_then(Value::as_bool).unwrap_or(false);
    Ok((records, more))
}

/// Decode one annotated row into a record
pub fn decode_row(entity_name: &str, row: &Map<String, Value>) -> BackendRecord {
    let mut record = BackendRecord::new(entity_name);

    for (key, value) in row {
        if key.contains('@') || value.is_null() {
            continue;
        }

        if let Some((alias, _)) = key.split_once('.') {
            if let Some(inner) = decode_value(key, value, row) {
                record.insert(key.clone(), AttributeValue::aliased(alias, inner));
            }
            continue;
        }

        let name = lookup_attribute(key).unwrap_or(key);
        if let Some(decoded) = decode_value(key, value, row) {
            record.insert(name, decoded);
        }
    }

    record
}

// `_ownerid_value` -> `ownerid`
fn lookup_attribute(key: &str) -> Option<&str> {
    key.strip_prefix('_').and_then(|rest| rest.strip_suffix("_value"))
}

fn decode_value(key: &str, value: &Value, row: &Map<String, Value>) -> Option<AttributeValue> {
    if let Some(entity) = row.get(&format!("{}{}", key, LOOKUP_LOGICAL_NAME)).and_then(Value::as_str) {
        if let Some(id) = value.as_str().and_then(|text| Uuid::parse_str(text).ok()) {
            return Some(AttributeValue::reference(entity, id));
        }
    }

    let formatted = row.get(&format!("{}{}", key, FORMATTED_VALUE)).and_then(Value::as_str);
    match value {
        Value::Null => None,
        Value::String(text) => Some(AttributeValue::plain(text.clone())),
        Value::Number(number) => {
            let code = number.as_i64().and_then(|code| i32::try_from(code).ok());
            match (code, formatted) {
                (Some(code), Some(label)) if is_option_label(code, label) => Some(AttributeValue::choice(code, label)),
                _ => Some(AttributeValue::plain(number.to_string())),
            }
        }
        Value::Bool(flag) => Some(AttributeValue::plain(flag.to_string())),
        other => Some(AttributeValue::plain(other.to_string())),
    }
}

// Whole numbers are formatted too ("1,500"); only a label that is not just the
// number itself marks an option set value.
fn is_option_label(code: i32, label: &str) -> bool {
    let digits: String = label
        .chars()
        .filter(|c| !matches!(c, ',' | '.' | ' ' | '\u{a0}' | '\u{202f}' | '\''))
        .collect();
    digits != code.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_decode_row_types() {
        let owner = "5f0c1b8e-3a8b-4c1d-9a52-0f6e2a7c9d11";
        let record = decode_row(
            "sdkmessageprocessingstep",
            &row(json!({
                "@odata.etag": "W/\"123\"",
                "name": "Contoso.Plugins: Create of account",
                "statecode": 0,
                "statecode@OData.Community.Display.V1.FormattedValue": "Enabled",
                "rank": 1500,
                "rank@OData.Community.Display.V1.FormattedValue": "1,500",
                "stage": 40,
                "_modifiedby_value": owner,
                "_modifiedby_value@Microsoft.Dynamics.CRM.lookuplogicalname": "systemuser",
                "_modifiedby_value@OData.Community.Display.V1.FormattedValue": "Jane Doe",
                "asyncautodelete": false,
                "description": null
            })),
        );

        assert_eq!(record.entity_name, "sdkmessageprocessingstep");
        assert_eq!(record.get("name"), Some(&AttributeValue::plain("Contoso.Plugins: Create of account")));
        assert_eq!(record.get("statecode"), Some(&AttributeValue::choice(0, "Enabled")));
        assert_eq!(record.get("rank"), Some(&AttributeValue::plain("1500")));
        assert_eq!(record.get("stage"), Some(&AttributeValue::plain("40")));
        assert_eq!(
            record.get("modifiedby"),
            Some(&AttributeValue::reference("systemuser", Uuid::parse_str(owner).unwrap()))
        );
        assert_eq!(record.get("asyncautodelete"), Some(&AttributeValue::plain("false")));
        assert!(record.get("description").is_none());
        assert!(record.get("@odata.etag").is_none());
        assert_eq!(record.attributes.len(), 6);
    }

    #[test]
    fn test_decode_aliased_columns() {
        let record = decode_row(
            "workflowlog",
            &row(json!({
                "wf.name": "Approval",
                "wf.statecode": 1,
                "wf.statecode@OData.Community.Display.V1.FormattedValue": "Activated",
                "wf.statecode@OData.Community.Display.V1.AttributeName": "statecode"
            })),
        );

        assert_eq!(
            record.get("wf.statecode"),
            Some(&AttributeValue::aliased("wf", AttributeValue::choice(1, "Activated")))
        );
        assert_eq!(record.get("wf.name"), Some(&AttributeValue::aliased("wf", AttributeValue::plain("Approval"))));
    }

    #[test]
    fn test_decode_page() {
        let body = json!({
            "value": [{"plugintracelogid": "a"}, {"plugintracelogid": "b"}],
            "@Microsoft.Dynamics.CRM.morerecords": true
        });
        let (records, more) = decode_page("plugintracelog", &body).unwrap();
        assert_eq!(records.len(), 2);
        assert!(more);

        let (records, more) = decode_page("plugintracelog", &json!({"value": []})).unwrap();
        assert!(records.is_empty());
        assert!(!more);

        assert!(decode_page("plugintracelog", &json!({"error": {}})).is_err());
    }

    #[test]
    fn test_option_label_detection() {
        assert!(is_option_label(0, "Active"));
        assert!(is_option_label(1, "Yes"));
        assert!(!is_option_label(1500, "1,500"));
        assert!(!is_option_label(1500, "1\u{a0}500"));
        assert!(!is_option_label(7, "7"));
    }
}
