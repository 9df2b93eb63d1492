//! PostgREST-style assignment store over HTTP with revision-guarded writes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use tap_core::{DispatchKey, DispatchRecord, PersistedAssignment};
use tracing::debug;
use uuid::Uuid;

use crate::assignments::{AssignmentStore, InsertResult};
use crate::http::{FetchError, HttpClient, HttpClientConfig};
use crate::{BackoffPolicy, StoreError, StoreResult};

const ASSIGNMENTS: &str = "assignments";
const DISPATCHES: &str = "dispatch_records";

#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl RestStoreConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            timeout: Duration::from_secs(15),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

/// Row shape of `dispatch_records`: the record plus its flattened unique key.
#[derive(Debug, Serialize, Deserialize)]
struct DispatchRow {
    dispatch_key: String,
    #[serde(flatten)]
    record: DispatchRecord,
}

pub fn dispatch_key_string(key: &DispatchKey) -> String {
    format!(
        "{}:{}:{}:{}",
        key.assignment_id,
        key.record_id,
        key.channel.as_str(),
        key.recipient.as_deref().unwrap_or("-")
    )
}

#[derive(Debug)]
pub struct RestAssignmentStore {
    base_url: String,
    api_key: Option<String>,
    http: HttpClient,
}

impl RestAssignmentStore {
    pub fn new(config: RestStoreConfig) -> anyhow::Result<Self> {
        let http = HttpClient::new(HttpClientConfig {
            timeout: config.timeout,
            user_agent: Some(format!("{}/{}", crate::CRATE_NAME, env!("CARGO_PKG_VERSION"))),
            backoff: config.backoff,
            ..HttpClientConfig::default()
        })?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            http,
        })
    }

    fn request(&self, client: &reqwest::Client, method: Method, table: &str) -> RequestBuilder {
        let mut builder = client
            .request(method, format!("{}/{}", self.base_url, table))
            .header("Accept", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header("apikey", key).bearer_auth(key);
        }
        builder
    }

    fn select_assignments(
        &self,
        client: &reqwest::Client,
        filters: &[(&str, String)],
    ) -> RequestBuilder {
        self.request(client, Method::GET, ASSIGNMENTS)
            .query(&[("select", "*")])
            .query(filters)
    }

    fn update_request(
        &self,
        client: &reqwest::Client,
        next: &PersistedAssignment,
        expected_revision: u64,
    ) -> RequestBuilder {
        self.request(client, Method::PATCH, ASSIGNMENTS)
            .query(&[
                ("assignment_id", format!("eq.{}", next.assignment_id)),
                ("revision", format!("eq.{expected_revision}")),
            ])
            .header("Prefer", "return=representation")
            .json(next)
    }

    async fn fetch_assignments(
        &self,
        filters: Vec<(&str, String)>,
    ) -> StoreResult<Vec<PersistedAssignment>> {
        let resp = self
            .http
            .send(|client| self.select_assignments(client, &filters))
            .await?;
        Ok(resp.json()?)
    }

    async fn fetch_dispatches(&self, filters: Vec<(&str, String)>) -> StoreResult<Vec<DispatchRecord>> {
        let resp = self
            .http
            .send(|client| {
                self.request(client, Method::GET, DISPATCHES)
                    .query(&[("select", "*")])
                    .query(&filters)
            })
            .await?;
        let rows: Vec<DispatchRow> = resp.json()?;
        Ok(rows.into_iter().map(|row| row.record).collect())
    }
}

#[async_trait]
impl AssignmentStore for RestAssignmentStore {
    async fn find_open_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> StoreResult<Option<PersistedAssignment>> {
        let rows = self
            .fetch_assignments(vec![
                ("fingerprint", format!("eq.{fingerprint}")),
                ("status", "eq.open".to_string()),
                ("order", "first_seen_at.asc".to_string()),
                ("limit", "1".to_string()),
            ])
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> StoreResult<Option<PersistedAssignment>> {
        let rows = self
            .fetch_assignments(vec![
                ("external_id", format!("eq.{external_id}")),
                ("order", "last_seen_at.desc".to_string()),
                ("limit", "1".to_string()),
            ])
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn get_assignment(
        &self,
        assignment_id: Uuid,
    ) -> StoreResult<Option<PersistedAssignment>> {
        let rows = self
            .fetch_assignments(vec![("assignment_id", format!("eq.{assignment_id}"))])
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn list_open(&self) -> StoreResult<Vec<PersistedAssignment>> {
        self.fetch_assignments(vec![
            ("status", "eq.open".to_string()),
            ("order", "first_seen_at.asc".to_string()),
        ])
        .await
    }

    async fn find_by_source(&self, source_id: &str) -> StoreResult<Vec<PersistedAssignment>> {
        self.fetch_assignments(vec![("source_ids", format!("cs.{{\"{source_id}\"}}"))])
            .await
    }

    async fn insert_assignment(
        &self,
        assignment: &PersistedAssignment,
    ) -> StoreResult<InsertResult> {
        let result = self
            .http
            .send(|client| {
                self.request(client, Method::POST, ASSIGNMENTS)
                    .header("Prefer", "return=representation")
                    .json(assignment)
            })
            .await;

        match result {
            Ok(resp) => {
                let mut rows: Vec<PersistedAssignment> = resp.json()?;
                rows.pop()
                    .map(InsertResult::Inserted)
                    .ok_or_else(|| StoreError::InvalidRow("insert returned no row".to_string()))
            }
            // Unique index on open fingerprints / external ids.
            Err(FetchError::HttpStatus { status: 409, .. }) => {
                debug!(fingerprint = %assignment.fingerprint, "insert lost race, re-reading");
                if let Some(external_id) = &assignment.external_id {
                    if let Some(existing) = self.find_by_external_id(external_id).await? {
                        if existing.is_open() {
                            return Ok(InsertResult::Exists(existing));
                        }
                    }
                }
                self.find_open_by_fingerprint(&assignment.fingerprint)
                    .await?
                    .map(InsertResult::Exists)
                    .ok_or_else(|| {
                        StoreError::Conflict(format!(
                            "insert conflict without visible row for {}",
                            assignment.fingerprint
                        ))
                    })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update_assignment(
        &self,
        assignment: &PersistedAssignment,
        expected_revision: u64,
    ) -> StoreResult<PersistedAssignment> {
        let mut next = assignment.clone();
        next.revision = expected_revision + 1;
        let resp = self
            .http
            .send(|client| self.update_request(client, &next, expected_revision))
            .await?;
        let mut rows: Vec<PersistedAssignment> = resp.json()?;
        rows.pop().ok_or_else(|| {
            StoreError::Conflict(format!(
                "assignment {} no longer at revision {expected_revision}",
                assignment.assignment_id
            ))
        })
    }

    async fn get_dispatch(&self, key: &DispatchKey) -> StoreResult<Option<DispatchRecord>> {
        let rows = self
            .fetch_dispatches(vec![("dispatch_key", format!("eq.{}", dispatch_key_string(key)))])
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn put_dispatch(&self, record: &DispatchRecord) -> StoreResult<()> {
        let row = DispatchRow {
            dispatch_key: dispatch_key_string(&record.key()),
            record: record.clone(),
        };
        self.http
            .send(|client| {
                self.request(client, Method::POST, DISPATCHES)
                    .query(&[("on_conflict", "dispatch_key")])
                    .header("Prefer", "resolution=merge-duplicates,return=minimal")
                    .json(&row)
            })
            .await?;
        Ok(())
    }

    async fn dispatches_for(&self, assignment_id: Uuid) -> StoreResult<Vec<DispatchRecord>> {
        self.fetch_dispatches(vec![("assignment_id", format!("eq.{assignment_id}"))])
            .await
    }

    async fn dispatches_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<DispatchRecord>> {
        self.fetch_dispatches(vec![
            ("updated_at", format!("gte.{}", since.to_rfc3339())),
            ("order", "created_at.asc".to_string()),
        ])
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tap_core::DispatchChannel;

    fn store() -> RestAssignmentStore {
        RestAssignmentStore::new(RestStoreConfig::new("http://store.local/rest/v1/").with_api_key("k"))
            .expect("store")
    }

    #[test]
    fn dispatch_keys_are_stable_strings() {
        let key = DispatchKey {
            assignment_id: Uuid::nil(),
            record_id: Uuid::nil(),
            channel: DispatchChannel::Notify,
            recipient: Some("u42".into()),
        };
        assert_eq!(
            dispatch_key_string(&key),
            "00000000-0000-0000-0000-000000000000:00000000-0000-0000-0000-000000000000:notify:u42"
        );
        let broadcast = DispatchKey {
            recipient: None,
            channel: DispatchChannel::Broadcast,
            ..key
        };
        assert!(dispatch_key_string(&broadcast).ends_with(":broadcast:-"));
    }

    #[test]
    fn updates_are_guarded_by_revision() {
        let store = store();
        let client = reqwest::Client::new();
        let mut assignment = sample();
        assignment.revision = 4;
        let request = store
            .update_request(&client, &assignment, 3)
            .build()
            .expect("request");
        assert_eq!(request.method(), Method::PATCH);
        let url = request.url().as_str();
        assert!(url.starts_with("http://store.local/rest/v1/assignments?"));
        assert!(url.contains("revision=eq.3"));
        assert!(url.contains(&format!("assignment_id=eq.{}", assignment.assignment_id)));
        assert_eq!(
            request.headers().get("apikey").and_then(|v| v.to_str().ok()),
            Some("k")
        );
    }

    #[test]
    fn fingerprint_lookup_filters_open_rows() {
        let store = store();
        let client = reqwest::Client::new();
        let request = store
            .select_assignments(
                &client,
                &[
                    ("fingerprint", "eq.abc".to_string()),
                    ("status", "eq.open".to_string()),
                ],
            )
            .build()
            .expect("request");
        let query = request.url().query().unwrap_or_default().to_string();
        assert!(query.contains("fingerprint=eq.abc"));
        assert!(query.contains("status=eq.open"));
    }

    fn sample() -> PersistedAssignment {
        use tap_core::{AssignmentFields, CanonicalRecord, ConfidenceMeta, PipelineVersion};
        let version = PipelineVersion::new("v1");
        let record = CanonicalRecord {
            record_id: CanonicalRecord::record_id_for("S1", &version, 0),
            job_id: Uuid::new_v4(),
            source_id: "S1".into(),
            channel_id: "c".into(),
            pipeline_version: version,
            generation: 0,
            observed_at: Utc::now(),
            created_at: Utc::now(),
            external_id: None,
            fields: AssignmentFields::default(),
            quality_score: 0.5,
            fingerprint: "abc".into(),
            violations: Vec::new(),
            confidence: ConfidenceMeta::default(),
        };
        PersistedAssignment::from_record(&record, Utc::now())
    }
}
