//! InfluxDB 1.x HTTP API client

use std::time::Duration;

use async_trait::async_trait;
use gpumon_common::config::StoreConfig;
use gpumon_common::{GpumonError, Result};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::{Point, PointStore, RetentionPolicyInfo, RetentionSpec};

pub struct InfluxClient {
    http: Client,
    base_url: String,
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<Series>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

impl Series {
    fn cell<'a>(&self, row: &'a [Value], column: &str) -> Option<&'a Value> {
        self.columns.iter().position(|c| c == column).and_then(|i| row.get(i))
    }
}

impl InfluxClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| GpumonError::MetricsRecordingFailed(format!("cannot build http client: {e}")))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { http, base_url, username: String::new(), password: String::new() })
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn from_config(cfg: &StoreConfig) -> Result<Self> {
        Ok(Self::new(cfg.base_url(), cfg.request_timeout())?.with_credentials(&cfg.username, &cfg.password))
    }

    /// Builds the client and pings the store. Any failure means the pipeline cannot start.
    pub async fn connect(cfg: &StoreConfig) -> Result<Self> {
        let client = Self::from_config(cfg)?;
        client
            .ping()
            .await
            .map_err(|e| GpumonError::MetricsRecordingFailed(format!("cannot reach store at {}: {e}", client.base_url)))?;
        info!(target: "sink", "connected to {}", client.base_url);
        Ok(client)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        if self.username.is_empty() {
            req
        } else {
            req.basic_auth(&self.username, Some(&self.password))
        }
    }

    async fn query(&self, statement: &str, database: Option<&str>) -> Result<Vec<Series>> {
        debug!(target: "sink", "query: {statement}");
        let mut form = vec![("q", statement)];
        if let Some(db) = database {
            form.push(("db", db));
        }
        let resp = self
            .authed(self.http.post(format!("{}/query", self.base_url)))
            .form(&form)
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        let body = resp.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        let parsed: QueryResponse = serde_json::from_str(&body).map_err(|e| GpumonError::SinkWriteFailed {
            reason: format!("unreadable query response: {e}"),
            retryable: false,
        })?;
        if let Some(reason) = parsed.error {
            return Err(GpumonError::SinkWriteFailed { reason, retryable: false });
        }
        let mut series = Vec::new();
        for result in parsed.results {
            if let Some(reason) = result.error {
                return Err(GpumonError::SinkWriteFailed { reason, retryable: false });
            }
            series.extend(result.series);
        }
        Ok(series)
    }
}

#[async_trait]
impl PointStore for InfluxClient {
    async fn ping(&self) -> Result<()> {
        let resp = self
            .authed(self.http.get(format!("{}/ping", self.base_url)))
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error(status, &resp.text().await.unwrap_or_default()))
        }
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let series = self.query("SHOW DATABASES", None).await?;
        Ok(series
            .iter()
            .flat_map(|s| s.values.iter().filter_map(|row| s.cell(row, "name")?.as_str().map(str::to_string)))
            .collect())
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        self.query(&format!("CREATE DATABASE {}", quote_ident(name)), None).await.map(drop)
    }

    async fn list_retention_policies(&self, database: &str) -> Result<Vec<RetentionPolicyInfo>> {
        let series = self.query(&format!("SHOW RETENTION POLICIES ON {}", quote_ident(database)), None).await?;
        let mut policies = Vec::new();
        for s in &series {
            for row in &s.values {
                let Some(name) = s.cell(row, "name").and_then(Value::as_str) else { continue };
                policies.push(RetentionPolicyInfo {
                    name: name.to_string(),
                    duration: s.cell(row, "duration").and_then(Value::as_str).unwrap_or_default().to_string(),
                    replication: s.cell(row, "replicaN").and_then(Value::as_u64).unwrap_or(1) as u32,
                    default: s.cell(row, "default").and_then(Value::as_bool).unwrap_or(false),
                });
            }
        }
        Ok(policies)
    }

    async fn create_retention_policy(&self, database: &str, policy: &RetentionSpec) -> Result<()> {
        self.query(&policy_statement("CREATE", database, policy), None).await.map(drop)
    }

    async fn alter_retention_policy(&self, database: &str, policy: &RetentionSpec) -> Result<()> {
        self.query(&policy_statement("ALTER", database, policy), None).await.map(drop)
    }

    async fn write_points(&self, database: &str, retention_policy: Option<&str>, points: &[Point]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let body = points.iter().map(Point::to_line).collect::<Vec<_>>().join("\n");
        let mut params = vec![("db", database), ("precision", "s")];
        if let Some(rp) = retention_policy {
            params.push(("rp", rp));
        }
        let resp = self
            .authed(self.http.post(format!("{}/write", self.base_url)))
            .query(&params)
            .body(body)
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        if status.is_success() {
            debug!(target: "sink", "wrote {} point(s) to {database}", points.len());
            Ok(())
        } else {
            Err(status_error(status, &resp.text().await.unwrap_or_default()))
        }
    }
}

fn policy_statement(verb: &str, database: &str, policy: &RetentionSpec) -> String {
    let mut statement = format!(
        "{verb} RETENTION POLICY {} ON {} DURATION {} REPLICATION {}",
        quote_ident(&policy.name),
        quote_ident(database),
        policy.duration.literal(),
        policy.replication
    );
    if policy.default {
        statement.push_str(" DEFAULT");
    }
    statement
}

/// Double-quoted InfluxQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Server errors, throttling and request timeouts may clear up; other statuses will not.
fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT
}

fn status_error(status: StatusCode, body: &str) -> GpumonError {
    let detail = serde_json::from_str::<QueryResponse>(body)
        .ok()
        .and_then(|r| r.error)
        .unwrap_or_else(|| body.trim().to_string());
    GpumonError::SinkWriteFailed { reason: format!("{status}: {detail}"), retryable: is_retryable_status(status) }
}

fn transport_error(e: reqwest::Error) -> GpumonError {
    let retryable = !(e.is_builder() || e.is_decode() || e.is_redirect());
    GpumonError::SinkWriteFailed { reason: e.to_string(), retryable }
}
