#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gpumon_common::{GpumonError, Result};
use gpumon_sink::{Point, PointStore, RetentionPolicyInfo, RetentionSpec};

#[derive(Default)]
struct State {
    databases: Vec<String>,
    policies: BTreeMap<String, Vec<RetentionPolicyInfo>>,
    calls: Vec<String>,
    written: Vec<Point>,
    write_failures: VecDeque<GpumonError>,
    fail_all_writes: Option<(String, bool)>,
    fail_listing: bool,
}

/// In-memory store that records every call.
#[derive(Clone, Default)]
pub struct FakeStore(Arc<Mutex<State>>);

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database(self, name: &str) -> Self {
        self.0.lock().unwrap().databases.push(name.to_string());
        self
    }

    pub fn with_policy(self, database: &str, policy: RetentionPolicyInfo) -> Self {
        self.0.lock().unwrap().policies.entry(database.to_string()).or_default().push(policy);
        self
    }

    /// Next writes fail with these errors in order, then succeed.
    pub fn failing_writes(self, errors: Vec<GpumonError>) -> Self {
        self.0.lock().unwrap().write_failures = errors.into();
        self
    }

    pub fn always_failing(self, reason: &str, retryable: bool) -> Self {
        self.0.lock().unwrap().fail_all_writes = Some((reason.to_string(), retryable));
        self
    }

    pub fn unreachable(self) -> Self {
        self.0.lock().unwrap().fail_listing = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn written(&self) -> Vec<Point> {
        self.0.lock().unwrap().written.clone()
    }

    pub fn policies(&self, database: &str) -> Vec<RetentionPolicyInfo> {
        self.0.lock().unwrap().policies.get(database).cloned().unwrap_or_default()
    }

    fn note(&self, call: &str) {
        self.0.lock().unwrap().calls.push(call.to_string());
    }
}

fn info(database_policy: &RetentionSpec) -> RetentionPolicyInfo {
    RetentionPolicyInfo {
        name: database_policy.name.clone(),
        duration: database_policy.duration.literal().to_string(),
        replication: database_policy.replication,
        default: database_policy.default,
    }
}

#[async_trait]
impl PointStore for FakeStore {
    async fn ping(&self) -> Result<()> {
        self.note("ping");
        Ok(())
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        self.note("list_databases");
        let state = self.0.lock().unwrap();
        if state.fail_listing {
            return Err(GpumonError::SinkWriteFailed { reason: "connection refused".into(), retryable: true });
        }
        Ok(state.databases.clone())
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        self.note("create_database");
        self.0.lock().unwrap().databases.push(name.to_string());
        Ok(())
    }

    async fn list_retention_policies(&self, database: &str) -> Result<Vec<RetentionPolicyInfo>> {
        self.note("list_retention_policies");
        Ok(self.policies(database))
    }

    async fn create_retention_policy(&self, database: &str, policy: &RetentionSpec) -> Result<()> {
        self.note("create_retention_policy");
        self.0.lock().unwrap().policies.entry(database.to_string()).or_default().push(info(policy));
        Ok(())
    }

    async fn alter_retention_policy(&self, database: &str, policy: &RetentionSpec) -> Result<()> {
        self.note("alter_retention_policy");
        let mut state = self.0.lock().unwrap();
        let policies = state.policies.entry(database.to_string()).or_default();
        policies.retain(|p| p.name != policy.name);
        policies.push(info(policy));
        Ok(())
    }

    async fn write_points(&self, _database: &str, _rp: Option<&str>, points: &[Point]) -> Result<()> {
        self.note("write_points");
        let mut state = self.0.lock().unwrap();
        if let Some((reason, retryable)) = state.fail_all_writes.clone() {
            return Err(GpumonError::SinkWriteFailed { reason, retryable });
        }
        if let Some(err) = state.write_failures.pop_front() {
            return Err(err);
        }
        state.written.extend_from_slice(points);
        Ok(())
    }
}
