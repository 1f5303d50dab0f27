use async_trait::async_trait;
use gpumon_common::retention::RetentionDuration;
use gpumon_common::Result;

use crate::Point;

/// A retention policy as the store reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicyInfo {
    pub name: String,
    /// Store form, e.g. `24h0m0s`, or `0s` for infinite.
    pub duration: String,
    pub replication: u32,
    pub default: bool,
}

/// The policy the pipeline wants in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionSpec {
    pub name: String,
    pub duration: RetentionDuration,
    pub replication: u32,
    pub default: bool,
}

impl RetentionSpec {
    pub fn matches(&self, info: &RetentionPolicyInfo) -> bool {
        info.name == self.name
            && self.duration.matches_reported(&info.duration)
            && info.replication == self.replication
            && info.default == self.default
    }
}

/// The time-series store operations the pipeline uses.
///
/// Failures are `SinkWriteFailed` carrying whether a retry may help.
#[async_trait]
pub trait PointStore: Send + Sync {
    async fn ping(&self) -> Result<()>;
    async fn list_databases(&self) -> Result<Vec<String>>;
    async fn create_database(&self, name: &str) -> Result<()>;
    async fn list_retention_policies(&self, database: &str) -> Result<Vec<RetentionPolicyInfo>>;
    async fn create_retention_policy(&self, database: &str, policy: &RetentionSpec) -> Result<()>;
    async fn alter_retention_policy(&self, database: &str, policy: &RetentionSpec) -> Result<()>;
    async fn write_points(&self, database: &str, retention_policy: Option<&str>, points: &[Point]) -> Result<()>;
}
