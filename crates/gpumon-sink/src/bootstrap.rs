//! One-time database and retention-policy setup

use gpumon_common::config::StoreConfig;
use gpumon_common::{GpumonError, Result};
use tracing::info;

use crate::{PointStore, RetentionSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPlan {
    pub database: String,
    pub retention: RetentionSpec,
}

impl BootstrapPlan {
    pub fn from_config(cfg: &StoreConfig) -> Result<Self> {
        Ok(Self {
            database: cfg.database.clone(),
            retention: RetentionSpec {
                name: cfg.retention_policy.clone(),
                duration: cfg.retention()?,
                replication: cfg.replication,
                default: true,
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    Created,
    Altered,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapReport {
    pub created_database: bool,
    pub policy: PolicyAction,
}

/// Makes sure the database and retention policy exist as planned. Running it
/// again against a prepared store issues no create or alter.
pub async fn bootstrap<S: PointStore + ?Sized>(store: &S, plan: &BootstrapPlan) -> Result<BootstrapReport> {
    let failed = |step: &str, e: GpumonError| GpumonError::MetricsRecordingFailed(format!("{step}: {e}"));

    let databases = store.list_databases().await.map_err(|e| failed("listing databases", e))?;
    let created_database = !databases.iter().any(|db| db == &plan.database);
    if created_database {
        store.create_database(&plan.database).await.map_err(|e| failed("creating database", e))?;
        info!(target: "sink", "created database {}", plan.database);
    }

    let desired = &plan.retention;
    let policies = store
        .list_retention_policies(&plan.database)
        .await
        .map_err(|e| failed("listing retention policies", e))?;
    let policy = match policies.iter().find(|p| p.name == desired.name) {
        None => {
            store
                .create_retention_policy(&plan.database, desired)
                .await
                .map_err(|e| failed("creating retention policy", e))?;
            info!(target: "sink", "created retention policy {} ({})", desired.name, desired.duration);
            PolicyAction::Created
        }
        Some(current) if desired.matches(current) => PolicyAction::Unchanged,
        Some(current) => {
            store
                .alter_retention_policy(&plan.database, desired)
                .await
                .map_err(|e| failed("altering retention policy", e))?;
            info!(
                target: "sink",
                "altered retention policy {} from {} x{} to {} x{}",
                desired.name, current.duration, current.replication, desired.duration, desired.replication
            );
            PolicyAction::Altered
        }
    };
    Ok(BootstrapReport { created_database, policy })
}
