//! Sink side of the pipeline: point formatting, store bootstrap and batch delivery

use async_trait::async_trait;
use gpumon_common::{Batch, StopSignal};

pub mod bootstrap;
pub mod influx;
pub mod point;
pub mod store;
pub mod writer;

pub use bootstrap::{bootstrap, BootstrapPlan, BootstrapReport, PolicyAction};
pub use influx::InfluxClient;
pub use point::Point;
pub use store::{PointStore, RetentionPolicyInfo, RetentionSpec};
pub use writer::{RetryPolicy, SinkWriter, WriteTarget};

/// What happened to one batch. Delivery is best effort and never raises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Written { attempts: u32 },
    Dropped { attempts: u32, reason: String },
    /// Nothing in the batch produced a point; the store was not called.
    Empty,
}

impl DeliveryOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryOutcome::Written { attempts } | DeliveryOutcome::Dropped { attempts, .. } => *attempts,
            DeliveryOutcome::Empty => 0,
        }
    }
}

/// Consumer of one tick's batch, invoked by the scheduler loop before the next tick.
#[async_trait]
pub trait BatchSink: Send {
    /// Pauses between attempts end early when `stop` fires; the batch is then dropped.
    async fn deliver(&mut self, batch: &Batch, stop: &StopSignal) -> DeliveryOutcome;
}
