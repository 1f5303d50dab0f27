//! Record parsing, pipeline stages and the sampling scheduler

pub mod parser;
pub mod pipeline;
pub mod scheduler;

pub use parser::{parse_line, ParseRejection, MIN_COLUMNS};
pub use pipeline::{parse_log, parse_raw_batch, MonotonicGuard, ParsedBatch, Rejected};
pub use scheduler::{Scheduler, SchedulerHandle, SchedulerState};
