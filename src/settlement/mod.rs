// Settlement engine: calculation, lifecycle, scheduling and disputes
pub mod dispute;
pub mod events;
pub mod fees;
pub mod models;
pub mod orchestrator;
pub mod query;
pub mod report;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod tax;

#[cfg(test)]
pub(crate) mod fixtures;

pub use dispute::{CreateDisputeRequest, DisputeHandler};
pub use events::{EventPublisher, SettlementEvent};
pub use orchestrator::{CreateSettlementRequest, SettlementOrchestrator};
pub use query::{QueryService, SettlementQuery};
pub use retry::{RetryPolicy, RetryWorker};
pub use scheduler::{SettlementScheduler, UpsertScheduleRequest};
