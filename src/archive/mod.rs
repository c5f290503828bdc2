//! Batch staging and archival

pub mod batch;
pub mod fsops;
pub mod log;
pub mod routing;
pub mod transfer;

pub use batch::{Batch, BatchStatus, StagedBatch};
pub use log::{ClearConfirmation, TransferLog, TransferRecord};
pub use routing::RoutingTable;
pub use transfer::{BatchFailure, PlannedMove, TransferEngine, TransferPlan, TransferReport};
