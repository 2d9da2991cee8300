/*
[INPUT]:  Public API exports for perpmaker-engine crate
[OUTPUT]: Module declarations and public re-exports
[POS]:    Crate root - library entry point
[UPDATE]: When adding new modules or public exports
*/

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod imbalance;
pub mod plan;
pub mod rate_limit;
pub mod reconcile;
pub mod snapshot;
pub mod stops;
pub mod trade_log;

// Re-export main types for convenience
pub use config::{EngineConfig, QuoteMode};
pub use engine::MakerEngine;
pub use plan::{make_order_plan, DesiredOrder, OrderPlan};
pub use rate_limit::{CycleDecision, RateLimitController};
pub use reconcile::reconcile_orphaned_position;
pub use snapshot::EngineSnapshot;
