//! Approval progression: transition rules, approver resolution, the engine
//! that ties them to storage, and the idle sweep.

pub mod engine;
pub mod idle;
pub mod resolver;
pub mod transition;

pub use engine::{ApprovalEngine, ApprovalEvent, EngineConfig, DEFAULT_IDLE_DAYS};
pub use idle::IdleSweeper;
pub use resolver::ApproverResolver;
