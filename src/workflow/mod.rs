//! Workflow definitions and the selection of the chain a proposal follows

pub mod condition;
pub mod definition;
pub mod selector;

pub use condition::{Condition, ConditionField, ConditionRule, Operator};
pub use definition::{ApproverGroup, LocationScope, Stage, WorkflowDefinition};
pub use selector::select_workflow;
