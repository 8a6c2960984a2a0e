//! Workflow selection
//!
//! Active definitions are tried in descending priority, ties broken by the
//! lower id. The first definition whose active conditions all hold wins.
//! Definitions without active conditions are only fallbacks: the first one
//! seen is returned when nothing conditioned matches.

use super::definition::WorkflowDefinition;
use crate::models::ProposalAttributes;

/// Pick the workflow for a proposal, or `None` if nothing applies
pub fn select_workflow<'a>(
    definitions: &'a [WorkflowDefinition],
    attrs: &ProposalAttributes,
) -> Option<&'a WorkflowDefinition> {
    let mut ordered: Vec<&WorkflowDefinition> =
        definitions.iter().filter(|d| d.is_active).collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

    let mut fallback = None;
    for definition in ordered {
        if definition.is_default() {
            fallback.get_or_insert(definition);
            continue;
        }
        if definition.active_conditions().all(|c| c.evaluate(attrs)) {
            tracing::debug!(
                workflow_id = definition.id,
                priority = definition.priority,
                "Workflow conditions matched"
            );
            return Some(definition);
        }
    }

    if let Some(default) = fallback {
        tracing::debug!(workflow_id = default.id, "Falling back to default workflow");
    }
    fallback
}
