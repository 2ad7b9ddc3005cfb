//! Plan generation: diff an assembled template against the recorded stack.

use super::state;
use super::types::{ExecutionPlan, PlanAction, PlannedChange, StackLock};

/// Compare every resource of `template` with `lock`. Resources recorded in
/// the lock but missing from the template are planned for deletion.
pub fn plan(
    stack: &str,
    template: &serde_json::Value,
    lock: Option<&StackLock>,
) -> Result<ExecutionPlan, String> {
    let desired = state::resource_hashes(template)?;
    let mut changes = Vec::new();
    let mut to_create = 0u32;
    let mut to_update = 0u32;
    let mut to_delete = 0u32;
    let mut unchanged = 0u32;

    for (name, resource) in &desired {
        let action = match lock.and_then(|l| l.resources.get(name)) {
            None => PlanAction::Create,
            Some(recorded) if recorded.hash == resource.hash => PlanAction::NoOp,
            Some(_) => PlanAction::Update,
        };
        match action {
            PlanAction::Create => to_create += 1,
            PlanAction::Update => to_update += 1,
            PlanAction::NoOp => unchanged += 1,
            PlanAction::Delete => {}
        }
        changes.push(PlannedChange {
            logical_name: name.clone(),
            resource_type: resource.resource_type.clone(),
            action,
        });
    }

    if let Some(lock) = lock {
        for (name, recorded) in &lock.resources {
            if !desired.contains_key(name) {
                to_delete += 1;
                changes.push(PlannedChange {
                    logical_name: name.clone(),
                    resource_type: recorded.resource_type.clone(),
                    action: PlanAction::Delete,
                });
            }
        }
    }

    Ok(ExecutionPlan {
        stack: stack.to_string(),
        changes,
        to_create,
        to_update,
        to_delete,
        unchanged,
    })
}

/// One line per change.
pub fn describe_change(change: &PlannedChange) -> String {
    format!(
        "{:>7}  {} ({})",
        change.action.to_string(),
        change.logical_name,
        change.resource_type
    )
}
