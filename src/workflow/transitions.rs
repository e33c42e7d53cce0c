//! Transition tables.

use super::{WorkflowState, WorkflowType};
use WorkflowState::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: WorkflowState,
    pub action: &'static str,
    pub to: WorkflowState,
}

const fn t(from: WorkflowState, action: &'static str, to: WorkflowState) -> Transition {
    Transition { from, action, to }
}

pub const EMAIL_COMPOSE: &[Transition] = &[
    t(Drafting, "draft_ready", Reviewing),
    t(Reviewing, "approve", AwaitingApproval),
    t(Reviewing, "revise", Drafting),
    t(AwaitingApproval, "send", Completed),
    t(AwaitingApproval, "revise", Drafting),
];

pub const TASK_REVIEW: &[Transition] = &[
    t(Collecting, "collected", Reviewing),
    t(Reviewing, "next", Reviewing),
    t(Reviewing, "finish", Summarizing),
    t(Summarizing, "deliver", Completed),
];

pub const DIGEST_BUILD: &[Transition] = &[
    t(Collecting, "collected", Summarizing),
    t(Summarizing, "summarized", Delivering),
    t(Delivering, "delivered", Completed),
    t(Delivering, "retry", Summarizing),
];

/// Valid from any non-terminal state of any workflow type.
pub const UNIVERSAL: &[(&str, WorkflowState)] =
    &[("cancel", Cancelled), ("fail", Failed), ("complete", Completed)];

pub fn table(workflow_type: WorkflowType) -> &'static [Transition] {
    match workflow_type {
        WorkflowType::EmailCompose => EMAIL_COMPOSE,
        WorkflowType::TaskReview => TASK_REVIEW,
        WorkflowType::DigestBuild => DIGEST_BUILD,
    }
}

pub fn initial_state(workflow_type: WorkflowType) -> WorkflowState {
    match workflow_type {
        WorkflowType::EmailCompose => Drafting,
        WorkflowType::TaskReview | WorkflowType::DigestBuild => Collecting,
    }
}

/// Canonical action name: lowercase, underscores, common phrasings mapped.
pub fn normalize_action(action: &str) -> String {
    let canonical = action
        .trim()
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    match canonical.as_str() {
        "looks_good" | "approved" | "lgtm" => "approve".to_string(),
        "send_it" | "sent" => "send".to_string(),
        "next_step" | "next_one" => "next".to_string(),
        "done" | "finished" => "finish".to_string(),
        "draft_is_ready" => "draft_ready".to_string(),
        "stop" | "abort" | "cancelled" => "cancel".to_string(),
        _ => canonical,
    }
}

/// Target state for `action` from `from`, or `None` if unmapped.
pub fn next_state(
    workflow_type: WorkflowType,
    from: WorkflowState,
    action: &str,
) -> Option<WorkflowState> {
    if from.is_terminal() {
        return None;
    }
    if let Some((_, to)) = UNIVERSAL.iter().find(|(a, _)| *a == action) {
        return Some(*to);
    }
    table(workflow_type)
        .iter()
        .find(|tr| tr.from == from && tr.action == action)
        .map(|tr| tr.to)
}

pub fn actions_from(workflow_type: WorkflowType, from: WorkflowState) -> Vec<&'static str> {
    if from.is_terminal() {
        return Vec::new();
    }
    table(workflow_type)
        .iter()
        .filter(|tr| tr.from == from)
        .map(|tr| tr.action)
        .chain(UNIVERSAL.iter().map(|(a, _)| *a))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_compose_happy_path() {
        let ty = WorkflowType::EmailCompose;
        let mut state = initial_state(ty);
        for action in ["draft_ready", "approve", "send"] {
            state = next_state(ty, state, action).unwrap();
        }
        assert_eq!(state, Completed);
    }

    #[test]
    fn test_revise_loops_back() {
        let ty = WorkflowType::EmailCompose;
        assert_eq!(next_state(ty, AwaitingApproval, "revise"), Some(Drafting));
        assert_eq!(next_state(ty, Reviewing, "revise"), Some(Drafting));
        assert_eq!(next_state(ty, Drafting, "send"), None);
    }

    #[test]
    fn test_task_review_next_self_loop() {
        assert_eq!(
            next_state(WorkflowType::TaskReview, Reviewing, "next"),
            Some(Reviewing)
        );
    }

    #[test]
    fn test_digest_retry() {
        assert_eq!(
            next_state(WorkflowType::DigestBuild, Delivering, "retry"),
            Some(Summarizing)
        );
    }

    #[test]
    fn test_universal_actions() {
        for ty in [WorkflowType::EmailCompose, WorkflowType::TaskReview, WorkflowType::DigestBuild] {
            let start = initial_state(ty);
            assert_eq!(next_state(ty, start, "cancel"), Some(Cancelled));
            assert_eq!(next_state(ty, start, "fail"), Some(Failed));
            assert_eq!(next_state(ty, start, "complete"), Some(Completed));
            assert_eq!(next_state(ty, Completed, "cancel"), None);
        }
    }

    #[test]
    fn test_every_table_target_is_reachable_state() {
        for ty in [WorkflowType::EmailCompose, WorkflowType::TaskReview, WorkflowType::DigestBuild] {
            for tr in table(ty) {
                assert!(!tr.from.is_terminal(), "{:?} has a terminal source", ty);
            }
        }
    }

    #[test]
    fn test_normalize_action() {
        assert_eq!(normalize_action("Draft Ready"), "draft_ready");
        assert_eq!(normalize_action("looks good"), "approve");
        assert_eq!(normalize_action("send-it"), "send");
        assert_eq!(normalize_action("  next  "), "next");
    }

    #[test]
    fn test_actions_from() {
        let actions = actions_from(WorkflowType::EmailCompose, Reviewing);
        assert_eq!(actions, vec!["approve", "revise", "cancel", "fail", "complete"]);
        assert!(actions_from(WorkflowType::EmailCompose, Failed).is_empty());
    }
}
