// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Table-driven status transitions.
//!
//! Every action has one [`ActionRule`] row. The same table drives dispatch
//! admission, callback reconciliation and restore-time garbage collection.
//!
//! | action      | dispatchable from             | in progress   | callback from            | success    |
//! |-------------|-------------------------------|---------------|--------------------------|------------|
//! | create      | (absent), terminated, failed  | creating      | creating, starting       | running    |
//! | start       | stopped                       | starting      | starting                 | running    |
//! | stop        | running                       | stopping      | stopping, running        | stopped    |
//! | terminate   | running, stopped, failed      | terminating   | terminating              | terminated |
//! | configure   | configuring, running          | configuring   | configuring              | running    |
//! | reconfigure | running                       | reconfiguring | reconfiguring, running   | running    |
//!
//! A successful computational CREATE lands in `configuring` and requests a
//! configure follow-up instead of going straight to `running`.

use crate::error::EngineError;
use crate::model::{ActionKind, ResourceKey, ResourceKind, UserInstanceStatus};
use crate::result_parser::{CallbackResult, ReportedStatus};

use UserInstanceStatus::*;

/// One row of the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionRule {
    pub action: ActionKind,
    /// Whether the action may be dispatched for a resource with no record yet.
    pub dispatchable_when_absent: bool,
    pub dispatchable_from: &'static [UserInstanceStatus],
    /// Status set when the action is dispatched.
    pub in_progress: UserInstanceStatus,
    /// Statuses from which a callback for this action is still applied.
    pub callback_from: &'static [UserInstanceStatus],
    pub success: UserInstanceStatus,
}

static RULES: [ActionRule; 6] = [
    ActionRule {
        action: ActionKind::Create,
        dispatchable_when_absent: true,
        dispatchable_from: &[Terminated, Failed],
        in_progress: Creating,
        callback_from: &[Creating, Starting],
        success: Running,
    },
    ActionRule {
        action: ActionKind::Start,
        dispatchable_when_absent: false,
        dispatchable_from: &[Stopped],
        in_progress: Starting,
        callback_from: &[Starting],
        success: Running,
    },
    ActionRule {
        action: ActionKind::Stop,
        dispatchable_when_absent: false,
        dispatchable_from: &[Running],
        in_progress: Stopping,
        callback_from: &[Stopping, Running],
        success: Stopped,
    },
    ActionRule {
        action: ActionKind::Terminate,
        dispatchable_when_absent: false,
        dispatchable_from: &[Running, Stopped, Failed],
        in_progress: Terminating,
        callback_from: &[Terminating],
        success: Terminated,
    },
    ActionRule {
        action: ActionKind::Configure,
        dispatchable_when_absent: false,
        dispatchable_from: &[Configuring, Running],
        in_progress: Configuring,
        callback_from: &[Configuring],
        success: Running,
    },
    ActionRule {
        action: ActionKind::Reconfigure,
        dispatchable_when_absent: false,
        dispatchable_from: &[Running],
        in_progress: Reconfiguring,
        callback_from: &[Reconfiguring],
        success: Running,
    },
];

/// Look up the table row for an action.
pub fn rule(action: ActionKind) -> &'static ActionRule {
    let index = match action {
        ActionKind::Create => 0,
        ActionKind::Start => 1,
        ActionKind::Stop => 2,
        ActionKind::Terminate => 3,
        ActionKind::Configure => 4,
        ActionKind::Reconfigure => 5,
    };
    &RULES[index]
}

impl ActionRule {
    /// Whether a new dispatch of this action is admitted given the current status.
    pub fn admits(&self, current: Option<UserInstanceStatus>) -> bool {
        match current {
            None => self.dispatchable_when_absent,
            Some(status) => self.dispatchable_from.contains(&status),
        }
    }
}

/// Action requested as a consequence of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    /// Post-create configuration.
    Configure,
}

/// How the reported result was classified.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded,
    Failed,
    /// Reported status does not fit the action; mapped to `failed`.
    Incompatible(EngineError),
}

/// A status change to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub status: UserInstanceStatus,
    pub follow_up: Option<FollowUp>,
    pub outcome: Outcome,
}

/// Result of reconciling a callback with the current status.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Apply(Transition),
    /// The resource has moved on; the callback is dropped.
    Stale { current: UserInstanceStatus },
}

/// Compute the status a callback moves the resource to.
pub fn next_status(
    current: UserInstanceStatus,
    resource: &ResourceKey,
    resource_kind: ResourceKind,
    action: ActionKind,
    result: &CallbackResult,
) -> Decision {
    let rule = rule(action);
    if !rule.callback_from.contains(&current) {
        return Decision::Stale { current };
    }

    let outcome = match &result.reported {
        ReportedStatus::Succeeded => Outcome::Succeeded,
        ReportedStatus::Status(status) if *status == rule.success => Outcome::Succeeded,
        ReportedStatus::Failed | ReportedStatus::Status(Failed) => Outcome::Failed,
        reported => Outcome::Incompatible(EngineError::IncompatibleTransition {
            resource: resource.to_string(),
            action: action.to_string(),
            reported: reported.to_string(),
        }),
    };

    let transition = match outcome {
        Outcome::Succeeded
            if action == ActionKind::Create
                && resource_kind == ResourceKind::Computational
                && rule.success == Running =>
        {
            Transition {
                status: Configuring,
                follow_up: Some(FollowUp::Configure),
                outcome,
            }
        }
        Outcome::Succeeded => Transition {
            status: rule.success,
            follow_up: None,
            outcome,
        },
        Outcome::Failed | Outcome::Incompatible(_) => Transition {
            status: Failed,
            follow_up: None,
            outcome,
        },
    };
    Decision::Apply(transition)
}

/// Whether a handler for `action` can still be answered given the resource's status.
///
/// A missing record still awaits the callback when the action may be
/// dispatched for an absent resource: dispatch registers the handler before
/// it writes the first record. A resource already at the action's success
/// status does not.
pub fn awaits_callback(action: ActionKind, current: Option<UserInstanceStatus>) -> bool {
    let rule = rule(action);
    match current {
        None => rule.dispatchable_when_absent,
        Some(status) => status != rule.success && rule.callback_from.contains(&status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ResourceKey {
        ResourceKey::computational("alice", "nb1", "spark")
    }

    fn reported(reported: ReportedStatus) -> CallbackResult {
        CallbackResult {
            reported,
            instance_id: None,
            host_id: None,
            urls: Vec::new(),
            error_message: None,
            result: None,
        }
    }

    fn applied(decision: Decision) -> Transition {
        match decision {
            Decision::Apply(transition) => transition,
            Decision::Stale { current } => panic!("unexpected stale decision from {}", current),
        }
    }

    #[test]
    fn test_every_action_has_a_rule() {
        for action in [
            ActionKind::Create,
            ActionKind::Start,
            ActionKind::Stop,
            ActionKind::Terminate,
            ActionKind::Configure,
            ActionKind::Reconfigure,
        ] {
            let rule = rule(action);
            assert_eq!(rule.action, action);
            assert!(rule.in_progress.is_in_progress());
            assert!(rule.callback_from.contains(&rule.in_progress));
            // A callback must never be applied from the status it produces
            assert!(!rule.callback_from.contains(&rule.success));
        }
    }

    #[test]
    fn test_computational_create_running_requests_configure() {
        let t = applied(next_status(
            Creating,
            &key(),
            ResourceKind::Computational,
            ActionKind::Create,
            &reported(ReportedStatus::Status(Running)),
        ));
        assert_eq!(t.status, Configuring);
        assert_eq!(t.follow_up, Some(FollowUp::Configure));
        assert_eq!(t.outcome, Outcome::Succeeded);
    }

    #[test]
    fn test_exploratory_create_success_goes_running() {
        let t = applied(next_status(
            Creating,
            &key(),
            ResourceKind::Exploratory,
            ActionKind::Create,
            &reported(ReportedStatus::Succeeded),
        ));
        assert_eq!(t.status, Running);
        assert_eq!(t.follow_up, None);
    }

    #[test]
    fn test_create_failure_is_terminal_without_follow_up() {
        for failure in [ReportedStatus::Failed, ReportedStatus::Status(Failed)] {
            let t = applied(next_status(
                Creating,
                &key(),
                ResourceKind::Computational,
                ActionKind::Create,
                &reported(failure),
            ));
            assert_eq!(t.status, Failed);
            assert_eq!(t.follow_up, None);
            assert_eq!(t.outcome, Outcome::Failed);
        }
    }

    #[test]
    fn test_stop_and_terminate_success() {
        let stop = applied(next_status(
            Running,
            &key(),
            ResourceKind::Exploratory,
            ActionKind::Stop,
            &reported(ReportedStatus::Succeeded),
        ));
        assert_eq!(stop.status, Stopped);

        let terminate = applied(next_status(
            Terminating,
            &key(),
            ResourceKind::Computational,
            ActionKind::Terminate,
            &reported(ReportedStatus::Status(Terminated)),
        ));
        assert_eq!(terminate.status, Terminated);
    }

    #[test]
    fn test_unrecognized_status_fails_safe() {
        let t = applied(next_status(
            Starting,
            &key(),
            ResourceKind::Exploratory,
            ActionKind::Start,
            &reported(ReportedStatus::Unrecognized("weird".to_string())),
        ));
        assert_eq!(t.status, Failed);
        assert!(matches!(t.outcome, Outcome::Incompatible(_)));
    }

    #[test]
    fn test_mismatched_reported_status_is_incompatible() {
        let t = applied(next_status(
            Creating,
            &key(),
            ResourceKind::Exploratory,
            ActionKind::Create,
            &reported(ReportedStatus::Status(Stopped)),
        ));
        assert_eq!(t.status, Failed);
        match t.outcome {
            Outcome::Incompatible(err) => {
                assert_eq!(err.error_code(), "INCOMPATIBLE_TRANSITION");
                assert!(err.to_string().contains("stopped"));
                assert!(err.to_string().contains("alice/nb1/spark"));
            }
            other => panic!("expected incompatible outcome, got {:?}", other),
        }
    }

    #[test]
    fn test_callback_for_resolved_resource_is_stale() {
        let decision = next_status(
            Configuring,
            &key(),
            ResourceKind::Computational,
            ActionKind::Create,
            &reported(ReportedStatus::Status(Running)),
        );
        assert_eq!(
            decision,
            Decision::Stale {
                current: Configuring
            }
        );
    }

    #[test]
    fn test_same_input_same_output() {
        let result = reported(ReportedStatus::Status(Running));
        let decide = || {
            next_status(
                Creating,
                &key(),
                ResourceKind::Computational,
                ActionKind::Create,
                &result,
            )
        };
        let first = decide();
        let second = decide();
        assert_eq!(first, second);
    }

    #[test]
    fn test_admission() {
        assert!(rule(ActionKind::Create).admits(None));
        assert!(rule(ActionKind::Create).admits(Some(Terminated)));
        assert!(!rule(ActionKind::Create).admits(Some(Creating)));
        assert!(!rule(ActionKind::Stop).admits(Some(Creating)));
        assert!(!rule(ActionKind::Stop).admits(None));
        assert!(rule(ActionKind::Configure).admits(Some(Configuring)));
    }

    #[test]
    fn test_awaits_callback() {
        assert!(awaits_callback(ActionKind::Create, Some(Creating)));
        assert!(!awaits_callback(ActionKind::Create, Some(Failed)));
        assert!(!awaits_callback(ActionKind::Stop, Some(Stopped)));
        assert!(!awaits_callback(ActionKind::Stop, None));
    }

    #[test]
    fn test_absent_record_awaits_only_actions_dispatchable_when_absent() {
        assert!(awaits_callback(ActionKind::Create, None));
        assert!(!awaits_callback(ActionKind::Start, None));
        assert!(!awaits_callback(ActionKind::Configure, None));
    }

    #[test]
    fn test_reconfigure_settled_at_running_no_longer_awaits() {
        assert!(awaits_callback(ActionKind::Reconfigure, Some(Reconfiguring)));
        assert!(!awaits_callback(ActionKind::Reconfigure, Some(Running)));
        assert_eq!(
            next_status(
                Running,
                &key(),
                ResourceKind::Computational,
                ActionKind::Reconfigure,
                &reported(ReportedStatus::Failed),
            ),
            Decision::Stale { current: Running }
        );
    }
}
