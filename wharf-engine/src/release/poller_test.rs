use chrono::Utc;

use super::poller::{evaluate_status, AbortPolicy, PollAction, UserInterruptedPolicy};
use crate::fixtures;
use wharf_core::models::{AppType, DeployStatus, Environment};

#[test]
fn ready_succeeds_immediately() {
    let (action, count) = evaluate_status(DeployStatus::Ready, 5, 3);
    assert_eq!(action, PollAction::Succeed);
    assert_eq!(count, 0);
}

#[test]
fn transient_errors_merely_increment_the_counter() {
    let (action, count) = evaluate_status(DeployStatus::Error, 0, 3);
    assert_eq!(action, PollAction::Continue);
    assert_eq!(count, 1);

    let (action, count) = evaluate_status(DeployStatus::Error, count, 3);
    assert_eq!(action, PollAction::Continue);
    assert_eq!(count, 2);
}

#[test]
fn consecutive_errors_past_the_limit_fail_the_poll() {
    let limit = 3;
    let mut count = 0;
    for _ in 0..limit {
        let (action, next) = evaluate_status(DeployStatus::Error, count, limit);
        assert_eq!(action, PollAction::Continue);
        count = next;
    }
    let (action, _count) = evaluate_status(DeployStatus::Error, count, limit);
    assert!(
        matches!(action, PollAction::Fail { .. }),
        "expected poll to fail after {} consecutive errors, got {:?}",
        limit + 1,
        action
    );
}

#[test]
fn non_error_states_reset_the_counter() {
    let (action, count) = evaluate_status(DeployStatus::Progressing, 2, 3);
    assert_eq!(action, PollAction::Continue);
    assert_eq!(count, 0, "expected a non-error state to reset the consecutive counter");

    let (_action, count) = evaluate_status(DeployStatus::Pending, 2, 3);
    assert_eq!(count, 0);
}

#[tokio::test]
async fn user_interrupted_policy_observes_the_interruption_flag() {
    let env = fixtures::module_environment("demo", Environment::Stag, AppType::CloudNative);
    let ctx = fixtures::release_context(env, vec![], vec![]);
    let policy = UserInterruptedPolicy;

    let mut deployment = ctx.deployment;
    assert!(!policy.should_abort(&deployment));

    deployment.release_int_requested_at = Some(Utc::now());
    assert!(policy.should_abort(&deployment), "expected the policy to abort once the flag is written");
}
