//! Retry Loop (C10): re-invokes the runner for tests reported as
//! *unstarted* after a crash, subject to the caps in §4.9.
//!
//! This is a batch-level retry over the whole remaining pattern set, not a
//! per-test backoff loop — distinct in shape from a generic retry executor,
//! though it keeps the same attempt-counting and structured-logging texture
//! this codebase uses elsewhere for retries.

use async_trait::async_trait;
use tracing::{info, warn};

/// Caller-supplied hook invoked before each retry attempt; it may
/// reconnect, rebuild the ephemeral server, or decline by returning false.
#[async_trait]
pub trait BeforeRetryHook: Send + Sync {
    async fn before_retry(&self, attempt: u32) -> bool;
}

/// A hook that always approves the retry; used when no reconnection work
/// is required between attempts.
pub struct AlwaysRetry;

#[async_trait]
impl BeforeRetryHook for AlwaysRetry {
    async fn before_retry(&self, _attempt: u32) -> bool {
        true
    }
}

/// One invocation's outcome, as far as the retry loop cares.
pub struct InvocationOutcome {
    pub succeeded: bool,
    /// `None` — the runner could not report remaining work, give up.
    /// `Some(empty)` — terminates successfully; the failed in-progress
    /// test is the only casualty. `Some(non-empty)` — candidates for the
    /// next retry attempt.
    pub unstarted: Option<Vec<String>>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The run finished (successfully or not) without needing another
    /// invocation.
    Done,
    /// Retry with this new pattern set.
    RetryWith(Vec<String>),
    /// Give up: either `unstarted` was nil, the pattern set repeated, the
    /// policy flag is unset, or the hook declined.
    GiveUp,
}

/// Decides, given one invocation's outcome and the loop's running state,
/// whether to retry, and with what pattern set (§4.9).
pub async fn decide_retry(
    outcome: &InvocationOutcome,
    continue_after_failure: bool,
    previous_patterns: &[String],
    hook: &dyn BeforeRetryHook,
    attempt: u32,
) -> RetryOutcome {
    if outcome.succeeded {
        return RetryOutcome::Done;
    }

    if !continue_after_failure {
        return RetryOutcome::GiveUp;
    }

    let unstarted = match &outcome.unstarted {
        None => {
            warn!("runner could not report unstarted tests, giving up");
            return RetryOutcome::GiveUp;
        }
        Some(u) => u,
    };

    if unstarted.is_empty() {
        info!("unstarted list is empty, retry loop terminates successfully");
        return RetryOutcome::Done;
    }

    if same_pattern_set(unstarted, previous_patterns) {
        warn!("unstarted pattern set repeated, refusing to loop forever");
        return RetryOutcome::GiveUp;
    }

    if !hook.before_retry(attempt).await {
        info!("before-retry hook declined");
        return RetryOutcome::GiveUp;
    }

    RetryOutcome::RetryWith(unstarted.clone())
}

fn same_pattern_set(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a_sorted = a.to_vec();
    let mut b_sorted = b.to_vec();
    a_sorted.sort();
    b_sorted.sort();
    a_sorted == b_sorted
}

/// Runs the retry loop end-to-end given a function that performs one
/// invocation and returns its outcome. Bounds iterations at `catalog_size +
/// 1` as an assertion of property P5, independent of the identity-check
/// short-circuit above.
pub async fn run_retry_loop<F, Fut>(
    initial_patterns: Vec<String>,
    catalog_size: usize,
    continue_after_failure: bool,
    hook: &dyn BeforeRetryHook,
    mut invoke: F,
) -> Vec<InvocationOutcome>
where
    F: FnMut(Vec<String>) -> Fut,
    Fut: std::future::Future<Output = InvocationOutcome>,
{
    let mut outcomes = Vec::new();
    let mut patterns = initial_patterns;
    let max_attempts = catalog_size as u32 + 1;

    for attempt in 0..max_attempts {
        let outcome = invoke(patterns.clone()).await;
        let decision = decide_retry(&outcome, continue_after_failure, &patterns, hook, attempt).await;
        outcomes.push(outcome);

        match decision {
            RetryOutcome::Done | RetryOutcome::GiveUp => break,
            RetryOutcome::RetryWith(next) => patterns = next,
        }
    }

    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn succeeded() -> InvocationOutcome {
        InvocationOutcome {
            succeeded: true,
            unstarted: None,
        }
    }

    fn failed_with(unstarted: Option<Vec<&str>>) -> InvocationOutcome {
        InvocationOutcome {
            succeeded: false,
            unstarted: unstarted.map(|v| v.into_iter().map(String::from).collect()),
        }
    }

    #[tokio::test]
    async fn success_terminates_immediately() {
        let decision = decide_retry(&succeeded(), true, &[], &AlwaysRetry, 0).await;
        assert_eq!(decision, RetryOutcome::Done);
    }

    #[tokio::test]
    async fn nil_unstarted_gives_up() {
        let decision = decide_retry(&failed_with(None), true, &[], &AlwaysRetry, 0).await;
        assert_eq!(decision, RetryOutcome::GiveUp);
    }

    #[tokio::test]
    async fn empty_unstarted_is_done() {
        let decision = decide_retry(&failed_with(Some(vec![])), true, &["a".into()], &AlwaysRetry, 0).await;
        assert_eq!(decision, RetryOutcome::Done);
    }

    #[tokio::test]
    async fn repeated_pattern_set_gives_up() {
        let prev = vec!["pkg.D".to_string()];
        let decision = decide_retry(&failed_with(Some(vec!["pkg.D"])), true, &prev, &AlwaysRetry, 0).await;
        assert_eq!(decision, RetryOutcome::GiveUp);
    }

    #[tokio::test]
    async fn disabled_policy_flag_gives_up_without_consulting_hook() {
        let decision = decide_retry(&failed_with(Some(vec!["pkg.D"])), false, &[], &AlwaysRetry, 0).await;
        assert_eq!(decision, RetryOutcome::GiveUp);
    }

    struct DecliningHook;
    #[async_trait]
    impl BeforeRetryHook for DecliningHook {
        async fn before_retry(&self, _attempt: u32) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn hook_can_decline_the_retry() {
        let decision = decide_retry(&failed_with(Some(vec!["pkg.D"])), true, &[], &DecliningHook, 0).await;
        assert_eq!(decision, RetryOutcome::GiveUp);
    }

    #[tokio::test]
    async fn new_pattern_set_is_accepted() {
        let prev = vec!["pkg.C".to_string()];
        let decision = decide_retry(&failed_with(Some(vec!["pkg.D"])), true, &prev, &AlwaysRetry, 0).await;
        assert_eq!(decision, RetryOutcome::RetryWith(vec!["pkg.D".to_string()]));
    }

    #[tokio::test]
    async fn loop_terminates_within_catalog_size_plus_one_invocations() {
        let calls = AtomicU32::new(0);
        let outcomes = run_retry_loop(
            vec!["pkg.A".to_string()],
            2,
            true,
            &AlwaysRetry,
            |patterns| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        InvocationOutcome {
                            succeeded: false,
                            unstarted: Some(vec![format!("pkg.{n}")]),
                        }
                    } else {
                        let _ = patterns;
                        InvocationOutcome {
                            succeeded: true,
                            unstarted: None,
                        }
                    }
                }
            },
        )
        .await;

        assert!(outcomes.len() <= 3);
    }

    #[tokio::test]
    async fn s4_incomplete_abort_retries_with_unstarted_pattern() {
        // Stream RunStart{names=[pkg.C,pkg.D]}, EntityStart{pkg.C}, then
        // stdout closes: pkg.D is unstarted, continueAfterFailure retries.
        let outcome = failed_with(Some(vec!["pkg.D"]));
        let decision = decide_retry(&outcome, true, &["pkg.C".into(), "pkg.D".into()], &AlwaysRetry, 0).await;
        assert_eq!(decision, RetryOutcome::RetryWith(vec!["pkg.D".to_string()]));
    }
}
