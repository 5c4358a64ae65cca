//! Trigger-rule evaluation.
//!
//! [`evaluate`] is a pure function of a trigger rule and a summary of the
//! upstream states. Mapped upstreams contribute one count per expanded
//! instance; the scheduler builds the summary with
//! [`UpstreamSummary::record`] and friends.

use crate::core::dag::TriggerRule;
use crate::core::instance::TaskInstanceState;

/// Upstream states of one task instance, by category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpstreamSummary {
    pub total: usize,
    pub success: usize,
    pub skipped: usize,
    pub failed: usize,
    pub upstream_failed: usize,
    pub removed: usize,
    /// Upstreams not yet in a terminal state.
    pub not_done: usize,
}

impl UpstreamSummary {
    /// Summarize a list of states.
    pub fn from_states<I>(states: I) -> Self
    where
        I: IntoIterator<Item = TaskInstanceState>,
    {
        let mut summary = Self::default();
        for state in states {
            summary.record(state);
        }
        summary
    }

    /// Count one upstream instance.
    pub fn record(&mut self, state: TaskInstanceState) {
        self.total += 1;
        match state {
            TaskInstanceState::Success => self.success += 1,
            TaskInstanceState::Skipped => self.skipped += 1,
            TaskInstanceState::Failed => self.failed += 1,
            TaskInstanceState::UpstreamFailed => self.upstream_failed += 1,
            TaskInstanceState::Removed => self.removed += 1,
            _ => self.not_done += 1,
        }
    }

    /// Count a mapped upstream that has not expanded yet.
    pub fn record_unexpanded(&mut self) {
        self.total += 1;
        self.not_done += 1;
    }

    /// Count a mapped upstream that expanded to zero instances.
    pub fn record_empty_expansion(&mut self) {
        self.total += 1;
        self.success += 1;
    }

    /// True when every upstream is terminal.
    pub fn all_done(&self) -> bool {
        self.not_done == 0
    }

    fn failures(&self) -> usize {
        self.failed + self.upstream_failed
    }
}

/// What the scheduler should do with a `none` instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepDecision {
    /// Check again next pass.
    NotReady,
    /// Move to `scheduled`.
    Ready,
    /// Move to `upstream_failed` without running.
    UpstreamFailed,
    /// Move to `skipped` without running.
    Skip,
}

/// Evaluate `rule` against `upstream`.
///
/// A task without upstreams is always ready.
pub fn evaluate(rule: TriggerRule, upstream: &UpstreamSummary) -> DepDecision {
    use DepDecision::*;

    if upstream.total == 0 {
        return Ready;
    }
    let done = upstream.all_done();

    match rule {
        TriggerRule::AllSuccess => {
            if upstream.failures() + upstream.removed > 0 {
                UpstreamFailed
            } else if upstream.skipped > 0 {
                Skip
            } else if done {
                Ready
            } else {
                NotReady
            }
        }
        TriggerRule::AllFailed => {
            if upstream.success + upstream.skipped > 0 {
                Skip
            } else if !done {
                NotReady
            } else if upstream.failures() == upstream.total {
                Ready
            } else {
                Skip
            }
        }
        TriggerRule::AllDone => {
            if done {
                Ready
            } else {
                NotReady
            }
        }
        TriggerRule::OneSuccess => match (done, upstream.success > 0) {
            (false, _) => NotReady,
            (true, true) => Ready,
            (true, false) => UpstreamFailed,
        },
        TriggerRule::OneFailed => match (done, upstream.failures() > 0) {
            (false, _) => NotReady,
            (true, true) => Ready,
            (true, false) => Skip,
        },
        TriggerRule::NoneFailed => {
            if upstream.failures() > 0 {
                UpstreamFailed
            } else if !done {
                NotReady
            } else if upstream.skipped == upstream.total {
                Skip
            } else {
                Ready
            }
        }
        TriggerRule::NoneFailedMinOneSuccess => {
            if upstream.failures() > 0 {
                UpstreamFailed
            } else if !done {
                NotReady
            } else if upstream.success > 0 {
                Ready
            } else {
                Skip
            }
        }
        TriggerRule::NoneSkipped => {
            if upstream.skipped > 0 {
                Skip
            } else if done {
                Ready
            } else {
                NotReady
            }
        }
        TriggerRule::Always => Ready,
    }
}
