//! Multitask policy
//!
//! Decides how a new run is admitted when its thread already has pending
//! runs. The decision is computed from the strategy carried by the request
//! and applied by the run service against the inflight list.

use graphd_core::types::{CancelAction, MultitaskStrategy};

/// Decision on how to admit a run against a busy thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultitaskDecision {
    /// Do not create the run; answer with the inflight conflict.
    Reject,
    /// Create the run and leave the inflight runs alone.
    Proceed,
    /// Create the run, then cancel the inflight runs with this action.
    ProceedAndCancel(CancelAction),
}

/// Compute the decision for a strategy given whether inflight runs exist.
pub fn decide(strategy: MultitaskStrategy, has_inflight: bool) -> MultitaskDecision {
    if !has_inflight {
        return MultitaskDecision::Proceed;
    }
    match strategy {
        MultitaskStrategy::Reject => MultitaskDecision::Reject,
        MultitaskStrategy::Enqueue => MultitaskDecision::Proceed,
        MultitaskStrategy::Interrupt => MultitaskDecision::ProceedAndCancel(CancelAction::Interrupt),
        MultitaskStrategy::Rollback => MultitaskDecision::ProceedAndCancel(CancelAction::Rollback),
    }
}
