//! Coordinator state of one server-side operation
//!
//! Pure transition logic. The owner keeps the state behind a single lock and
//! performs the returned steps (sends, rollbacks, latch releases) while
//! still holding it, so responses for one operation leave in order.
//!
//! `R` is the right to answer one request. At most one is held at a time in
//! `response_channel`, and every send consumes it. Responses that would not
//! fit in one frame are swapped for a failure before the right is spent.

use crate::engine::{EngineError, EngineTransaction};
use proven_common::{Attachments, OperationOutcome, OperationResponse};
use proven_protocol::{Decision, ManagementResponse};

/// Lifecycle of a server-side operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Registered, not yet running (or a placeholder for an early Complete)
    New,
    Executing,
    /// The engine reached its prepare point
    Prepared,
    /// `Prepared` was sent; the engine thread is parked
    AwaitingComplete,
    Completed,
    CancelledBeforePrepare,
    Failed,
}

/// What to do after the engine reported prepare
pub(crate) enum PrepareStep<R> {
    /// Send `Prepared`, then park until the decision
    Respond(R, ManagementResponse),
    /// Cancelled before prepare or nobody left to ask: roll back now
    RollBack(Box<dyn EngineTransaction>),
    /// Prepare was already reported once
    Rejected(Box<dyn EngineTransaction>),
}

/// What to do with an incoming Complete
pub(crate) enum CompleteStep<R> {
    /// Not prepared yet; the operation is doomed and answers on Execute
    Deferred,
    /// Decision recorded; wake the engine thread
    Release,
    /// The engine thread was already woken by a cancellation; the terminal
    /// response will go out on this Complete
    Attached,
    /// The terminal response was ready first; send it now
    Flush(R, ManagementResponse),
    /// A Complete after the decision was already taken
    Late(R),
}

/// Where the terminal response goes
pub(crate) enum FinishStep<R> {
    Respond(R, ManagementResponse),
    /// Held until the Complete that should carry it arrives
    Cached,
    /// The peer is gone
    Dropped,
}

pub(crate) struct CoordinatorState<R> {
    phase: Phase,
    prepared: bool,
    prepared_sent: bool,
    rollback_on_prepare: bool,
    active_tx: Option<Box<dyn EngineTransaction>>,
    response_channel: Option<R>,
    tx_completed: bool,
    decision: Option<Decision>,
    post_prepare_race_response: Option<ManagementResponse>,
    early_decision: Option<Decision>,
    connection_lost: bool,
    prepare_failure: Option<String>,
}

impl<R> CoordinatorState<R> {
    pub(crate) fn new() -> Self {
        Self {
            phase: Phase::New,
            prepared: false,
            prepared_sent: false,
            rollback_on_prepare: false,
            active_tx: None,
            response_channel: None,
            tx_completed: false,
            decision: None,
            post_prepare_race_response: None,
            early_decision: None,
            connection_lost: false,
            prepare_failure: None,
        }
    }

    /// State for a Complete that arrived before its Execute
    pub(crate) fn placeholder(decision: Decision) -> Self {
        Self {
            early_decision: Some(decision),
            rollback_on_prepare: true,
            ..Self::new()
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn early_decision(&self) -> Option<Decision> {
        if self.phase == Phase::New {
            self.early_decision
        } else {
            None
        }
    }

    pub(crate) fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Execute accepted; `channel` answers it
    pub(crate) fn start(&mut self, channel: R) {
        self.phase = Phase::Executing;
        self.set_response_channel(channel);
    }

    /// `oversized` describes why a response cannot be sent, if it cannot
    pub(crate) fn on_prepared(
        &mut self,
        transaction: Box<dyn EngineTransaction>,
        result: OperationOutcome,
        oversized: impl FnOnce(&ManagementResponse) -> Option<String>,
    ) -> PrepareStep<R> {
        if self.prepared {
            return PrepareStep::Rejected(transaction);
        }
        self.prepared = true;
        self.phase = Phase::Prepared;

        if self.rollback_on_prepare || self.connection_lost {
            self.decision = Some(Decision::Rollback);
            return PrepareStep::RollBack(transaction);
        }

        let response = ManagementResponse::Prepared { result };
        if let Some(description) = oversized(&response) {
            // The Execute stays open and is answered with the failure
            self.decision = Some(Decision::Rollback);
            self.prepare_failure = Some(description);
            return PrepareStep::RollBack(transaction);
        }

        match self.response_channel.take() {
            Some(channel) => {
                self.prepared_sent = true;
                self.active_tx = Some(transaction);
                self.phase = Phase::AwaitingComplete;
                PrepareStep::Respond(channel, response)
            }
            None => {
                self.decision = Some(Decision::Rollback);
                PrepareStep::RollBack(transaction)
            }
        }
    }

    /// The `Prepared` response could not be sent
    pub(crate) fn abandon_prepare(&mut self) -> Option<Box<dyn EngineTransaction>> {
        self.connection_lost = true;
        self.decision = Some(Decision::Rollback);
        self.active_tx.take()
    }

    pub(crate) fn on_complete(&mut self, channel: R, decision: Decision) -> CompleteStep<R> {
        if !self.prepared_sent {
            // Before prepare any Complete means cancel
            if !self.prepared {
                self.rollback_on_prepare = true;
            }
            return CompleteStep::Deferred;
        }

        if let Some(response) = self.post_prepare_race_response.take() {
            self.tx_completed = true;
            return CompleteStep::Flush(channel, response);
        }

        if self.tx_completed {
            return CompleteStep::Late(channel);
        }

        self.tx_completed = true;
        self.set_response_channel(channel);
        if self.decision.is_none() {
            self.decision = Some(decision);
            CompleteStep::Release
        } else {
            CompleteStep::Attached
        }
    }

    /// Out-of-band cancellation; returns whether the engine thread must be
    /// woken
    pub(crate) fn on_cancel(&mut self) -> bool {
        if !self.prepared {
            self.rollback_on_prepare = true;
            return false;
        }
        if self.prepared_sent && self.decision.is_none() {
            self.decision = Some(Decision::Rollback);
            return true;
        }
        false
    }

    /// The connection is gone; returns whether a pending decision was forced
    /// to rollback
    pub(crate) fn on_connection_lost(&mut self) -> bool {
        self.connection_lost = true;
        self.response_channel = None;
        self.post_prepare_race_response = None;
        if !self.prepared {
            self.rollback_on_prepare = true;
        }
        if self.prepared && self.decision.is_none() {
            self.decision = Some(Decision::Rollback);
            return true;
        }
        false
    }

    /// Decision for the woken engine thread plus the handle to apply it to
    pub(crate) fn take_decision(&mut self) -> (Decision, Option<Box<dyn EngineTransaction>>) {
        (
            self.decision.unwrap_or(Decision::Rollback),
            self.active_tx.take(),
        )
    }

    /// Transaction the engine never got back to
    pub(crate) fn take_leftover_transaction(&mut self) -> Option<Box<dyn EngineTransaction>> {
        self.active_tx.take()
    }

    /// Execution returned; pick the terminal response and its destination
    pub(crate) fn finish(
        &mut self,
        result: Result<OperationResponse, EngineError>,
        oversized: impl FnOnce(&ManagementResponse) -> Option<String>,
    ) -> (FinishStep<R>, Attachments) {
        let (mut response, mut streams, mut phase) = self.terminal_response(result);
        if let Some(description) = oversized(&response) {
            response = self.replacement_response(&response, description);
            streams.clear();
            phase = Phase::Failed;
        }
        self.phase = phase;

        let step = match self.response_channel.take() {
            Some(channel) => FinishStep::Respond(channel, response),
            None if self.prepared_sent && !self.connection_lost => {
                self.post_prepare_race_response = Some(response);
                FinishStep::Cached
            }
            None => FinishStep::Dropped,
        };
        (step, streams)
    }

    fn terminal_response(
        &self,
        result: Result<OperationResponse, EngineError>,
    ) -> (ManagementResponse, Attachments, Phase) {
        if !self.prepared_sent {
            if self.rollback_on_prepare {
                return (
                    ManagementResponse::Cancelled,
                    Vec::new(),
                    Phase::CancelledBeforePrepare,
                );
            }
            if let Some(description) = &self.prepare_failure {
                return (
                    ManagementResponse::Failed {
                        result: OperationOutcome::failed(description.clone()),
                    },
                    Vec::new(),
                    Phase::Failed,
                );
            }
            return match result {
                Err(e) => (
                    ManagementResponse::Failed {
                        result: OperationOutcome::failed(e.to_string()),
                    },
                    Vec::new(),
                    Phase::Failed,
                ),
                Ok(response) => match response.into_outcome() {
                    OperationOutcome::Cancelled => (
                        ManagementResponse::Cancelled,
                        Vec::new(),
                        Phase::CancelledBeforePrepare,
                    ),
                    outcome @ OperationOutcome::Failed { .. } => (
                        ManagementResponse::Failed { result: outcome },
                        Vec::new(),
                        Phase::Failed,
                    ),
                    OperationOutcome::Success { .. } => (
                        ManagementResponse::Failed {
                            result: OperationOutcome::failed("operation finished without preparing"),
                        },
                        Vec::new(),
                        Phase::Failed,
                    ),
                },
            };
        }

        match result {
            Err(e) => (
                ManagementResponse::Completed {
                    result: OperationOutcome::Failed {
                        failure_description: e.to_string(),
                        rolled_back: self.decision != Some(Decision::Commit),
                        timed_out: false,
                    },
                    stream_count: 0,
                },
                Vec::new(),
                Phase::Failed,
            ),
            Ok(response) => {
                let (outcome, streams) = response.into_parts();
                (
                    ManagementResponse::Completed {
                        result: outcome,
                        stream_count: streams.len() as u32,
                    },
                    streams,
                    Phase::Completed,
                )
            }
        }
    }

    /// A failure of the same kind as `response` that fits in a frame
    fn replacement_response(
        &self,
        response: &ManagementResponse,
        description: String,
    ) -> ManagementResponse {
        match response {
            ManagementResponse::Completed { .. } => ManagementResponse::Completed {
                result: OperationOutcome::Failed {
                    failure_description: description,
                    rolled_back: self.decision != Some(Decision::Commit),
                    timed_out: false,
                },
                stream_count: 0,
            },
            _ => ManagementResponse::Failed {
                result: OperationOutcome::failed(description),
            },
        }
    }

    fn set_response_channel(&mut self, channel: R) {
        if self.response_channel.is_some() {
            tracing::error!("Response channel replaced while a response was still owed");
        }
        self.response_channel = Some(channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NoopTransaction;
    use proven_common::BytesAttachment;
    use serde_json::json;
    use std::sync::Arc;

    type State = CoordinatorState<&'static str>;

    fn tx() -> Box<dyn EngineTransaction> {
        Box::new(NoopTransaction)
    }

    fn success() -> OperationOutcome {
        OperationOutcome::success(json!({"name": "default"}))
    }

    fn fits(_: &ManagementResponse) -> Option<String> {
        None
    }

    fn too_large(_: &ManagementResponse) -> Option<String> {
        Some("response too large to send".to_string())
    }

    fn prepared_state() -> State {
        let mut state = State::new();
        state.start("execute");
        match state.on_prepared(tx(), success(), fits) {
            PrepareStep::Respond("execute", ManagementResponse::Prepared { .. }) => {}
            _ => panic!("expected Prepared on the Execute channel"),
        }
        state
    }

    #[test]
    fn test_commit_path() {
        let mut state = prepared_state();
        assert_eq!(state.phase(), Phase::AwaitingComplete);

        assert!(matches!(
            state.on_complete("complete", Decision::Commit),
            CompleteStep::Release
        ));
        let (decision, transaction) = state.take_decision();
        assert_eq!(decision, Decision::Commit);
        assert!(transaction.is_some());

        let (step, streams) = state.finish(Ok(OperationResponse::new(success())), fits);
        assert!(streams.is_empty());
        match step {
            FinishStep::Respond("complete", ManagementResponse::Completed { result, stream_count }) => {
                assert_eq!(result, success());
                assert_eq!(stream_count, 0);
            }
            _ => panic!("expected Completed on the Complete channel"),
        }
        assert_eq!(state.phase(), Phase::Completed);
    }

    #[test]
    fn test_cancel_before_prepare() {
        let mut state = State::new();
        state.start("execute");

        assert!(matches!(
            state.on_complete("complete", Decision::Rollback),
            CompleteStep::Deferred
        ));
        assert!(matches!(
            state.on_prepared(tx(), success(), fits),
            PrepareStep::RollBack(_)
        ));

        let (step, _) = state.finish(Ok(OperationResponse::new(success())), fits);
        assert!(matches!(
            step,
            FinishStep::Respond("execute", ManagementResponse::Cancelled)
        ));
        assert_eq!(state.phase(), Phase::CancelledBeforePrepare);
    }

    #[test]
    fn test_failure_before_prepare_answers_execute() {
        let mut state = State::new();
        state.start("execute");

        let (step, _) = state.finish(
            Err(EngineError::new("ResourceNotFound", "no such subsystem")),
            fits,
        );
        match step {
            FinishStep::Respond("execute", ManagementResponse::Failed { result }) => {
                assert_eq!(
                    result.failure_description(),
                    Some("ResourceNotFound: no such subsystem")
                );
            }
            _ => panic!("expected Failed on the Execute channel"),
        }
        assert_eq!(state.phase(), Phase::Failed);
    }

    #[test]
    fn test_result_ready_before_complete_is_cached_then_flushed() {
        let mut state = prepared_state();

        assert!(state.on_cancel());
        let (decision, _) = state.take_decision();
        assert_eq!(decision, Decision::Rollback);

        let cancelled = OperationResponse::new(OperationOutcome::rolled_back("cancelled"));
        let (step, _) = state.finish(Ok(cancelled), fits);
        assert!(matches!(step, FinishStep::Cached));

        match state.on_complete("complete", Decision::Commit) {
            CompleteStep::Flush("complete", ManagementResponse::Completed { result, .. }) => {
                assert_eq!(result.failure_description(), Some("cancelled"));
            }
            _ => panic!("expected the cached response to be flushed"),
        }
    }

    #[test]
    fn test_complete_after_cancel_carries_the_response() {
        let mut state = prepared_state();

        assert!(state.on_cancel());
        assert!(matches!(
            state.on_complete("complete", Decision::Commit),
            CompleteStep::Attached
        ));

        let cancelled = OperationResponse::new(OperationOutcome::rolled_back("cancelled"));
        let (step, _) = state.finish(Ok(cancelled), fits);
        assert!(matches!(step, FinishStep::Respond("complete", _)));
    }

    #[test]
    fn test_second_complete_is_late() {
        let mut state = prepared_state();

        assert!(matches!(
            state.on_complete("first", Decision::Commit),
            CompleteStep::Release
        ));
        assert!(matches!(
            state.on_complete("second", Decision::Rollback),
            CompleteStep::Late("second")
        ));
        assert_eq!(state.take_decision().0, Decision::Commit);
    }

    #[test]
    fn test_connection_lost_while_parked() {
        let mut state = prepared_state();

        assert!(state.on_connection_lost());
        assert_eq!(state.take_decision().0, Decision::Rollback);

        let (step, _) = state.finish(Ok(OperationResponse::new(success())), fits);
        assert!(matches!(step, FinishStep::Dropped));
    }

    #[test]
    fn test_prepare_reported_twice_is_rejected() {
        let mut state = prepared_state();
        assert!(matches!(
            state.on_prepared(tx(), success(), fits),
            PrepareStep::Rejected(_)
        ));
    }

    #[test]
    fn test_failure_after_prepare_reports_rollback() {
        let mut state = prepared_state();
        state.on_complete("complete", Decision::Commit);
        state.take_decision();

        let panicked = EngineError::new("Panic", "index out of bounds");
        let (step, _) = state.finish(Err(panicked), fits);
        match step {
            FinishStep::Respond("complete", ManagementResponse::Completed { result, .. }) => {
                assert!(result.is_failed());
                assert!(matches!(
                    result,
                    OperationOutcome::Failed {
                        rolled_back: false,
                        ..
                    }
                ));
            }
            _ => panic!("expected Completed with a failure"),
        }
        assert_eq!(state.phase(), Phase::Failed);
    }

    #[test]
    fn test_streams_are_counted() {
        let mut state = prepared_state();
        state.on_complete("complete", Decision::Commit);
        state.take_decision();

        let streams: Attachments = vec![
            Arc::new(BytesAttachment::new(b"log line".to_vec())),
            Arc::new(BytesAttachment::new(Vec::new())),
        ];
        let (step, streams) =
            state.finish(Ok(OperationResponse::with_streams(success(), streams)), fits);
        assert_eq!(streams.len(), 2);
        assert!(matches!(
            step,
            FinishStep::Respond(_, ManagementResponse::Completed { stream_count: 2, .. })
        ));
    }

    #[test]
    fn test_placeholder_exposes_early_decision_until_started() {
        let mut state = State::placeholder(Decision::Rollback);
        assert_eq!(state.early_decision(), Some(Decision::Rollback));

        state.start("execute");
        assert_eq!(state.early_decision(), None);
    }

    #[test]
    fn test_oversized_prepared_answers_execute_with_failure() {
        let mut state = State::new();
        state.start("execute");

        assert!(matches!(
            state.on_prepared(tx(), success(), too_large),
            PrepareStep::RollBack(_)
        ));
        assert_eq!(state.take_decision().0, Decision::Rollback);

        let rolled_back = OperationResponse::new(OperationOutcome::rolled_back("rolled back"));
        let (step, _) = state.finish(Ok(rolled_back), fits);
        match step {
            FinishStep::Respond("execute", ManagementResponse::Failed { result }) => {
                assert_eq!(result.failure_description(), Some("response too large to send"));
            }
            _ => panic!("expected Failed on the Execute channel"),
        }
        assert_eq!(state.phase(), Phase::Failed);

        // The operation never reached the client as prepared
        assert!(matches!(
            state.on_complete("complete", Decision::Commit),
            CompleteStep::Deferred
        ));
    }

    #[test]
    fn test_oversized_completed_is_replaced() {
        let mut state = prepared_state();
        state.on_complete("complete", Decision::Commit);
        state.take_decision();

        let streams: Attachments = vec![Arc::new(BytesAttachment::new(b"log".to_vec()))];
        let (step, streams) =
            state.finish(Ok(OperationResponse::with_streams(success(), streams)), too_large);
        assert!(streams.is_empty());
        match step {
            FinishStep::Respond("complete", ManagementResponse::Completed { result, stream_count }) => {
                assert_eq!(stream_count, 0);
                assert_eq!(result.failure_description(), Some("response too large to send"));
                assert!(matches!(
                    result,
                    OperationOutcome::Failed {
                        rolled_back: false,
                        ..
                    }
                ));
            }
            _ => panic!("expected a replacement Completed"),
        }
        assert_eq!(state.phase(), Phase::Failed);
    }
}
