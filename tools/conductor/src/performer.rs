//! Replay engine: drives a composition's steps in order against live peers.

use crate::composition::{AssertPayload, Composition, CuePayload, SendPayload, Step, StepAction};
use crate::config::PerformerConfig;
use crate::errors::ConductorError;
use crate::identity;
use crate::logging::append_run_log;
use crate::matcher::{self, Rule};
use crate::performance::{AssertionResult, Performance, StepResult};
use crate::registry::{PeerSessionRegistry, Wakeup};
use crate::runtime::{Clock, ConnectionProvider};
use crate::types::StepStatus;
use crate::variables::VariableStore;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Aborted,
}

pub fn validate_transition(from: RunState, to: RunState) -> Result<(), ConductorError> {
    use RunState as S;

    let allowed = match from {
        S::Idle => matches!(to, S::Running),
        S::Running => matches!(to, S::Completed | S::Aborted),
        S::Completed | S::Aborted => false,
    };
    if !allowed {
        return Err(ConductorError::InvalidComposition(format!(
            "illegal performer transition: {from:?} -> {to:?}"
        )));
    }
    Ok(())
}

/// External stop signal for a running performance.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    wakeup: Arc<Wakeup>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.wakeup.notify();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn wakeup(&self) -> Arc<Wakeup> {
        Arc::clone(&self.wakeup)
    }
}

/// Optional progress notifications.
pub trait PerformanceObserver: Send + Sync {
    fn on_step_started(&self, _index: usize, _step: &Step) {}
    fn on_step_finished(&self, _index: usize, _step: &Step, _result: &StepResult) {}
}

pub struct SilentObserver;

impl PerformanceObserver for SilentObserver {}

pub struct Performer {
    provider: Arc<dyn ConnectionProvider>,
    clock: Arc<dyn Clock>,
    config: PerformerConfig,
    observer: Arc<dyn PerformanceObserver>,
}

enum StepOutcome {
    Done,
    Asserted(AssertionResult),
}

/// Mutable state owned by a single run.
struct Stage<'a> {
    registry: PeerSessionRegistry,
    variables: VariableStore,
    cancel: &'a CancelToken,
}

impl Performer {
    pub fn new(
        provider: Arc<dyn ConnectionProvider>,
        clock: Arc<dyn Clock>,
        config: PerformerConfig,
    ) -> Self {
        Self {
            provider,
            clock,
            config,
            observer: Arc::new(SilentObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn PerformanceObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Replay `composition` once. Only a structurally invalid composition is
    /// returned as an error; every step-level failure lands in the report.
    pub fn run(
        &self,
        composition: &Composition,
        cancel: &CancelToken,
    ) -> Result<Performance, ConductorError> {
        composition.validate()?;

        let mut state = RunState::Idle;
        validate_transition(state, RunState::Running)?;
        state = RunState::Running;

        let performance_id = identity::performance_id();
        let start_time = self.clock.now_ms();
        append_run_log(
            "info",
            "performer.run.started",
            json!({
                "performance_id": performance_id,
                "composition_id": composition.id,
                "steps": composition.steps.len(),
            }),
        );

        let mut stage = Stage {
            registry: PeerSessionRegistry::new(
                Arc::clone(&self.provider),
                &composition.accounts,
                cancel.wakeup(),
            ),
            variables: VariableStore::seeded(&composition.variables),
            cancel,
        };

        let mut results = Vec::with_capacity(composition.steps.len());
        for (index, step) in composition.steps.iter().enumerate() {
            if state == RunState::Aborted {
                let result = StepResult::skipped(&step.id);
                self.observer.on_step_finished(index, step, &result);
                results.push(result);
                continue;
            }

            self.observer.on_step_started(index, step);
            let started = Instant::now();
            let outcome = if cancel.is_cancelled() {
                Err(ConductorError::Cancelled(
                    "performance cancelled before step started".to_string(),
                ))
            } else {
                self.execute(step, &mut stage)
            };
            let duration_ms = elapsed_ms(started);
            let result = match outcome {
                Ok(StepOutcome::Done) => StepResult::passed(&step.id, duration_ms),
                Ok(StepOutcome::Asserted(outcome)) => {
                    StepResult::asserted(&step.id, duration_ms, vec![outcome])
                }
                Err(err) => StepResult::errored(&step.id, duration_ms, &err),
            };

            append_run_log(
                match result.status {
                    StepStatus::Passed | StepStatus::Skipped => "info",
                    StepStatus::Failed | StepStatus::Error => "warn",
                },
                "performer.step.finished",
                json!({
                    "performance_id": performance_id,
                    "index": index,
                    "step_id": step.id,
                    "kind": step.action.kind(),
                    "alias": step.account_alias,
                    "status": result.status.as_str(),
                    "duration_ms": duration_ms,
                    "error": result.error.as_ref().map(|e| e.message.clone()),
                }),
            );

            let fatal = match result.status {
                StepStatus::Error => true,
                StepStatus::Failed => self.config.abort_on_failed_assertion,
                StepStatus::Passed | StepStatus::Skipped => false,
            };
            if fatal {
                validate_transition(state, RunState::Aborted)?;
                state = RunState::Aborted;
            }
            self.observer.on_step_finished(index, step, &result);
            results.push(result);
        }

        if state == RunState::Running {
            validate_transition(state, RunState::Completed)?;
            state = RunState::Completed;
        }

        let end_time = self.clock.now_ms();
        let performance = Performance::assemble(
            performance_id,
            &composition.id,
            start_time,
            end_time,
            results,
        );
        let torn_down = stage.registry.teardown();

        append_run_log(
            if performance.passed() { "info" } else { "warn" },
            "performer.run.finished",
            json!({
                "performance_id": performance.id,
                "composition_id": composition.id,
                "state": format!("{state:?}"),
                "status": performance.status.as_str(),
                "summary": {
                    "total": performance.summary.total,
                    "passed": performance.summary.passed,
                    "failed": performance.summary.failed,
                },
                "disconnected": torn_down,
            }),
        );
        Ok(performance)
    }

    fn execute(&self, step: &Step, stage: &mut Stage<'_>) -> Result<StepOutcome, ConductorError> {
        let alias = step.account_alias.as_str();
        match &step.action {
            StepAction::Connect => {
                stage.registry.ensure_connected(alias)?;
                Ok(StepOutcome::Done)
            }
            StepAction::Disconnect => {
                stage.registry.disconnect(alias)?;
                Ok(StepOutcome::Done)
            }
            StepAction::Send(payload) => {
                self.send(alias, payload, stage)?;
                Ok(StepOutcome::Done)
            }
            StepAction::Cue(payload) => {
                self.cue(alias, payload, stage)?;
                Ok(StepOutcome::Done)
            }
            StepAction::Assert(payload) => self
                .assert(alias, payload, stage)
                .map(StepOutcome::Asserted),
        }
    }

    fn send(
        &self,
        alias: &str,
        payload: &SendPayload,
        stage: &mut Stage<'_>,
    ) -> Result<(), ConductorError> {
        let substitution = stage.variables.substitute(&payload.xml);
        if !substitution.unresolved.is_empty() {
            append_run_log(
                "warn",
                "performer.send.unresolved_placeholders",
                json!({
                    "alias": alias,
                    "names": substitution.unresolved,
                }),
            );
        }
        matcher::check_well_formed(&substitution.text).map_err(ConductorError::SendFailed)?;
        stage.registry.send(alias, &substitution.text)?;
        for (name, value) in &payload.generated_ids {
            stage.variables.set(name, value);
        }
        Ok(())
    }

    fn cue(
        &self,
        alias: &str,
        payload: &CuePayload,
        stage: &mut Stage<'_>,
    ) -> Result<String, ConductorError> {
        let rule = Rule::compile(payload.match_type, &payload.match_expression, &stage.variables)?;
        let timeout_ms = payload.timeout_ms.min(self.config.max_cue_timeout_ms);
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        stage.registry.ensure_connected(alias)?;

        let wakeup = stage.registry.wakeup();
        let mut cursor = 0;
        loop {
            let seen = wakeup.generation();
            let scan = stage.registry.scan(alias, &rule, cursor)?;
            if let Some(raw) = scan.matched {
                return Ok(raw);
            }
            cursor = scan.next_seq;
            if stage.cancel.is_cancelled() {
                return Err(ConductorError::Cancelled(format!(
                    "cancelled while waiting on {alias} for {} {:?}",
                    payload.match_type.as_str(),
                    payload.match_expression
                )));
            }
            let now = Instant::now();
            if now >= deadline {
                let inbound = stage.registry.inbound(alias);
                append_run_log(
                    "warn",
                    "performer.cue.timed_out",
                    json!({
                        "alias": alias,
                        "timeout_ms": timeout_ms,
                        "received": inbound.len(),
                        "unconsumed": inbound.iter().filter(|m| !m.consumed).count(),
                    }),
                );
                return Err(ConductorError::CueTimeout(format!(
                    "no message on {alias} matched {} {:?} within {timeout_ms}ms",
                    payload.match_type.as_str(),
                    payload.match_expression
                )));
            }
            wakeup.wait_past(seen, deadline - now);
        }
    }

    fn assert(
        &self,
        alias: &str,
        payload: &AssertPayload,
        stage: &mut Stage<'_>,
    ) -> Result<AssertionResult, ConductorError> {
        let candidate = stage.registry.last_observed(alias).ok_or_else(|| {
            ConductorError::MatchEvaluation(format!(
                "no message observed on {alias} to assert against"
            ))
        })?;
        let outcome = matcher::evaluate_assertion(
            payload.assertion_type,
            &payload.expression,
            payload.expected.as_deref(),
            &candidate,
            &stage.variables,
        )?;
        Ok(AssertionResult {
            passed: outcome.passed,
            expected: Some(
                payload
                    .expected
                    .clone()
                    .unwrap_or_else(|| payload.expression.clone()),
            ),
            actual: outcome.actual,
        })
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_move_forward() {
        validate_transition(RunState::Idle, RunState::Running).expect("start");
        validate_transition(RunState::Running, RunState::Aborted).expect("abort");
        let err = validate_transition(RunState::Completed, RunState::Running)
            .expect_err("terminal state");
        assert!(err.to_string().contains("illegal performer transition"));
        assert!(validate_transition(RunState::Idle, RunState::Completed).is_err());
    }

    #[test]
    fn cancel_wakes_waiters() {
        let token = CancelToken::new();
        let wakeup = token.wakeup();
        let seen = wakeup.generation();
        let clone = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            clone.cancel();
        });
        let started = Instant::now();
        wakeup.wait_past(seen, Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(token.is_cancelled());
        handle.join().expect("join");
    }
}
