//! Retry Controller: bounded execute/repair loop.
//!
//! ```text
//! Idle → Executing → Success
//!            ↓
//!          Failed → (attempt < max) → Synthesizing → Executing
//!            ↓                             ↓ (no code in repair)
//!   (attempt == max) ──────────────→ Exhausted
//! ```
//!
//! `attempt` counts failed executions. Execution faults drive the loop;
//! a synthesis-service fault ends the request immediately and is never
//! retried here. The counter resets to 0 once a terminal state is reached.

use std::fmt;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::conversation::ConversationTurn;
use crate::engine::{CodeExecutor, ExecutionResult};
use crate::error::OrchestratorError;
use crate::llm::prompts::repair_request;
use crate::llm::{SynthesisClient, SynthesisRequest};
use crate::parser::parse_response;
use crate::versions::{ArtifactOrigin, CodeArtifact, VersionStore};

/// Default retry budget.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    Executing,
    Failed,
    Synthesizing,
    Success,
    Exhausted,
}

impl fmt::Display for RetryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RetryState::Idle => "idle",
            RetryState::Executing => "executing",
            RetryState::Failed => "failed",
            RetryState::Synthesizing => "synthesizing",
            RetryState::Success => "success",
            RetryState::Exhausted => "exhausted",
        };
        f.write_str(name)
    }
}

/// Per-request retry bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrySession {
    pub attempt: u32,
    pub last_error: Option<String>,
}

/// Progress reported while a request is being worked on.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    AttemptStarted { execution: u32, version: u32 },
    AttemptFailed { attempt: u32, max_attempts: u32, error: String },
    RepairRequested { attempt: u32, max_attempts: u32 },
    RepairReceived { version: u32 },
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressEvent::AttemptStarted { execution, version } => {
                write!(f, "running v{version} (execution {execution})")
            }
            ProgressEvent::AttemptFailed { attempt, max_attempts, error } => {
                let first = error.lines().next().unwrap_or_default();
                write!(f, "attempt {attempt} of {max_attempts} failed: {first}")
            }
            ProgressEvent::RepairRequested { attempt, max_attempts } => {
                write!(f, "asking for a fix (attempt {attempt} of {max_attempts})")
            }
            ProgressEvent::RepairReceived { version } => write!(f, "received fix as v{version}"),
        }
    }
}

/// Receiver of progress events. The controller never depends on delivery.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Drops every event.
#[derive(Debug, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn emit(&self, _event: ProgressEvent) {}
}

impl ProgressSink for UnboundedSender<ProgressEvent> {
    fn emit(&self, event: ProgressEvent) {
        // A closed receiver only means nobody is listening.
        let _ = self.send(event);
    }
}

/// Collaborators and state one run works against.
pub struct RetryContext<'a> {
    pub executor: &'a dyn CodeExecutor,
    pub synthesizer: &'a dyn SynthesisClient,
    pub versions: &'a mut VersionStore,
    /// Windowed history forwarded with repair requests.
    pub history: Vec<ConversationTurn>,
    pub progress: &'a dyn ProgressSink,
    pub cancel: &'a CancellationToken,
}

/// A run that reached `Success`.
#[derive(Debug, Clone)]
pub struct RetrySuccess {
    pub artifact: CodeArtifact,
    pub result: ExecutionResult,
    pub executions: u32,
    pub repairs: u32,
}

/// Drives one artifact to `Success` or `Exhausted`.
#[derive(Debug)]
pub struct RetryController {
    max_attempts: u32,
    state: RetryState,
    session: RetrySession,
    transitions: Vec<RetryState>,
}

impl Default for RetryController {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryController {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            state: RetryState::Idle,
            session: RetrySession::default(),
            transitions: Vec::new(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    pub fn session(&self) -> &RetrySession {
        &self.session
    }

    /// States visited by the most recent run, starting with `Idle`.
    pub fn transitions(&self) -> &[RetryState] {
        &self.transitions
    }

    /// Execute the current artifact, repairing it on failure until it
    /// succeeds or the budget is spent.
    pub async fn run(&mut self, ctx: RetryContext<'_>) -> Result<RetrySuccess, OrchestratorError> {
        let RetryContext {
            executor,
            synthesizer,
            versions,
            history,
            progress,
            cancel,
        } = ctx;

        self.session = RetrySession::default();
        self.transitions.clear();
        self.enter(RetryState::Idle);

        let mut executions = 0;
        let mut repairs = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(self.abort());
            }
            let artifact = match versions.current() {
                Some(a) => a.clone(),
                None => {
                    self.finish(RetryState::Idle);
                    return Err(OrchestratorError::NoCurrentArtifact);
                }
            };

            self.enter(RetryState::Executing);
            executions += 1;
            progress.emit(ProgressEvent::AttemptStarted {
                execution: executions,
                version: artifact.version,
            });
            let result = executor.execute(&artifact, cancel).await;

            if result.success {
                info!(version = artifact.version, executions, repairs, "execution succeeded");
                self.finish(RetryState::Success);
                return Ok(RetrySuccess {
                    artifact,
                    result,
                    executions,
                    repairs,
                });
            }
            if result.is_cancelled() {
                return Err(self.abort());
            }

            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "execution failed without a diagnostic".into());
            self.enter(RetryState::Failed);
            self.session.attempt += 1;
            self.session.last_error = Some(error.clone());
            warn!(
                version = artifact.version,
                attempt = self.session.attempt,
                max_attempts = self.max_attempts,
                "execution failed"
            );
            progress.emit(ProgressEvent::AttemptFailed {
                attempt: self.session.attempt,
                max_attempts: self.max_attempts,
                error: error.clone(),
            });

            if self.session.attempt >= self.max_attempts {
                return Err(self.exhaust(error));
            }

            self.enter(RetryState::Synthesizing);
            progress.emit(ProgressEvent::RepairRequested {
                attempt: self.session.attempt,
                max_attempts: self.max_attempts,
            });
            repairs += 1;
            let request = SynthesisRequest {
                language: versions.language(),
                history: history.clone(),
                message: repair_request(self.session.attempt, self.max_attempts),
                current_code: Some(artifact.code.clone()),
                last_error: Some(error.clone()),
            };
            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(self.abort()),
                r = synthesizer.synthesize(&request) => r,
            };
            let text = match response {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "repair request failed, not retrying");
                    self.finish(RetryState::Exhausted);
                    return Err(OrchestratorError::Synthesis(e));
                }
            };

            let Some(code) = parse_response(&text, versions.language()).code else {
                warn!("repair response contained no code");
                return Err(self.exhaust(error));
            };
            let fixed = versions.commit(code, artifact.description.clone(), ArtifactOrigin::AutoFix);
            progress.emit(ProgressEvent::RepairReceived {
                version: fixed.version,
            });
        }
    }

    fn enter(&mut self, state: RetryState) {
        self.state = state;
        self.transitions.push(state);
    }

    /// Enter a terminal state and reset the counter for the next request.
    fn finish(&mut self, state: RetryState) {
        self.enter(state);
        self.session = RetrySession::default();
    }

    fn exhaust(&mut self, last_error: String) -> OrchestratorError {
        let attempts = self.session.attempt;
        info!(attempts, "retry budget exhausted");
        self.finish(RetryState::Exhausted);
        OrchestratorError::RetryBudgetExhausted {
            attempts,
            last_error,
        }
    }

    fn abort(&mut self) -> OrchestratorError {
        info!("request cancelled");
        self.finish(RetryState::Idle);
        OrchestratorError::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::SynthesisError;
    use crate::testing::{code_reply, ScriptedExecutor, ScriptedSynthesizer};
    use crate::CodeLanguage;

    fn store_with_v1() -> VersionStore {
        let mut store = VersionStore::new(CodeLanguage::Python);
        store.commit("print(1)", "sma", ArtifactOrigin::Generated);
        store
    }

    async fn run(
        controller: &mut RetryController,
        executor: &ScriptedExecutor,
        synth: &ScriptedSynthesizer,
        store: &mut VersionStore,
        sink: &dyn ProgressSink,
    ) -> Result<RetrySuccess, OrchestratorError> {
        let cancel = CancellationToken::new();
        controller
            .run(RetryContext {
                executor,
                synthesizer: synth,
                versions: store,
                history: Vec::new(),
                progress: sink,
                cancel: &cancel,
            })
            .await
    }

    #[tokio::test]
    async fn first_attempt_success_needs_no_repair() {
        let mut controller = RetryController::default();
        let executor = ScriptedExecutor::new(vec![ScriptedExecutor::ok()]);
        let synth = ScriptedSynthesizer::default();
        let mut store = store_with_v1();

        let ok = run(&mut controller, &executor, &synth, &mut store, &NullProgress)
            .await
            .unwrap();
        assert_eq!(ok.executions, 1);
        assert_eq!(ok.repairs, 0);
        assert_eq!(synth.calls(), 0);
        assert_eq!(controller.state(), RetryState::Success);
        assert_eq!(
            controller.transitions(),
            &[RetryState::Idle, RetryState::Executing, RetryState::Success]
        );
    }

    #[tokio::test]
    async fn fail_then_fix_then_succeed() {
        let mut controller = RetryController::default();
        let executor = ScriptedExecutor::new(vec![
            ScriptedExecutor::raised("ModuleNotFoundError: No module named 'talib'"),
            ScriptedExecutor::ok(),
        ]);
        let synth = ScriptedSynthesizer::replies(&[&code_reply("without talib", "print(2)")]);
        let mut store = store_with_v1();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let ok = run(&mut controller, &executor, &synth, &mut store, &tx)
            .await
            .unwrap();
        assert_eq!(ok.artifact.version, 2);
        assert_eq!(ok.artifact.origin, ArtifactOrigin::AutoFix);
        assert_eq!(ok.artifact.description, "sma");
        assert_eq!(store.len(), 2);

        let requests = synth.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].current_code.as_deref(), Some("print(1)"));
        assert!(requests[0].last_error.as_deref().unwrap().contains("talib"));
        assert!(requests[0].message.contains("attempt 1 of 3"));

        let executed: Vec<String> = executor.executed().into_iter().map(|a| a.code).collect();
        assert_eq!(executed, vec!["print(1)", "print(2)"]);

        drop(tx);
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        assert!(matches!(events[0], ProgressEvent::AttemptStarted { execution: 1, version: 1 }));
        assert!(matches!(events[1], ProgressEvent::AttemptFailed { attempt: 1, .. }));
        assert!(matches!(events[2], ProgressEvent::RepairRequested { attempt: 1, max_attempts: 3 }));
        assert_eq!(events[3], ProgressEvent::RepairReceived { version: 2 });
        assert_eq!(events.len(), 5);
    }

    #[tokio::test]
    async fn three_failures_exhaust_after_two_repairs() {
        let mut controller = RetryController::default();
        let executor = ScriptedExecutor::new(vec![
            ScriptedExecutor::raised("KeyError: 'Close'"),
            ScriptedExecutor::raised("NameError: name 'df' is not defined"),
            ScriptedExecutor::raised("ZeroDivisionError: division by zero"),
        ]);
        let synth = ScriptedSynthesizer::replies(&[
            &code_reply("fix 1", "print(2)"),
            &code_reply("fix 2", "print(3)"),
        ]);
        let mut store = store_with_v1();

        let err = run(&mut controller, &executor, &synth, &mut store, &NullProgress)
            .await
            .unwrap_err();
        match err {
            OrchestratorError::RetryBudgetExhausted { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("ZeroDivisionError"));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(executor.executed().len(), 3);
        assert_eq!(synth.calls(), 2);
        assert!(synth.requests()[1].message.contains("attempt 2 of 3"));
        assert_eq!(store.len(), 3);
        assert_eq!(controller.state(), RetryState::Exhausted);
        assert_eq!(controller.session(), &RetrySession::default());
    }

    #[tokio::test]
    async fn attempt_counter_grows_by_one_per_failure() {
        let mut controller = RetryController::default();
        let executor = ScriptedExecutor::new(vec![
            ScriptedExecutor::raised("a"),
            ScriptedExecutor::raised("b"),
            ScriptedExecutor::ok(),
        ]);
        let synth = ScriptedSynthesizer::replies(&[
            &code_reply("1", "print(2)"),
            &code_reply("2", "print(3)"),
        ]);
        let mut store = store_with_v1();
        let ok = run(&mut controller, &executor, &synth, &mut store, &NullProgress)
            .await
            .unwrap();
        assert_eq!(ok.executions, 3);
        assert_eq!(ok.repairs, 2);

        let failed = controller
            .transitions()
            .iter()
            .filter(|s| **s == RetryState::Failed)
            .count();
        let synthesizing = controller
            .transitions()
            .iter()
            .filter(|s| **s == RetryState::Synthesizing)
            .count();
        assert_eq!(failed, 2);
        assert_eq!(synthesizing, 2);
    }

    #[tokio::test]
    async fn synthesis_fault_is_terminal_and_not_retried() {
        let mut controller = RetryController::default();
        let executor = ScriptedExecutor::new(vec![ScriptedExecutor::raised("boom")]);
        let synth = ScriptedSynthesizer::new(vec![Err(SynthesisError::ApiError {
            status: 529,
            message: "overloaded".into(),
        })]);
        let mut store = store_with_v1();

        let err = run(&mut controller, &executor, &synth, &mut store, &NullProgress)
            .await
            .unwrap_err();
        assert!(err.is_synthesis());
        assert!(err.to_string().contains("overloaded"));
        assert_eq!(executor.executed().len(), 1);
        assert_eq!(synth.calls(), 1);
        assert_eq!(controller.session().attempt, 0);
    }

    #[tokio::test]
    async fn unparseable_repair_exhausts() {
        let mut controller = RetryController::default();
        let executor = ScriptedExecutor::new(vec![ScriptedExecutor::raised("boom")]);
        let synth = ScriptedSynthesizer::replies(&["I am not sure what went wrong."]);
        let mut store = store_with_v1();

        let err = run(&mut controller, &executor, &synth, &mut store, &NullProgress)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::RetryBudgetExhausted { attempts: 1, .. }
        ));
        assert_eq!(store.len(), 1);
        assert_eq!(controller.state(), RetryState::Exhausted);
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let mut controller = RetryController::default();
        let executor = ScriptedExecutor::new(vec![ScriptedExecutor::ok()]);
        let synth = ScriptedSynthesizer::default();
        let mut store = store_with_v1();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = controller
            .run(RetryContext {
                executor: &executor,
                synthesizer: &synth,
                versions: &mut store,
                history: Vec::new(),
                progress: &NullProgress,
                cancel: &cancel,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));
        assert!(executor.executed().is_empty());
    }

    #[tokio::test]
    async fn empty_store_has_nothing_to_run() {
        let mut controller = RetryController::default();
        let executor = ScriptedExecutor::default();
        let synth = ScriptedSynthesizer::default();
        let mut store = VersionStore::new(CodeLanguage::Shell);
        let err = run(&mut controller, &executor, &synth, &mut store, &NullProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NoCurrentArtifact));
    }
}
