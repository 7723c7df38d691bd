//! Session: the explicit state object every request runs against.
//!
//! Bundles the conversation, the version store and the retry controller
//! for one interaction stream. Concurrent users each get their own
//! `Session`; nothing here is shared.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::conversation::{ConversationState, ConversationTurn};
use crate::engine::{sanitize_identifier, timestamp_tag, CodeExecutor, ExecutionResult};
use crate::error::OrchestratorError;
use crate::llm::{SynthesisClient, SynthesisRequest};
use crate::parser::parse_response;
use crate::retry::{ProgressSink, RetryContext, RetryController, RetryState, RetrySuccess};
use crate::versions::{ArtifactOrigin, CodeArtifact, VersionStore};

/// What a handled message produced.
#[derive(Debug, Clone)]
pub enum Reply {
    /// No code and no question: plain text back to the user.
    Conversational { text: String },
    /// The request was too ambiguous to implement.
    Clarification { question: String },
    /// Code was committed and ran to a valid output.
    Executed {
        explanation: Option<String>,
        artifact: CodeArtifact,
        result: ExecutionResult,
        executions: u32,
        repairs: u32,
    },
}

pub struct Session {
    id: Uuid,
    conversation: ConversationState,
    versions: VersionStore,
    retry: RetryController,
    /// Error from the last exhausted run, forwarded with the next request.
    last_error: Option<String>,
    history_window: usize,
    code_dir: PathBuf,
    /// Highest version already written to `code_dir`.
    persisted: u32,
    synthesizer: Arc<dyn SynthesisClient>,
    executor: Arc<dyn CodeExecutor>,
}

impl Session {
    pub fn new(
        config: &OrchestratorConfig,
        synthesizer: Arc<dyn SynthesisClient>,
        executor: Arc<dyn CodeExecutor>,
    ) -> Self {
        let id = Uuid::new_v4();
        info!(session = %id, language = %config.language, "session started");
        Self {
            id,
            conversation: ConversationState::new(config.history_retention),
            versions: VersionStore::new(config.language),
            retry: RetryController::new(config.max_attempts),
            last_error: None,
            history_window: config.history_window,
            code_dir: config.code_dir.clone(),
            persisted: 0,
            synthesizer,
            executor,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn history(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.conversation.turns()
    }

    pub fn versions(&self) -> &[CodeArtifact] {
        self.versions.history()
    }

    pub fn current(&self) -> Option<&CodeArtifact> {
        self.versions.current()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn retry_state(&self) -> RetryState {
        self.retry.state()
    }

    /// Handle one user message end to end.
    pub async fn handle_message(
        &mut self,
        message: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Reply, OrchestratorError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(OrchestratorError::EmptyMessage);
        }

        let request = SynthesisRequest {
            language: self.versions.language(),
            history: self.conversation.window(self.history_window),
            message: message.to_string(),
            current_code: self.versions.current().map(|a| a.code.clone()),
            last_error: self.last_error.clone(),
        };

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            r = self.synthesizer.synthesize(&request) => r?,
        };
        // Recorded only once answered, so a failed call leaves no dangling user turn.
        self.conversation.append(ConversationTurn::user(message));
        let parsed = parse_response(&response, self.versions.language());

        if let Some(question) = parsed.clarification {
            self.conversation
                .append(ConversationTurn::assistant(question.clone()));
            return Ok(Reply::Clarification { question });
        }

        let Some(code) = parsed.code else {
            let text = parsed
                .explanation
                .unwrap_or_else(|| response.trim().to_string());
            self.conversation.append(ConversationTurn::assistant(text.clone()));
            return Ok(Reply::Conversational { text });
        };

        let origin = if self.versions.is_empty() {
            ArtifactOrigin::Generated
        } else {
            ArtifactOrigin::Edit
        };
        self.versions.commit(code, message, origin);

        let outcome = self.execute_current(progress, cancel).await;
        self.finish(parsed.explanation, outcome)
    }

    /// Move back one version. Stored artifacts are left untouched.
    pub fn revert(&mut self) -> Result<&CodeArtifact, OrchestratorError> {
        self.last_error = None;
        self.versions
            .revert()
            .ok_or(OrchestratorError::NoCurrentArtifact)
    }

    /// Execute the current artifact again, repairing it on failure.
    pub async fn rerun_current(
        &mut self,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Reply, OrchestratorError> {
        if self.versions.current().is_none() {
            return Err(OrchestratorError::NoCurrentArtifact);
        }
        let outcome = self.execute_current(progress, cancel).await;
        self.finish(None, outcome)
    }

    async fn execute_current(
        &mut self,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<RetrySuccess, OrchestratorError> {
        self.persist_new()?;

        let outcome = self
            .retry
            .run(RetryContext {
                executor: self.executor.as_ref(),
                synthesizer: self.synthesizer.as_ref(),
                versions: &mut self.versions,
                history: self.conversation.window(self.history_window),
                progress,
                cancel,
            })
            .await;

        // Auto-fixes committed during the run.
        self.persist_new()?;
        outcome
    }

    fn finish(
        &mut self,
        explanation: Option<String>,
        outcome: Result<RetrySuccess, OrchestratorError>,
    ) -> Result<Reply, OrchestratorError> {
        match outcome {
            Ok(done) => {
                self.last_error = None;
                let mut text = explanation.clone().unwrap_or_default();
                if let Some(path) = &done.result.output_path {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(&format!("Ran v{}; output written to {}", done.artifact.version, path.display()));
                }
                self.conversation.append(ConversationTurn::assistant(text));
                Ok(Reply::Executed {
                    explanation,
                    artifact: done.artifact,
                    result: done.result,
                    executions: done.executions,
                    repairs: done.repairs,
                })
            }
            Err(err) => {
                if let OrchestratorError::RetryBudgetExhausted { last_error, .. } = &err {
                    self.last_error = Some(last_error.clone());
                }
                if !matches!(err, OrchestratorError::Cancelled) {
                    self.conversation
                        .append(ConversationTurn::assistant(err.to_string()));
                }
                Err(err)
            }
        }
    }

    /// Write artifacts committed since the last call to the code area.
    fn persist_new(&mut self) -> Result<(), OrchestratorError> {
        let pending = &self.versions.history()[self.persisted as usize..];
        if pending.is_empty() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.code_dir)?;
        for artifact in pending {
            let name = format!(
                "{}_v{}_{}.{}",
                sanitize_identifier(&artifact.description),
                artifact.version,
                timestamp_tag(),
                artifact.language.extension()
            );
            let path = self.code_dir.join(name);
            debug!(path = %path.display(), "persisting code artifact");
            std::fs::write(&path, &artifact.code)?;
            self.persisted = artifact.version;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CachedDataProvider;
    use crate::engine::ExecutionEngine;
    use crate::retry::NullProgress;
    use crate::llm::SynthesisError;
    use crate::testing::{code_reply, ScriptedExecutor, ScriptedSynthesizer};
    use crate::CodeLanguage;

    const SMA_30: &str = r#"load_data | awk -F, 'NR == 1 { print "date,sma_30"; next }
{ n++; c[n] = $5; s += $5; if (n > 30) s -= c[n - 30];
  if (n >= 30) printf "%s,%.4f\n", $1, s / 30 }' > "$OUTPUT_DIR/$OUTPUT_NAME""#;

    struct Fixture {
        _dir: tempfile::TempDir,
        config: OrchestratorConfig,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let config = OrchestratorConfig {
            language: CodeLanguage::Shell,
            code_dir: dir.path().join("code"),
            output_dir: dir.path().join("output"),
            lookback_days: 200,
            timeout_secs: 30,
            offline: true,
            ..OrchestratorConfig::default()
        };
        Fixture { _dir: dir, config }
    }

    fn shell_session(fx: &Fixture, synth: Arc<ScriptedSynthesizer>) -> Session {
        let engine = ExecutionEngine::new(
            fx.config.engine_config(),
            Arc::new(CachedDataProvider::offline()),
        );
        Session::new(&fx.config, synth, Arc::new(engine))
    }

    async fn send(session: &mut Session, text: &str) -> Result<Reply, OrchestratorError> {
        session
            .handle_message(text, &NullProgress, &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn moving_average_request_succeeds_first_time() {
        let fx = fixture();
        let synth = Arc::new(ScriptedSynthesizer::replies(&[&code_reply(
            "30-day simple moving average of the close",
            SMA_30,
        )]));
        let mut session = shell_session(&fx, synth.clone());

        let reply = send(&mut session, "30-day moving average of a price series")
            .await
            .unwrap();
        let Reply::Executed { artifact, result, executions, repairs, .. } = reply else {
            panic!("expected an executed reply");
        };
        assert_eq!(artifact.version, 1);
        assert_eq!(artifact.origin, ArtifactOrigin::Generated);
        assert_eq!((executions, repairs), (1, 0));
        assert_eq!(session.versions().len(), 1);

        let text = std::fs::read_to_string(result.output_path.unwrap()).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("date,sma_30"));
        for line in lines {
            let fields: Vec<&str> = line.split(',').collect();
            assert_eq!(fields.len(), 2);
            assert!(!fields[0].is_empty());
            assert!(fields[1].parse::<f64>().is_ok());
        }

        let code_files = std::fs::read_dir(&fx.config.code_dir).unwrap().count();
        assert_eq!(code_files, 1);
        assert_eq!(session.history().count(), 2);
        assert!(synth.requests()[0].current_code.is_none());
    }

    #[tokio::test]
    async fn dependency_fault_is_repaired_once() {
        let fx = fixture();
        let synth = Arc::new(ScriptedSynthesizer::replies(&[
            &code_reply("uses a helper", "ta_lib_sma --period 30 > out.csv"),
            &code_reply("plain awk instead", SMA_30),
        ]));
        let mut session = shell_session(&fx, synth.clone());

        let reply = send(&mut session, "30-day moving average").await.unwrap();
        let Reply::Executed { artifact, repairs, .. } = reply else {
            panic!("expected an executed reply");
        };
        assert_eq!(repairs, 1);
        assert_eq!(artifact.version, 2);
        assert_eq!(artifact.origin, ArtifactOrigin::AutoFix);
        assert_eq!(session.versions().len(), 2);

        let repair = &synth.requests()[1];
        assert!(repair.last_error.as_deref().unwrap().contains("ta_lib_sma"));
        assert!(repair.current_code.as_deref().unwrap().contains("ta_lib_sma"));
        assert_eq!(std::fs::read_dir(&fx.config.code_dir).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn three_distinct_failures_exhaust_the_budget() {
        let fx = fixture();
        let synth = Arc::new(ScriptedSynthesizer::replies(&[
            &code_reply("v1", "echo 'first failure' >&2; exit 1"),
            &code_reply("v2", "echo 'second failure' >&2; exit 2"),
            &code_reply("v3", "echo 'third failure' >&2; exit 3"),
        ]));
        let mut session = shell_session(&fx, synth.clone());

        let err = send(&mut session, "something impossible").await.unwrap_err();
        match &err {
            OrchestratorError::RetryBudgetExhausted { attempts, last_error } => {
                assert_eq!(*attempts, 3);
                assert!(last_error.contains("third failure"));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        // One initial synthesis plus exactly two repairs.
        assert_eq!(synth.calls(), 3);
        assert_eq!(session.versions().len(), 3);
        assert_eq!(session.retry_state(), RetryState::Exhausted);
        assert!(session.last_error().unwrap().contains("third failure"));
    }

    #[tokio::test]
    async fn next_request_carries_code_and_last_error() {
        let fx = fixture();
        let synth = Arc::new(ScriptedSynthesizer::replies(&[
            &code_reply("v1", "exit 1"),
            "no idea",
            &code_reply("fixed by hand", SMA_30),
        ]));
        let mut session = shell_session(&fx, synth.clone());

        assert!(send(&mut session, "sma").await.is_err());
        let reply = send(&mut session, "please fix it").await.unwrap();
        let Reply::Executed { artifact, .. } = reply else {
            panic!("expected an executed reply");
        };
        assert_eq!(artifact.origin, ArtifactOrigin::Edit);

        let third = &synth.requests()[2];
        assert_eq!(third.current_code.as_deref(), Some("exit 1"));
        assert!(third.last_error.is_some());
        assert!(third.composed_message().contains("<last_error>"));
        assert!(session.last_error().is_none());
    }

    #[tokio::test]
    async fn clarification_wins_and_commits_nothing() {
        let fx = fixture();
        let synth = Arc::new(ScriptedSynthesizer::replies(&[
            "<clarification>Which symbol and which window?</clarification>\n<code>exit 0</code>",
        ]));
        let mut session = shell_session(&fx, synth);

        let reply = send(&mut session, "do the thing").await.unwrap();
        assert!(matches!(reply, Reply::Clarification { ref question } if question.contains("Which symbol")));
        assert!(session.versions().is_empty());
        assert!(session.current().is_none());
    }

    #[tokio::test]
    async fn plain_text_is_conversational() {
        let fx = fixture();
        let synth = Arc::new(ScriptedSynthesizer::replies(&[
            "A moving average smooths a price series.",
        ]));
        let mut session = shell_session(&fx, synth);
        let reply = send(&mut session, "what is a moving average?").await.unwrap();
        assert!(matches!(reply, Reply::Conversational { ref text } if text.contains("smooths")));
        assert!(session.versions().is_empty());
    }

    #[tokio::test]
    async fn synthesis_fault_surfaces_and_commits_nothing() {
        let fx = fixture();
        let synth = Arc::new(ScriptedSynthesizer::default());
        let mut session = shell_session(&fx, synth);
        let err = send(&mut session, "sma").await.unwrap_err();
        assert!(err.is_synthesis());
        assert!(session.versions().is_empty());
    }

    #[tokio::test]
    async fn failed_synthesis_leaves_no_user_turn() {
        let fx = fixture();
        let synth = Arc::new(ScriptedSynthesizer::new(vec![
            Err(SynthesisError::ApiError {
                status: 529,
                message: "overloaded".into(),
            }),
            Ok("Moving averages smooth the series.".into()),
        ]));
        let mut session = shell_session(&fx, synth.clone());

        assert!(send(&mut session, "first try").await.is_err());
        assert_eq!(session.history().count(), 0);

        send(&mut session, "what is a moving average?").await.unwrap();
        let turns: Vec<_> = session.history().collect();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "what is a moving average?");
        assert!(synth.requests()[1].history.is_empty());
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let fx = fixture();
        let mut session = shell_session(&fx, Arc::new(ScriptedSynthesizer::default()));
        assert!(matches!(
            send(&mut session, "   ").await,
            Err(OrchestratorError::EmptyMessage)
        ));
        assert_eq!(session.history().count(), 0);
    }

    #[tokio::test]
    async fn revert_and_rerun() {
        let fx = fixture();
        let synth = Arc::new(ScriptedSynthesizer::replies(&[
            &code_reply("sma", SMA_30),
            &code_reply("broken edit", "exit 0"),
        ]));
        let executor = Arc::new(ScriptedExecutor::new(vec![
            ScriptedExecutor::ok(),
            ScriptedExecutor::ok(),
            ScriptedExecutor::ok(),
        ]));
        let mut session = Session::new(&fx.config, synth, executor.clone());

        send(&mut session, "sma").await.unwrap();
        send(&mut session, "change it").await.unwrap();
        assert_eq!(session.current().unwrap().version, 2);

        let reverted = session.revert().unwrap();
        assert_eq!(reverted.version, 1);
        assert_eq!(session.versions().len(), 2);
        assert_eq!(session.versions()[1].code, "exit 0");

        session
            .rerun_current(&NullProgress, &CancellationToken::new())
            .await
            .unwrap();
        let executed = executor.executed();
        assert_eq!(executed.len(), 3);
        assert_eq!(executed[2].version, 1);
        assert_eq!(std::fs::read_dir(&fx.config.code_dir).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn revert_and_rerun_need_code() {
        let fx = fixture();
        let mut session = shell_session(&fx, Arc::new(ScriptedSynthesizer::default()));
        assert!(matches!(session.revert(), Err(OrchestratorError::NoCurrentArtifact)));
        assert!(matches!(
            session
                .rerun_current(&NullProgress, &CancellationToken::new())
                .await,
            Err(OrchestratorError::NoCurrentArtifact)
        ));
    }

    #[tokio::test]
    async fn timeout_is_a_recoverable_failure() {
        let mut fx = fixture();
        fx.config.timeout_secs = 1;
        let synth = Arc::new(ScriptedSynthesizer::replies(&[
            &code_reply("slow", "sleep 20"),
            &code_reply("fast", SMA_30),
        ]));
        let mut session = shell_session(&fx, synth.clone());

        let reply = send(&mut session, "sma").await.unwrap();
        assert!(matches!(reply, Reply::Executed { repairs: 1, .. }));
        let repair = &synth.requests()[1];
        assert!(repair.last_error.as_deref().unwrap().contains("timed out"));
    }
}
