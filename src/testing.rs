//! Scripted fakes for the synthesis service and the executor.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;

use crate::engine::{CodeExecutor, ExecutionFault, ExecutionResult, OutputSummary};
use crate::llm::{SynthesisClient, SynthesisError, SynthesisRequest};
use crate::versions::CodeArtifact;

/// A well-formed response carrying `code`.
pub fn code_reply(explanation: &str, code: &str) -> String {
    format!("<explanation>{explanation}</explanation>\n<code>\n{code}\n</code>")
}

/// Replays canned responses in order and records every request.
#[derive(Default)]
pub struct ScriptedSynthesizer {
    responses: Mutex<VecDeque<Result<String, SynthesisError>>>,
    requests: Mutex<Vec<SynthesisRequest>>,
}

impl ScriptedSynthesizer {
    pub fn new(responses: Vec<Result<String, SynthesisError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replies(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| Ok(t.to_string())).collect())
    }

    pub fn requests(&self) -> Vec<SynthesisRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl SynthesisClient for ScriptedSynthesizer {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<String, SynthesisError> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(SynthesisError::EmptyResponse))
    }
}

/// Replays canned execution results and records what was executed.
#[derive(Default)]
pub struct ScriptedExecutor {
    results: Mutex<VecDeque<ExecutionResult>>,
    executed: Mutex<Vec<CodeArtifact>>,
}

impl ScriptedExecutor {
    pub fn new(results: Vec<ExecutionResult>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn executed(&self) -> Vec<CodeArtifact> {
        self.executed.lock().unwrap().clone()
    }

    pub fn ok() -> ExecutionResult {
        let day = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        ExecutionResult::succeeded(
            PathBuf::from("/tmp/quantloop-test/out.csv"),
            OutputSummary {
                signal_column: "signal".into(),
                rows: 1,
                first_date: day,
                last_date: day,
                min: 1.0,
                max: 1.0,
                last: 1.0,
            },
            String::new(),
            Duration::from_millis(5),
        )
    }

    pub fn raised(stderr: &str) -> ExecutionResult {
        ExecutionResult::failed(
            ExecutionFault::Raised {
                exit_code: 1,
                stderr: stderr.into(),
            },
            String::new(),
            Duration::from_millis(5),
        )
    }
}

#[async_trait]
impl CodeExecutor for ScriptedExecutor {
    async fn execute(&self, artifact: &CodeArtifact, _cancel: &CancellationToken) -> ExecutionResult {
        self.executed.lock().unwrap().push(artifact.clone());
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ScriptedExecutor::raised("no scripted result left"))
    }
}
