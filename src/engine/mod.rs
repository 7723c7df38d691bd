//! Execution Engine: run one code artifact in a fresh, isolated context.
//!
//! Each run gets its own temporary directory holding the materialized
//! market data, an `output/` directory and the rendered script. The child
//! sees only the injected capabilities (see `backend::Capabilities`). After
//! it exits the engine locates the produced table, validates it against the
//! output contract and persists the two-column result.
//!
//! Faults raised by the executed code never propagate: every outcome is an
//! `ExecutionResult`.

pub mod backend;
pub mod contract;
pub mod csv;
pub mod output;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::data::{self, DataProvider};
use crate::versions::CodeArtifact;
use crate::CodeLanguage;
use backend::{Capabilities, LanguageBackend, PythonBackend, ShellBackend};
pub use contract::{ContractViolation, OutputContract, OutputSummary};

/// Longest stderr excerpt carried in a fault.
const MAX_DIAGNOSTIC_CHARS: usize = 4000;

/// Why a run did not produce a valid result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionFault {
    #[error("could not prepare the execution context: {0}")]
    Setup(String),

    #[error("could not start the {language} interpreter: {message}")]
    Spawn {
        language: CodeLanguage,
        message: String,
    },

    #[error("code raised an error (exit code {exit_code}):\n{stderr}")]
    Raised { exit_code: i32, stderr: String },

    #[error("timed out after {seconds}s without finishing")]
    TimedOut { seconds: u64 },

    #[error("no output produced: the code finished but wrote no CSV file")]
    NoOutput,

    #[error("output contract violation: {0}")]
    Contract(#[from] ContractViolation),

    #[error("execution cancelled")]
    Cancelled,
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// True only when the output satisfied the contract.
    pub success: bool,
    /// Persisted two-column output.
    pub output_path: Option<PathBuf>,
    pub error: Option<String>,
    pub fault: Option<ExecutionFault>,
    pub summary: Option<OutputSummary>,
    pub stdout: String,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn succeeded(path: PathBuf, summary: OutputSummary, stdout: String, duration: Duration) -> Self {
        Self {
            success: true,
            output_path: Some(path),
            error: None,
            fault: None,
            summary: Some(summary),
            stdout,
            duration,
        }
    }

    pub fn failed(fault: ExecutionFault, stdout: String, duration: Duration) -> Self {
        Self {
            success: false,
            output_path: None,
            error: Some(fault.to_string()),
            fault: Some(fault),
            summary: None,
            stdout,
            duration,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.fault, Some(ExecutionFault::Cancelled))
    }
}

/// Anything that can execute an artifact. The retry loop only sees this.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(&self, artifact: &CodeArtifact, cancel: &CancellationToken) -> ExecutionResult;
}

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Wall-clock budget per attempt.
    pub timeout: Duration,
    /// Symbols materialized for `load_data`; the first is the default.
    pub symbols: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Persisted output area.
    pub output_dir: PathBuf,
    pub signal_column: Option<String>,
}

/// Subprocess-backed engine, polymorphic over language backends.
pub struct ExecutionEngine {
    config: EngineConfig,
    provider: Arc<dyn DataProvider>,
    backends: HashMap<CodeLanguage, Box<dyn LanguageBackend>>,
}

impl ExecutionEngine {
    /// Engine with the Python and shell backends registered.
    pub fn new(config: EngineConfig, provider: Arc<dyn DataProvider>) -> Self {
        let mut engine = Self {
            config,
            provider,
            backends: HashMap::new(),
        };
        engine.register_backend(Box::new(PythonBackend));
        engine.register_backend(Box::new(ShellBackend));
        engine
    }

    /// Add or replace the backend for its language.
    pub fn register_backend(&mut self, backend: Box<dyn LanguageBackend>) {
        self.backends.insert(backend.language(), backend);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn run(&self, artifact: &CodeArtifact, cancel: &CancellationToken) -> ExecutionResult {
        let started = Instant::now();
        let fail = |fault: ExecutionFault, stdout: String| {
            ExecutionResult::failed(fault, stdout, started.elapsed())
        };

        let Some(backend) = self.backends.get(&artifact.language) else {
            return fail(
                ExecutionFault::Spawn {
                    language: artifact.language,
                    message: "no backend registered".into(),
                },
                String::new(),
            );
        };

        let workdir = match tempfile::Builder::new().prefix("quantloop-run-").tempdir() {
            Ok(dir) => dir,
            Err(e) => return fail(ExecutionFault::Setup(e.to_string()), String::new()),
        };
        let indicator = sanitize_identifier(&artifact.description);
        let output_name = format!("{indicator}_{}.csv", timestamp_tag());
        // One deadline covers data preparation and the child together.
        let deadline = tokio::time::Instant::now() + self.config.timeout;
        let timed_out = ExecutionFault::TimedOut {
            seconds: self.config.timeout.as_secs(),
        };
        let prepared = tokio::time::timeout_at(deadline, self.prepare(workdir.path(), &output_name));
        let caps = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(version = artifact.version, "execution cancelled while loading data");
                return fail(ExecutionFault::Cancelled, String::new());
            }
            res = prepared => match res {
                Err(_) => {
                    warn!(version = artifact.version, "market data preparation timed out");
                    return fail(timed_out.clone(), String::new());
                }
                Ok(Err(e)) => return fail(ExecutionFault::Setup(e), String::new()),
                Ok(Ok(caps)) => caps,
            }
        };

        let script = workdir.path().join(backend.script_name());
        if let Err(e) = std::fs::write(&script, backend.render(&artifact.code)) {
            return fail(ExecutionFault::Setup(e.to_string()), String::new());
        }

        let mut cmd = backend.command(&script);
        cmd.current_dir(workdir.path())
            .env_clear()
            .envs(caps.env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return fail(
                    ExecutionFault::Spawn {
                        language: artifact.language,
                        message: e.to_string(),
                    },
                    String::new(),
                )
            }
        };

        let _group = ProcessGroupGuard(child.id());
        info!(version = artifact.version, language = %artifact.language, "executing artifact");
        // Dropping the wait future drops the child, and kill_on_drop terminates it.
        // The guard then takes down anything the child spawned.
        let waited = tokio::time::timeout_at(deadline, child.wait_with_output());
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(version = artifact.version, "execution cancelled, child killed");
                return fail(ExecutionFault::Cancelled, String::new());
            }
            res = waited => match res {
                Err(_) => {
                    warn!(version = artifact.version, "execution timed out, child killed");
                    return fail(timed_out, String::new());
                }
                Ok(Err(e)) => {
                    return fail(
                        ExecutionFault::Spawn { language: artifact.language, message: e.to_string() },
                        String::new(),
                    )
                }
                Ok(Ok(output)) => output,
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);
        info!(
            version = artifact.version,
            exit_code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "execution finished"
        );

        if !output.status.success() {
            let diagnostic = if stderr.trim().is_empty() { &stdout } else { &stderr };
            return fail(
                ExecutionFault::Raised {
                    exit_code,
                    stderr: tail(diagnostic.trim(), MAX_DIAGNOSTIC_CHARS),
                },
                stdout,
            );
        }

        let search_dirs = [caps.output_dir.clone(), workdir.path().to_path_buf()];
        let Some((found, _tier)) = output::find_output(&search_dirs, &indicator, &output_name)
        else {
            return fail(ExecutionFault::NoOutput, stdout);
        };

        let contract = OutputContract::new(self.config.signal_column.clone());
        let validated = match contract.validate_file(&found) {
            Ok(v) => v,
            Err(violation) => return fail(violation.into(), stdout),
        };

        let persisted = self.config.output_dir.join(&output_name);
        let written = std::fs::create_dir_all(&self.config.output_dir)
            .and_then(|_| validated.write_csv(&persisted));
        if let Err(e) = written {
            return fail(
                ExecutionFault::Setup(format!("could not persist output: {e}")),
                stdout,
            );
        }
        info!(path = %persisted.display(), rows = validated.summary.rows, "output accepted");

        ExecutionResult::succeeded(persisted, validated.summary, stdout, started.elapsed())
    }

    /// Lay out `data/` and `output/` and build the capability set.
    async fn prepare(&self, root: &Path, output_name: &str) -> Result<Capabilities, String> {
        let data_dir = root.join("data");
        let output_dir = root.join("output");
        std::fs::create_dir_all(&data_dir).map_err(|e| e.to_string())?;
        std::fs::create_dir_all(&output_dir).map_err(|e| e.to_string())?;

        for symbol in &self.config.symbols {
            let symbol = symbol.trim().to_uppercase();
            let bars = self
                .provider
                .load_data(&symbol, self.config.start_date, self.config.end_date)
                .await
                .map_err(|e| e.to_string())?;
            data::write_csv(&data_dir.join(format!("{symbol}.csv")), &bars)
                .map_err(|e| e.to_string())?;
        }

        Ok(Capabilities {
            data_dir,
            output_dir,
            output_name: output_name.to_string(),
            default_symbol: self
                .config
                .symbols
                .first()
                .map(|s| s.trim().to_uppercase())
                .unwrap_or_else(|| "SPY".into()),
            start_date: self.config.start_date,
            end_date: self.config.end_date,
        })
    }
}

/// Kills the child's process group on drop, so nothing it forked outlives the run.
struct ProcessGroupGuard(Option<u32>);

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.0 {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            // ESRCH just means the group already exited.
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }
}

#[async_trait]
impl CodeExecutor for ExecutionEngine {
    async fn execute(&self, artifact: &CodeArtifact, cancel: &CancellationToken) -> ExecutionResult {
        self.run(artifact, cancel).await
    }
}

/// Lowercase identifier safe for file names: `[a-z0-9_]`, at most 40 chars.
pub fn sanitize_identifier(text: &str) -> String {
    let mut out = String::new();
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') && !out.is_empty() {
            out.push('_');
        }
        if out.len() >= 40 {
            break;
        }
    }
    let out = out.trim_end_matches('_').to_string();
    if out.is_empty() {
        "analysis".into()
    } else {
        out
    }
}

/// Millisecond-resolution UTC timestamp for artifact names.
pub fn timestamp_tag() -> String {
    Utc::now().format("%Y%m%d_%H%M%S_%3f").to_string()
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let skipped: String = text.chars().skip(count - max_chars).collect();
    format!("...{skipped}")
}
