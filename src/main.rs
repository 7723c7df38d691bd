use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quantloop::config::OrchestratorConfig;
use quantloop::data::yahoo::YahooSource;
use quantloop::data::CachedDataProvider;
use quantloop::engine::ExecutionEngine;
use quantloop::error::OrchestratorError;
use quantloop::llm::AnthropicSynthesizer;
use quantloop::retry::{ProgressEvent, ProgressSink};
use quantloop::session::{Reply, Session};
use quantloop::CodeLanguage;

/// Describe an analysis in plain language; quantloop writes the code, runs
/// it against market data and repairs it when it fails.
#[derive(Parser, Debug)]
#[command(name = "quantloop", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Language of generated code (python or shell)
    #[arg(long, global = true, value_parser = CodeLanguage::from_str_lc)]
    language: Option<CodeLanguage>,

    /// Use synthetic market data only
    #[arg(long, global = true)]
    offline: bool,

    /// Symbol to make available to generated code (repeatable; first is the default)
    #[arg(long = "symbol", global = true)]
    symbols: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Handle one request and exit
    Run {
        /// The analysis to perform
        request: String,
    },
    /// Interactive session
    Chat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => OrchestratorConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };
    if let Some(language) = cli.language {
        config.language = language;
    }
    if cli.offline {
        config.offline = true;
    }
    if !cli.symbols.is_empty() {
        config.symbols = cli.symbols.clone();
    }
    config.validate()?;

    let provider = if config.offline {
        CachedDataProvider::offline()
    } else {
        CachedDataProvider::new(Some(Box::new(YahooSource::new())), config.cache_ttl())
    };
    let engine = ExecutionEngine::new(config.engine_config(), Arc::new(provider));
    let synthesizer = AnthropicSynthesizer::from_env(&config.model, config.max_tokens)
        .context("the code generation service needs an API key")?;
    let mut session = Session::new(&config, Arc::new(synthesizer), Arc::new(engine));
    info!(session = %session.id(), model = %config.model, "ready");

    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            eprintln!("  .. {event}");
        }
    });

    let outcome = match cli.command {
        Command::Run { request } => {
            let reply = send(&mut session, &request, &tx).await?;
            print_reply(&reply);
            Ok(())
        }
        Command::Chat => chat(&mut session, &tx).await,
    };

    drop(tx);
    let _ = printer.await;
    outcome
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("quantloop=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Cancellation token tripped by Ctrl-C while this guard lives.
struct CtrlCScope {
    token: CancellationToken,
    watcher: tokio::task::JoinHandle<()>,
}

impl Drop for CtrlCScope {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

fn cancel_on_ctrl_c() -> CtrlCScope {
    let token = CancellationToken::new();
    let trigger = token.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    CtrlCScope { token, watcher }
}

/// Handle one message; Ctrl-C cancels it without ending the process.
async fn send(
    session: &mut Session,
    text: &str,
    progress: &dyn ProgressSink,
) -> Result<Reply, OrchestratorError> {
    let scope = cancel_on_ctrl_c();
    session.handle_message(text, progress, &scope.token).await
}

async fn rerun(session: &mut Session, progress: &dyn ProgressSink) -> Result<Reply, OrchestratorError> {
    let scope = cancel_on_ctrl_c();
    session.rerun_current(progress, &scope.token).await
}

async fn chat(session: &mut Session, progress: &dyn ProgressSink) -> anyhow::Result<()> {
    println!("quantloop chat. Describe an analysis, or /help for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;
        // Once a handler is registered SIGINT no longer ends the process,
        // so the idle prompt has to treat it as a quit.
        let next = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };
        let Some(line) = next else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/help" => {
                println!("/revert    step back to the previous version");
                println!("/rerun     run the current version again");
                println!("/versions  list every version");
                println!("/history   show the conversation");
                println!("/quit      leave");
            }
            "/revert" => match session.revert() {
                Ok(artifact) => println!("now at v{} ({})", artifact.version, artifact.origin),
                Err(e) => eprintln!("error: {e}"),
            },
            "/rerun" => match rerun(session, progress).await {
                Ok(reply) => print_reply(&reply),
                Err(e) => eprintln!("error: {e}"),
            },
            "/versions" => {
                let current = session.current().map(|a| a.version);
                for artifact in session.versions() {
                    let marker = if Some(artifact.version) == current { "*" } else { " " };
                    println!(
                        "{marker} v{:<3} {:<9} {}  {}",
                        artifact.version,
                        artifact.origin,
                        artifact.created_at.format("%H:%M:%S"),
                        artifact.description
                    );
                }
            }
            "/history" => {
                for turn in session.history() {
                    println!("[{}] {}", turn.role.as_str(), turn.content);
                }
            }
            request => match send(session, request, progress).await {
                Ok(reply) => print_reply(&reply),
                Err(e) => eprintln!("error: {e}"),
            },
        }
    }
    Ok(())
}

fn print_reply(reply: &Reply) {
    match reply {
        Reply::Conversational { text } => println!("{text}"),
        Reply::Clarification { question } => println!("? {question}"),
        Reply::Executed {
            explanation,
            artifact,
            result,
            executions,
            repairs,
        } => {
            if let Some(text) = explanation {
                println!("{text}");
            }
            println!(
                "v{} ({}) succeeded in {} ms after {} execution(s) and {} repair(s)",
                artifact.version,
                artifact.origin,
                result.duration.as_millis(),
                executions,
                repairs
            );
            if let Some(path) = &result.output_path {
                println!("output: {}", path.display());
            }
            if let Some(s) = &result.summary {
                println!(
                    "{}: {} rows, {} .. {}, min {:.4}, max {:.4}, last {:.4}",
                    s.signal_column, s.rows, s.first_date, s.last_date, s.min, s.max, s.last
                );
            }
            let stdout = result.stdout.trim();
            if !stdout.is_empty() {
                println!("{stdout}");
            }
        }
    }
}
