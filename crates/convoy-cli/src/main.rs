//! convoy CLI — drive workflows, resume them, chat, or coordinate merges.
//!
//! Exit codes: 0 workflow complete, 2 workflow failed, 3 escalation
//! required, 10+ fatal configuration errors.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use convoy::budget::BudgetTracker;
use convoy::chat::{ChatSession, ContextManager, SessionConfig};
use convoy::config::UserConfig;
use convoy::conflict::{DetectionPipeline, RecommendedAction};
use convoy::gates::GateEngine;
use convoy::llm::provider::HttpProvider;
use convoy::llm::{EstimatingCounter, InterceptorConfig, LlmInterceptor};
use convoy::model::types::{AgentId, BranchRef, BudgetId, WorkflowId};
use convoy::resolution::{FlakyTestHandler, ResolutionPipeline, SelfCritic};
use convoy::store::EventStore;
use convoy::vcs::Vcs;
use convoy::workflow::spec::parse_workflow_file;
use convoy::workflow::{CommandRunner, StateStore, WorkflowExecutor};

// ---------------------------------------------------------------------------
// Exit codes
// ---------------------------------------------------------------------------

const EXIT_OK: u8 = 0;
const EXIT_FAILED: u8 = 2;
const EXIT_ESCALATE: u8 = 3;
const EXIT_CONFIG: u8 = 10;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "convoy", version, about = "Multi-agent code-change orchestrator")]
struct Cli {
    /// Working directory (defaults to the current directory).
    #[arg(long, global = true)]
    workdir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a workflow definition against a task.
    Run {
        /// Path to the workflow YAML.
        workflow: PathBuf,
        /// Task description handed to the agent.
        task: String,
        /// Agent runner binary.
        #[arg(long, default_value = "convoy-agent")]
        runner: String,
        /// Per-phase runner timeout, seconds.
        #[arg(long, default_value_t = 3600)]
        runner_timeout: u64,
    },

    /// Resume an interrupted workflow.
    Resume {
        /// The workflow id (from `state_<id>.json`).
        workflow_id: String,
        /// Path to the workflow YAML.
        #[arg(long)]
        workflow: PathBuf,
        /// Agent runner binary.
        #[arg(long, default_value = "convoy-agent")]
        runner: String,
        /// Per-phase runner timeout, seconds.
        #[arg(long, default_value_t = 3600)]
        runner_timeout: u64,
    },

    /// Interactive chat session with checkpoints and recovery.
    Chat {
        /// Session id; reuse one to recover a previous session.
        #[arg(long, default_value = "default")]
        session: String,
        /// Token budget for the session.
        #[arg(long, default_value_t = 1_000_000)]
        budget: u64,
    },

    /// Detect and resolve conflicts across agent branches.
    Merge {
        /// Agent branches, as `agent-id=branch` pairs.
        branches: Vec<String>,
        /// Base branch to merge into.
        #[arg(long, default_value = "main")]
        base: String,
        /// Detect only; skip resolution.
        #[arg(long)]
        detect_only: bool,
    },
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let workdir = cli
        .workdir
        .clone()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let code = match dispatch(cli, workdir) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("convoy: {err:#}");
            EXIT_CONFIG
        }
    };
    ExitCode::from(code)
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn dispatch(cli: Cli, workdir: PathBuf) -> Result<u8> {
    match cli.command {
        Command::Run {
            workflow,
            task,
            runner,
            runner_timeout,
        } => run_workflow(&workdir, &workflow, &task, &runner, runner_timeout),
        Command::Resume {
            workflow_id,
            workflow,
            runner,
            runner_timeout,
        } => resume_workflow(&workdir, &workflow_id, &workflow, &runner, runner_timeout),
        Command::Chat { session, budget } => chat(&workdir, &session, budget),
        Command::Merge {
            branches,
            base,
            detect_only,
        } => merge(&workdir, &branches, &base, detect_only),
    }
}

// ---------------------------------------------------------------------------
// run / resume
// ---------------------------------------------------------------------------

fn build_executor(
    workdir: &PathBuf,
    workflow_path: &PathBuf,
    runner: &str,
    runner_timeout: u64,
) -> Result<WorkflowExecutor<CommandRunner>> {
    let spec = parse_workflow_file(workflow_path)
        .with_context(|| format!("loading workflow '{}'", workflow_path.display()))?;
    let runner = CommandRunner::new(
        runner,
        workdir.clone(),
        Duration::from_secs(runner_timeout),
    );
    let state_store = StateStore::new(workdir);
    let gate_engine = GateEngine::new(workdir.clone());
    Ok(WorkflowExecutor::new(spec, runner, state_store, gate_engine))
}

fn run_workflow(
    workdir: &PathBuf,
    workflow_path: &PathBuf,
    task: &str,
    runner: &str,
    runner_timeout: u64,
) -> Result<u8> {
    let mut executor = build_executor(workdir, workflow_path, runner, runner_timeout)?;
    let result = executor.run(task);
    report_workflow(&result);
    Ok(if result.is_success() { EXIT_OK } else { EXIT_FAILED })
}

fn resume_workflow(
    workdir: &PathBuf,
    workflow_id: &str,
    workflow_path: &PathBuf,
    runner: &str,
    runner_timeout: u64,
) -> Result<u8> {
    let workflow_id = WorkflowId::new(workflow_id).context("invalid workflow id")?;
    let mut executor = build_executor(workdir, workflow_path, runner, runner_timeout)?;
    let result = executor.resume(&workflow_id);
    report_workflow(&result);
    Ok(if result.is_success() { EXIT_OK } else { EXIT_FAILED })
}

fn report_workflow(result: &convoy::workflow::WorkflowResult) {
    println!("workflow: {}", result.workflow_id);
    println!("status:   {:?}", result.status);
    println!("phases:   {}", result.phases_completed.join(", "));
    println!("duration: {:.1}s", result.total_duration_seconds);
    if let Some(error) = &result.error_message {
        println!("error:    {error}");
    }
}

// ---------------------------------------------------------------------------
// chat
// ---------------------------------------------------------------------------

fn build_interceptor(
    workdir: &PathBuf,
    store: &Arc<EventStore>,
    budget: u64,
    budget_name: &str,
) -> Result<(Arc<BudgetTracker>, BudgetId, LlmInterceptor)> {
    let endpoint = std::env::var("CONVOY_LLM_ENDPOINT")
        .context("CONVOY_LLM_ENDPOINT is not set (the chat completions URL)")?;
    let api_key = std::env::var("CONVOY_LLM_API_KEY").unwrap_or_default();

    let budgets_db = workdir.join(".orchestrator").join("budgets.db");
    let tracker = Arc::new(BudgetTracker::open(&budgets_db, Arc::clone(store))?);
    let budget_id = BudgetId::new(budget_name).context("invalid budget id")?;
    if tracker.get_status(&budget_id)?.is_none() {
        tracker.create_budget(&budget_id, budget, None)?;
    }

    let provider = HttpProvider::new(endpoint, api_key, Duration::from_secs(300))
        .map_err(|e| anyhow::anyhow!("building HTTP provider: {e}"))?;
    let interceptor = LlmInterceptor::new(
        Arc::clone(&tracker),
        Box::new(EstimatingCounter::default()),
        Box::new(provider),
        budget_id.clone(),
        InterceptorConfig::default(),
    );
    Ok((tracker, budget_id, interceptor))
}

fn chat(workdir: &PathBuf, session_id: &str, budget: u64) -> Result<u8> {
    let db_path = workdir.join(".orchestrator").join("events.db");
    std::fs::create_dir_all(db_path.parent().context("db path has no parent")?)?;
    let store = Arc::new(EventStore::open(&db_path)?);

    let (tracker, budget_id, interceptor) = build_interceptor(workdir, &store, budget, "chat")?;
    let config = SessionConfig {
        model: std::env::var("CONVOY_LLM_MODEL").unwrap_or_else(|_| "convoy-chat-default".to_owned()),
        ..SessionConfig::default()
    };
    let context_manager =
        ContextManager::new(Box::new(EstimatingCounter::default()), config.clone());

    let mut session = ChatSession::new(
        session_id,
        store,
        tracker,
        budget_id,
        interceptor,
        context_manager,
        config,
    )
    .context("invalid session id")?;
    session.recover()?;
    println!(
        "convoy chat — session '{session_id}' ({} message(s) recovered). /status for details, ctrl-d to exit.",
        session.messages().len()
    );

    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        println!("{}", session.send(line));
    }
    Ok(EXIT_OK)
}

// ---------------------------------------------------------------------------
// merge
// ---------------------------------------------------------------------------

fn parse_agent_branches(pairs: &[String]) -> Result<BTreeMap<AgentId, BranchRef>> {
    if pairs.len() < 2 {
        bail!("need at least two agent branches, as agent-id=branch pairs");
    }
    let mut map = BTreeMap::new();
    for pair in pairs {
        let Some((agent, branch)) = pair.split_once('=') else {
            bail!("expected agent-id=branch, got '{pair}'");
        };
        map.insert(
            AgentId::new(agent).context("invalid agent id")?,
            BranchRef::new(branch).context("invalid branch ref")?,
        );
    }
    Ok(map)
}

fn merge(workdir: &PathBuf, pairs: &[String], base: &str, detect_only: bool) -> Result<u8> {
    let user_config = UserConfig::load()?;
    let base = BranchRef::new(base).context("invalid base branch")?;
    let agents = parse_agent_branches(pairs)?;
    let branches: Vec<BranchRef> = agents.values().cloned().collect();
    let vcs = Vcs::new(workdir.clone());

    let detection = DetectionPipeline::new(&vcs, base.clone()).run(&branches, &[])?;
    println!("{}", detection.summary());

    match detection.recommended_action {
        RecommendedAction::FastMerge => {
            println!("no conflicts detected; branches can merge directly");
            return Ok(EXIT_OK);
        }
        RecommendedAction::Escalate => {
            println!("escalation required; a human must resolve this merge");
            return Ok(EXIT_ESCALATE);
        }
        RecommendedAction::AutoResolve => {}
    }
    if detect_only {
        println!("conflicts detected (auto-resolvable); re-run without --detect-only");
        return Ok(EXIT_ESCALATE);
    }
    if !user_config.llm_enabled() {
        tracing::info!("model-assisted resolution disabled by configuration");
    }

    let mut flaky = FlakyTestHandler::new(workdir.join(".flaky_tests.json"));
    let critic = SelfCritic::new(None, "disabled");
    let pipeline = ResolutionPipeline::new(vcs, base, user_config, critic);
    let tasks = BTreeMap::new();
    let resolution = pipeline.resolve(&detection, &agents, &tasks, &mut flaky);
    let _ = flaky.save();

    if let Some(winner) = &resolution.winning_candidate {
        println!(
            "resolved: candidate {} via {} (score {:.2}) on branch {}",
            winner.id,
            winner.strategy.as_str(),
            winner.scores.total,
            winner.branch
        );
        Ok(EXIT_OK)
    } else {
        println!(
            "escalation required: {}",
            resolution
                .escalation_reason
                .as_deref()
                .unwrap_or("unknown reason")
        );
        Ok(EXIT_ESCALATE)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
