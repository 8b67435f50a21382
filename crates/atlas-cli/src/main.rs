//! atlas - in-process CLI for the task orchestration engine.
//!
//! Unlike a client/daemon split, every subcommand here runs the engine
//! directly inside the CLI invocation (Section 6: External Interfaces).
//! There is no background process to wait for and no socket to dial.

mod render;

use atlas_core::{Config, Task, TaskId, WorkspaceName};
use atlas_engine::executors::{AiInvoke, CheckLister, Deps};
use atlas_engine::pipeline::PipelineSpec;
use atlas_engine::retry::RetryPolicy;
use atlas_engine::runner;
use atlas_engine::store::Store;
use atlas_engine::templates::TemplateRegistry;
use atlas_engine::watcher::WatchSpec;
use atlas_engine::workspace::WorkspaceManager;
use atlas_engine::TaskEngine;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "atlas")]
#[command(about = "Task orchestration engine for AI-assisted development workflows")]
#[command(version)]
struct Cli {
    /// Path to the repository the engine operates against (defaults to cwd)
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    /// Config file path (key=value format)
    #[arg(long, global = true, env = "ATLAS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a workspace (an isolated git worktree)
    WorkspaceCreate {
        name: String,
        /// Base branch to fork from (defaults to the repo's default branch)
        #[arg(long)]
        base_branch: Option<String>,
    },
    /// List workspaces
    WorkspaceList,
    /// Retire a workspace: removes the worktree, keeps task history
    WorkspaceRetire { name: String },
    /// Destroy a workspace: removes the worktree and all metadata
    WorkspaceDestroy { name: String },
    /// Start a task in a workspace, running a template to completion or the
    /// next suspension point
    Start {
        workspace: String,
        /// Template name (e.g. "standard", "hotfix")
        #[arg(long, default_value = "standard")]
        template: String,
        /// Task description, used to render AI prompts
        description: String,
    },
    /// Resume driving a task's scheduler loop (after approve/reject/resume)
    Run { task_id: String },
    /// Show a task's current status and step history
    Status { task_id: String },
    /// List tasks, optionally filtered by workspace
    List {
        #[arg(long)]
        workspace: Option<String>,
    },
    /// Approve a task awaiting human review, advancing past the review step
    Approve { task_id: String },
    /// Reject a task awaiting human review, rewinding to an earlier step
    Reject {
        task_id: String,
        /// Step name to rewind to
        #[arg(long)]
        rewind_to: String,
        /// Feedback attached for the next AI invocation
        #[arg(long)]
        feedback: String,
    },
    /// Abandon a task permanently (worktree is preserved)
    Abandon { task_id: String },
    /// Resume a task stuck in a failure status back to `running`
    Resume { task_id: String },
    /// Poll CI checks for a task's open pull request without advancing it
    Watch { task_id: String },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("engine error: {0}")]
    Engine(#[from] atlas_engine::EngineError),
    #[error("workspace error: {0}")]
    Workspace(#[from] atlas_engine::workspace::WorkspaceError),
    #[error("store error: {0}")]
    Store(#[from] atlas_engine::store::StoreError),
    #[error("config error: {0}")]
    Config(#[from] atlas_core::config::ConfigError),
    #[error("unknown workspace: {0}")]
    UnknownWorkspace(String),
}

impl CliError {
    /// Exit code per Section 6: 2 for usage/config errors, 1 for everything
    /// else (cancellation is handled separately, via 130, at the call site).
    fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::UnknownWorkspace(_) => 2,
            Self::Engine(_) | Self::Workspace(_) | Self::Store(_) => 1,
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, CliError> {
    match path {
        Some(p) => Ok(Config::from_file(p)?),
        None => Ok(Config::default()),
    }
}

fn repo_root(repo: Option<PathBuf>) -> PathBuf {
    repo.unwrap_or_else(|| std::env::current_dir().expect("current directory is accessible"))
}

fn validation_spec(config: &Config) -> PipelineSpec {
    PipelineSpec {
        format_cmds: config.default_format_cmds.clone(),
        lint_cmds: config.default_lint_cmds.clone(),
        test_cmds: config.default_test_cmds.clone(),
        pre_commit_cmds: config.default_pre_commit_cmds.clone(),
    }
}

/// The AI CLI command atlas shells out to for `ai`/`sdd` steps, overridable
/// via `ATLAS_AI_CMD` (defaults to `claude`, matching the reference
/// implementation's own default agent).
fn ai_command() -> String {
    std::env::var("ATLAS_AI_CMD").unwrap_or_else(|_| "claude".to_string())
}

fn make_ai_invoke(workdir: PathBuf, timeout: Duration) -> impl Fn(String) -> Pin<Box<dyn std::future::Future<Output = Result<String, String>> + Send>> + Send + Sync {
    move |prompt: String| {
        let workdir = workdir.clone();
        let cmd = ai_command();
        Box::pin(async move {
            let cancel = CancellationToken::new();
            let outcome = runner::run(&cancel, &workdir, &cmd, &["-p", prompt.as_str()], timeout)
                .await
                .map_err(|e| e.to_string())?;
            if outcome.exit_code != 0 {
                return Err(format!("{cmd} exited {}: {}", outcome.exit_code, outcome.stderr));
            }
            Ok(outcome.stdout)
        })
    }
}

/// Parses `gh pr checks --json ...` output into `CheckResult`s. `gh`'s own
/// `bucket` field values (`pass`/`fail`/`pending`/`skipping`/`cancel`) map
/// directly onto `atlas_core::Bucket`'s snake_case serde representation.
fn make_check_lister(workdir: PathBuf, pr_number: u64, timeout: Duration) -> impl Fn() -> Pin<Box<dyn std::future::Future<Output = Result<Vec<atlas_core::CheckResult>, String>> + Send>> + Send + Sync {
    move || {
        let workdir = workdir.clone();
        Box::pin(async move {
            let cancel = CancellationToken::new();
            let pr_str = pr_number.to_string();
            let outcome = runner::run(
                &cancel,
                &workdir,
                "gh",
                &[
                    "pr",
                    "checks",
                    pr_str.as_str(),
                    "--json",
                    "name,state,bucket,startedAt,completedAt,description,workflow,link",
                ],
                timeout,
            )
            .await
            .map_err(|e| e.to_string())?;
            if outcome.exit_code != 0 {
                return Err(format!("gh pr checks exited {}: {}", outcome.exit_code, outcome.stderr));
            }
            parse_gh_checks(&outcome.stdout)
        })
    }
}

#[derive(serde::Deserialize)]
struct GhCheck {
    name: String,
    state: String,
    bucket: atlas_core::Bucket,
    #[serde(rename = "startedAt")]
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(rename = "completedAt")]
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
    description: Option<String>,
    workflow: Option<String>,
    link: Option<String>,
}

fn parse_gh_checks(stdout: &str) -> Result<Vec<atlas_core::CheckResult>, String> {
    let raw: Vec<GhCheck> = serde_json::from_str(stdout).map_err(|e| e.to_string())?;
    Ok(raw
        .into_iter()
        .map(|c| {
            let duration_ms = match (c.started_at, c.completed_at) {
                (Some(s), Some(e)) => Some((e - s).num_milliseconds().max(0) as u64),
                _ => None,
            };
            atlas_core::CheckResult {
                name: c.name,
                state: c.state,
                bucket: c.bucket,
                started_at: c.started_at,
                completed_at: c.completed_at,
                description: c.description,
                workflow: c.workflow,
                url: c.link,
                duration_ms,
            }
        })
        .collect())
}

fn load_workspace(store: &Store, name: &str) -> Result<atlas_core::Workspace, CliError> {
    store
        .load_workspace(&WorkspaceName::sanitize(name))
        .map_err(|_| CliError::UnknownWorkspace(name.to_string()))
}

async fn cmd_start(store: &Store, templates: &TemplateRegistry, config: &Config, repo: &std::path::Path, workspace_name: &str, template: &str, description: &str, cancel: &CancellationToken) -> Result<Task, CliError> {
    let ws = load_workspace(store, workspace_name)?;
    let engine = TaskEngine::new(store, templates);
    let task = engine.start(ws.name.clone(), template, description)?;
    drive(store, templates, config, repo, &task.id, &ws, cancel).await
}

async fn drive(store: &Store, templates: &TemplateRegistry, config: &Config, _repo: &std::path::Path, task_id: &TaskId, ws: &atlas_core::Workspace, cancel: &CancellationToken) -> Result<Task, CliError> {
    let engine = TaskEngine::new(store, templates);
    let workdir = PathBuf::from(&ws.worktree_path);
    let retry_policy = RetryPolicy::from_config(config);
    let validation = validation_spec(config);

    let task = store.load_task(task_id)?;
    let pr_number = task.variables.get("pr_number").and_then(serde_json::Value::as_u64).unwrap_or(0);
    let ai_fn = make_ai_invoke(workdir.clone(), Duration::from_secs(u64::from(config.ai_timeout_sec)));
    let ai_invoke: AiInvoke<'_> = &ai_fn;
    let checks_fn = make_check_lister(workdir.clone(), pr_number, Duration::from_secs(u64::from(config.network_timeout_sec)));
    let check_lister: CheckLister<'_> = &checks_fn;
    let ci_spec = WatchSpec::from_config(config, vec![]);

    let factory = |_t: &Task| Deps {
        cancel,
        workspace: ws,
        retry_policy,
        validation_spec: &validation,
        validation_timeout: Duration::from_secs(u64::from(config.validation_timeout_sec)),
        ci_spec: &ci_spec,
        ai_invoke,
        check_lister,
    };

    Ok(engine.run(cancel, task_id, &factory).await?)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = match load_config(cli.config.as_ref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(e.exit_code());
        }
    };
    let repo = repo_root(cli.repo);

    let mut atlas_home = config.atlas_home.clone();
    if atlas_home.is_relative() {
        atlas_home = repo.join(&atlas_home);
    }
    let store = Store::new(atlas_home);
    if let Err(e) = store.init() {
        eprintln!("error: failed to initialize state store: {e}");
        std::process::exit(2);
    }
    let templates = TemplateRegistry::new();

    // Section 6: SIGINT cancels the in-flight run rather than killing the
    // process outright, so a `git push`/AI invocation in progress gets torn
    // down cleanly through C3 instead of leaving a half-written worktree.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    let result = run_command(cli.command, &store, &templates, &config, &repo, &cancel).await;

    if cancel.is_cancelled() {
        eprintln!("cancelled");
        std::process::exit(130);
    }

    match result {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

async fn run_command(command: Command, store: &Store, templates: &TemplateRegistry, config: &Config, repo: &std::path::Path, cancel: &CancellationToken) -> Result<(), CliError> {
    match command {
        Command::WorkspaceCreate { name, base_branch } => {
            let manager = WorkspaceManager::new(store, repo.to_path_buf(), config.branch_prefix.clone());
            let ws = manager.create(&name, base_branch.as_deref())?;
            render::print_workspace_created(&ws);
        }
        Command::WorkspaceList => {
            let workspaces = store.list_workspaces()?;
            render::print_workspace_list(&workspaces);
        }
        Command::WorkspaceRetire { name } => {
            let manager = WorkspaceManager::new(store, repo.to_path_buf(), config.branch_prefix.clone());
            manager.retire(&WorkspaceName::sanitize(&name))?;
            println!("Retired workspace: {name}");
        }
        Command::WorkspaceDestroy { name } => {
            let manager = WorkspaceManager::new(store, repo.to_path_buf(), config.branch_prefix.clone());
            manager.destroy(&WorkspaceName::sanitize(&name))?;
            println!("Destroyed workspace: {name}");
        }
        Command::Start { workspace, template, description } => {
            let task = cmd_start(store, templates, config, repo, &workspace, &template, &description, cancel).await?;
            render::print_task_details(&task);
        }
        Command::Run { task_id } => {
            let task_id = TaskId::from_string(task_id);
            let task = store.load_task(&task_id)?;
            let ws = store.load_workspace(&task.workspace)?;
            let task = drive(store, templates, config, repo, &task_id, &ws, cancel).await?;
            render::print_task_details(&task);
        }
        Command::Status { task_id } => {
            let task = store.load_task(&TaskId::from_string(task_id))?;
            render::print_task_details(&task);
        }
        Command::List { workspace } => {
            let tasks = match workspace {
                Some(ws) => store.list_tasks_for_workspace(&WorkspaceName::sanitize(&ws))?,
                None => {
                    let mut all = Vec::new();
                    for ws in store.list_workspaces()? {
                        all.extend(store.list_tasks_for_workspace(&ws.name)?);
                    }
                    all
                }
            };
            render::print_task_list(&tasks);
        }
        Command::Approve { task_id } => {
            let engine = TaskEngine::new(store, templates);
            let task = engine.approve(&TaskId::from_string(task_id))?;
            render::print_task_details(&task);
        }
        Command::Reject { task_id, rewind_to, feedback } => {
            let engine = TaskEngine::new(store, templates);
            let task = engine.reject(&TaskId::from_string(task_id), &rewind_to, &feedback)?;
            render::print_task_details(&task);
        }
        Command::Abandon { task_id } => {
            let engine = TaskEngine::new(store, templates);
            let task = engine.abandon(&TaskId::from_string(task_id))?;
            render::print_task_details(&task);
        }
        Command::Resume { task_id } => {
            let engine = TaskEngine::new(store, templates);
            let task = engine.resume(&TaskId::from_string(task_id))?;
            render::print_task_details(&task);
        }
        Command::Watch { task_id } => {
            let task = store.load_task(&TaskId::from_string(task_id))?;
            let ws = store.load_workspace(&task.workspace)?;
            let pr_number = task.variables.get("pr_number").and_then(serde_json::Value::as_u64).unwrap_or(0);
            let workdir = PathBuf::from(&ws.worktree_path);
            let checks_fn = make_check_lister(workdir, pr_number, Duration::from_secs(u64::from(config.network_timeout_sec)));
            let ci_spec = WatchSpec::from_config(config, vec![]);
            let retry_policy = RetryPolicy::from_config(config);
            let result = atlas_engine::watcher::watch(cancel, &ci_spec, &retry_policy, checks_fn, |_, _| {}).await;
            match result {
                Ok(r) => println!("ci status: {:?} ({} checks, {}ms)", r.status, r.checks.len(), r.elapsed_ms),
                Err(e) => eprintln!("ci watch error: {e}"),
            }
        }
    }
    Ok(())
}
