//! CLI subcommands: init, queue (add, load, list, status, validate, verify,
//! repair, execute, clear, reset, schema), completions.

use crate::actions::script::ScriptExecutor;
use crate::actions::{ActionExecutor, ActionRegistry};
use crate::core::config::{self, AdvisorEngine, Config};
use crate::core::error::EngineError;
use crate::core::executor::{self, ExecuteConfig};
use crate::core::parser::{self, TaskSpec};
use crate::core::repair::{
    self, HttpReasoningService, RepairAdvisor, RepairOutcome, RepairProposal,
};
use crate::core::state::QueueStore;
use crate::core::types::*;
use crate::core::validator::validate_queue;
use crate::core::verifier::verify_queue;
use clap::{CommandFactory, Parser, Subcommand};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "docqueue",
    version,
    about = "Task queue execution engine for document-management automation"
)]
pub struct Cli {
    /// Config file
    #[arg(
        long,
        global = true,
        env = "DOCQUEUE_CONFIG",
        default_value = config::DEFAULT_CONFIG_FILE
    )]
    pub config: PathBuf,

    /// Queue store file (overrides config)
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a default docqueue.toml and store directory
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Manage and run the task queue
    #[command(subcommand)]
    Queue(QueueCommands),

    /// Print shell completions
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// Append one task
    Add {
        /// Action name, e.g. create, move, tag.add
        action: Action,

        /// Params as a JSON object
        params: Option<String>,

        /// Extra param as key=value (value parsed as JSON when possible)
        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        param: Vec<String>,

        /// Explicit dependencies, comma separated
        #[arg(long, value_delimiter = ',')]
        depends_on: Vec<u32>,
    },

    /// Append tasks from JSON or YAML files (globs allowed, `-` for stdin)
    Load {
        #[arg(required = true)]
        files: Vec<String>,
    },

    /// List every task
    List {
        #[arg(long)]
        json: bool,
    },

    /// Show tasks that still need attention
    Status {
        /// Include completed tasks
        #[arg(long)]
        all: bool,

        #[arg(long)]
        json: bool,
    },

    /// Check params and dependencies without running anything
    Validate {
        #[arg(long)]
        json: bool,
    },

    /// Look up referenced records, databases and groups
    Verify {
        #[arg(long)]
        json: bool,
    },

    /// Ask the reasoning service for a corrected queue
    Repair {
        /// Persist the proposal
        #[arg(long)]
        apply: bool,

        /// anthropic or openai (default: config)
        #[arg(long)]
        engine: Option<AdvisorEngine>,

        /// Use a saved proposal instead of asking for a new one
        #[arg(long, value_name = "PROPOSAL_JSON")]
        from: Option<PathBuf>,

        #[arg(long)]
        json: bool,
    },

    /// Run pending tasks
    Execute {
        /// sequential, parallel or transactional (default: config)
        mode: Option<ExecutionMode>,

        /// Show what would run without dispatching
        #[arg(long)]
        dry_run: bool,

        /// Parallel worker bound (default: config)
        #[arg(long)]
        workers: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Remove tasks from the store
    Clear {
        #[arg(long, default_value = "completed")]
        scope: ClearScope,
    },

    /// Return failed tasks to pending
    Reset {
        indices: Vec<u32>,

        /// Reset every failed task
        #[arg(long, conflicts_with = "indices")]
        failed: bool,
    },

    /// Print the JSON Schema of an importable queue file
    Schema,
}

/// Dispatch a parsed command line.
pub fn dispatch(cli: Cli) -> Result<(), String> {
    match cli.command {
        Commands::Init { path } => cmd_init(&path),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "docqueue", &mut std::io::stdout());
            Ok(())
        }
        Commands::Queue(cmd) => {
            let mut cfg = config::load_config(&cli.config)?;
            if let Some(store) = cli.store {
                cfg.store.path = store;
            }
            dispatch_queue(cmd, &cfg)
        }
    }
}

fn dispatch_queue(cmd: QueueCommands, cfg: &Config) -> Result<(), String> {
    match cmd {
        QueueCommands::Add {
            action,
            params,
            param,
            depends_on,
        } => cmd_add(cfg, action, params.as_deref(), &param, depends_on),
        QueueCommands::Load { files } => cmd_load(cfg, &files),
        QueueCommands::List { json } => cmd_list(cfg, json),
        QueueCommands::Status { all, json } => cmd_status(cfg, all, json),
        QueueCommands::Validate { json } => cmd_validate(cfg, json),
        QueueCommands::Verify { json } => cmd_verify(cfg, json),
        QueueCommands::Repair {
            apply,
            engine,
            from,
            json,
        } => cmd_repair(cfg, apply, engine, from.as_deref(), json),
        QueueCommands::Execute {
            mode,
            dry_run,
            workers,
            json,
        } => cmd_execute(cfg, mode, dry_run, workers, json),
        QueueCommands::Clear { scope } => cmd_clear(cfg, scope),
        QueueCommands::Reset { indices, failed } => cmd_reset(cfg, &indices, failed),
        QueueCommands::Schema => cmd_schema(),
    }
}

fn open_store(cfg: &Config) -> QueueStore {
    QueueStore::new(&cfg.store.path)
        .with_lock_timeout(cfg.store.lock_timeout())
        .with_event_log(cfg.store.event_log)
}

fn action_executor(cfg: &Config) -> Arc<dyn ActionExecutor> {
    Arc::new(ActionRegistry::scripted(ScriptExecutor::new(
        cfg.executor.command.clone(),
    )))
}

fn runtime() -> Result<tokio::runtime::Runtime, String> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("cannot start runtime: {}", e))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), String> {
    let s = serde_json::to_string_pretty(value).map_err(|e| format!("JSON error: {}", e))?;
    println!("{}", s);
    Ok(())
}

fn cmd_init(path: &Path) -> Result<(), String> {
    let config_path = path.join(config::DEFAULT_CONFIG_FILE);
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()));
    }

    let store_path = path.join(config::StoreConfig::default().path);
    if let Some(store_dir) = store_path.parent() {
        std::fs::create_dir_all(store_dir)
            .map_err(|e| format!("cannot create store dir: {}", e))?;
    }
    std::fs::write(&config_path, config::template())
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;

    println!("Initialized docqueue at {}", path.display());
    println!("  Created: {}", config_path.display());
    if let Some(store_dir) = store_path.parent() {
        println!("  Created: {}/", store_dir.display());
    }
    Ok(())
}

/// `key=value`; the value is JSON if it parses, else a plain string.
fn parse_param(pair: &str) -> Result<(String, serde_json::Value), String> {
    let (key, raw) = pair
        .split_once('=')
        .ok_or_else(|| format!("invalid --param '{}' (expected key=value)", pair))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("invalid --param '{}' (empty key)", pair));
    }
    let value =
        serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

fn cmd_add(
    cfg: &Config,
    action: Action,
    params_json: Option<&str>,
    extra: &[String],
    depends_on: Vec<u32>,
) -> Result<(), String> {
    let mut params: Params = match params_json {
        Some(s) => serde_json::from_str(s)
            .map_err(|e| format!("params must be a JSON object: {}", e))?,
        None => Params::new(),
    };
    for pair in extra {
        let (k, v) = parse_param(pair)?;
        params.insert(k, v);
    }

    let spec = TaskSpec {
        depends_on,
        ..TaskSpec::new(action, params)
    };
    let indices = open_store(cfg).append(vec![spec]).map_err(|e| e.to_string())?;
    for index in indices {
        println!("Added task {} ({})", index, action);
    }
    Ok(())
}

/// Expand `-`, plain paths and glob patterns, in argument order.
fn expand_inputs(inputs: &[String]) -> Result<Vec<String>, String> {
    let mut out = Vec::new();
    for input in inputs {
        if input == "-" || !input.contains(['*', '?', '[']) {
            out.push(input.clone());
            continue;
        }
        let mut matched: Vec<PathBuf> = glob::glob(input)
            .map_err(|e| format!("invalid pattern '{}': {}", input, e))?
            .filter_map(Result::ok)
            .collect();
        if matched.is_empty() {
            return Err(format!("no files match '{}'", input));
        }
        matched.sort();
        out.extend(matched.into_iter().map(|p| p.display().to_string()));
    }
    Ok(out)
}

fn cmd_load(cfg: &Config, inputs: &[String]) -> Result<(), String> {
    let store = open_store(cfg);
    for input in expand_inputs(inputs)? {
        let specs = if input == "-" {
            let mut content = String::new();
            std::io::stdin()
                .read_to_string(&mut content)
                .map_err(|e| format!("cannot read stdin: {}", e))?;
            parser::parse_task_specs(&content).map_err(|e| format!("stdin: {}", e))?
        } else {
            parser::parse_queue_file(Path::new(&input))?
        };
        if specs.is_empty() {
            println!("{}: no tasks", input);
            continue;
        }
        let indices = store.import(specs).map_err(|e| e.to_string())?;
        println!(
            "Loaded {} task(s) from {} ({})",
            indices.len(),
            input,
            index_span(&indices)
        );
    }
    Ok(())
}

fn index_span(indices: &[u32]) -> String {
    match (indices.first(), indices.last()) {
        (Some(a), Some(b)) if a == b => format!("#{}", a),
        (Some(a), Some(b)) => format!("#{}-#{}", a, b),
        _ => "none".to_string(),
    }
}

fn print_task(task: &Task) {
    let mut params = serde_json::to_string(&task.params).unwrap_or_default();
    if params.chars().count() > 72 {
        params = params.chars().take(69).collect::<String>() + "...";
    }
    let deps = task.dependencies();
    let deps = if deps.is_empty() {
        String::new()
    } else {
        let list: Vec<String> = deps.iter().map(u32::to_string).collect();
        format!("  <- {}", list.join(","))
    };
    println!(
        "  {:>4}  {:<9}  {:<10}  {}{}",
        task.index, task.status, task.action, params, deps
    );
    if let Some(err) = &task.error {
        println!("        error: {}", err);
    }
}

fn cmd_list(cfg: &Config, json: bool) -> Result<(), String> {
    let queue = open_store(cfg).load().map_err(|e| e.to_string())?;
    if json {
        return print_json(&queue.tasks);
    }
    if queue.tasks.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }
    queue.tasks.iter().for_each(print_task);
    Ok(())
}

fn cmd_status(cfg: &Config, all: bool, json: bool) -> Result<(), String> {
    let queue = open_store(cfg).load().map_err(|e| e.to_string())?;
    let shown: Vec<&Task> = queue
        .tasks
        .iter()
        .filter(|t| all || t.status != TaskStatus::Completed)
        .collect();
    if json {
        return print_json(&shown);
    }

    shown.iter().for_each(|t| print_task(t));
    println!(
        "pending: {}, running: {}, completed: {}, failed: {} (next index {})",
        queue.count(TaskStatus::Pending),
        queue.count(TaskStatus::Running),
        queue.count(TaskStatus::Completed),
        queue.count(TaskStatus::Failed),
        queue.next_index
    );
    Ok(())
}

fn print_issues(issues: &[Issue]) {
    for issue in issues {
        match issue.task_index {
            Some(i) => eprintln!("  ERROR: task {}: {} [{}]", i, issue.message, issue.kind),
            None => eprintln!("  ERROR: {} [{}]", issue.message, issue.kind),
        }
    }
}

fn cmd_validate(cfg: &Config, json: bool) -> Result<(), String> {
    let queue = open_store(cfg).load().map_err(|e| e.to_string())?;
    let report = validate_queue(&queue);
    if json {
        print_json(&report)?;
    } else if report.valid {
        println!(
            "OK: {} task(s) to run ({})",
            queue.count(TaskStatus::Pending),
            report.fingerprint
        );
    } else {
        print_issues(&report.errors);
    }

    if report.valid {
        Ok(())
    } else {
        Err(format!("{} validation error(s)", report.errors.len()))
    }
}

fn cmd_verify(cfg: &Config, json: bool) -> Result<(), String> {
    let queue = open_store(cfg).load().map_err(|e| e.to_string())?;
    let actions = action_executor(cfg);
    let report = verify_queue(&queue, actions.as_ref());
    if json {
        print_json(&report)?;
    } else {
        print_issues(&report.issues);
        println!(
            "Checked {} identifier(s), {} path(s), {} database(s); {} reference(s) deferred.",
            report.checked.identifiers,
            report.checked.paths,
            report.checked.databases,
            report.skipped
        );
    }

    if report.valid {
        Ok(())
    } else {
        Err(format!("{} verification issue(s)", report.issues.len()))
    }
}

fn print_proposal(proposal: &RepairProposal) {
    println!("Proposal from {} (base {})", proposal.engine, proposal.base_fingerprint);
    if !proposal.rationale.is_empty() {
        println!();
        for line in proposal.rationale.lines() {
            println!("  {}", line);
        }
        println!();
    }
    for (pos, spec) in proposal.tasks.iter().enumerate() {
        let params = serde_json::to_string(&spec.params).unwrap_or_default();
        let label = spec.index.unwrap_or(pos as u32 + 1);
        println!("  {:>4}  {:<10}  {}", label, spec.action, params);
    }
    if !proposal.validation.valid {
        println!("Proposal is structurally invalid:");
        print_issues(&proposal.validation.errors);
    }
}

fn apply(store: &QueueStore, proposal: &RepairProposal) -> Result<(), String> {
    let applied = repair::apply_proposal(store, proposal).map_err(|e| e.to_string())?;
    println!(
        "Applied repair: retired {}, appended {}.",
        index_span(&applied.retired),
        index_span(&applied.appended)
    );
    Ok(())
}

fn cmd_repair(
    cfg: &Config,
    apply_it: bool,
    engine: Option<AdvisorEngine>,
    from: Option<&Path>,
    json: bool,
) -> Result<(), String> {
    let store = open_store(cfg);

    if let Some(path) = from {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        let proposal: RepairProposal = serde_json::from_str(&content)
            .map_err(|e| format!("{}: invalid proposal: {}", path.display(), e))?;
        if json {
            print_json(&proposal)?;
        } else {
            print_proposal(&proposal);
        }
        return if apply_it { apply(&store, &proposal) } else { Ok(()) };
    }

    let queue = store.load().map_err(|e| e.to_string())?;
    let mut issues = validate_queue(&queue).errors;
    issues.extend(verify_queue(&queue, action_executor(cfg).as_ref()).issues);
    if issues.is_empty() && queue.count(TaskStatus::Failed) == 0 {
        println!("Nothing to repair.");
        return Ok(());
    }

    let advisor_cfg = match engine {
        Some(e) => cfg.advisor.with_engine(e),
        None => cfg.advisor.clone(),
    };
    let outcome = match HttpReasoningService::from_config(&advisor_cfg) {
        Ok(service) => {
            let advisor = RepairAdvisor::new(Arc::new(service));
            runtime()?.block_on(advisor.propose(&queue, &issues))
        }
        Err(e) => RepairOutcome::Unavailable {
            reason: e.to_string(),
        },
    };

    match outcome {
        RepairOutcome::Proposed(proposal) => {
            if json {
                print_json(&proposal)?;
            } else {
                print_proposal(&proposal);
            }
            if apply_it {
                apply(&store, &proposal)
            } else {
                if !json {
                    println!("Not applied. Re-run with --apply to replace the unfinished tasks.");
                }
                Ok(())
            }
        }
        RepairOutcome::Unavailable { reason } => {
            println!("No proposal: {}", reason);
            if apply_it {
                Err("no repair proposal to apply".to_string())
            } else {
                Ok(())
            }
        }
    }
}

fn print_run(report: &RunReport) {
    for t in &report.tasks {
        let wave = t.wave.map(|w| format!("w{}", w)).unwrap_or_default();
        let took = t
            .duration_ms
            .map(|ms| format!(" ({:.2}s)", ms as f64 / 1000.0))
            .unwrap_or_default();
        println!(
            "  {:>4}  {:<3}  {:<10}  {}{}",
            t.index, wave, t.action, t.status, took
        );
        if report.dry_run {
            println!(
                "        params: {}",
                serde_json::to_string(&t.params).unwrap_or_default()
            );
        }
        if let Some(err) = &t.error {
            println!("        error: {}", err);
        }
    }
}

fn cmd_execute(
    cfg: &Config,
    mode: Option<ExecutionMode>,
    dry_run: bool,
    workers: Option<usize>,
    json: bool,
) -> Result<(), String> {
    let max_workers = workers.unwrap_or(cfg.executor.max_workers);
    if max_workers == 0 {
        return Err("--workers must be at least 1".to_string());
    }
    let store = open_store(cfg);
    let exec = ExecuteConfig {
        store: &store,
        actions: action_executor(cfg),
        mode: mode.unwrap_or(cfg.executor.default_mode),
        dry_run,
        max_workers,
    };

    let report = match runtime()?.block_on(executor::execute(&exec)) {
        Ok(report) => report,
        Err(EngineError::Invalid(validation)) => {
            print_issues(&validation.errors);
            return Err(format!(
                "queue is invalid ({} error(s)); nothing was run",
                validation.errors.len()
            ));
        }
        Err(e) => return Err(e.to_string()),
    };

    if json {
        print_json(&report)?;
    } else {
        print_run(&report);
        println!();
        if report.dry_run {
            println!("Dry run: {} task(s) would run.", report.tasks.len());
        } else {
            println!(
                "Run {} ({}): {} completed, {} failed, {} skipped.",
                report.run_id,
                report.mode,
                report.summary.completed,
                report.summary.failed,
                report.summary.skipped
            );
        }
    }

    if report.dry_run {
        return Ok(());
    }
    if !report.success {
        return Err(format!("{} task(s) failed", report.summary.failed));
    }
    if !report.drained() {
        return Err(format!("{} task(s) left pending", report.summary.skipped));
    }
    Ok(())
}

fn cmd_clear(cfg: &Config, scope: ClearScope) -> Result<(), String> {
    let removed = open_store(cfg).clear(scope).map_err(|e| e.to_string())?;
    println!("Removed {} {} task(s).", removed.len(), scope);
    Ok(())
}

fn cmd_reset(cfg: &Config, indices: &[u32], all_failed: bool) -> Result<(), String> {
    if indices.is_empty() && !all_failed {
        return Err("give task indices or --failed".to_string());
    }
    let selection = if all_failed { None } else { Some(indices) };
    let reset = open_store(cfg).reset(selection).map_err(|e| e.to_string())?;
    println!("Reset {} task(s) to pending.", reset.len());
    Ok(())
}

fn cmd_schema() -> Result<(), String> {
    print_json(&parser::queue_file_schema())
}
