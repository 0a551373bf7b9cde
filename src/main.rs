mod runner;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weft_core::config::WeftConfig;
use weft_core::event::{EventBus, WorkflowEvent};
use weft_core::traits::RunStore;
use weft_core::types::{EntityRef, RunId};
use weft_engine::{
    ApprovalBroker, ApprovalDecision, BranchRequest, DagOverrides, EventCaptor, Orchestrator,
    RunControl, RunReport, WorkflowRegistry,
};
use weft_store::SqliteStore;

use crate::runner::CommandRunner;

#[derive(Parser)]
#[command(name = "weft", version, about = "Research workflow orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weft.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List workflow modes and DAG templates
    Templates,
    /// Create a run and execute it
    Run {
        /// Workflow mode (see `weft templates`)
        #[arg(short, long)]
        mode: Option<String>,
        /// Shell command executed for every node
        #[arg(long, env = "WEFT_EXEC")]
        exec: String,
        /// Retry budget for every node
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Require approval before these nodes run
        #[arg(long = "approve")]
        approval_nodes: Vec<String>,
        /// Approve every gate without prompting
        #[arg(long, short = 'y')]
        yes: bool,
        /// The task description
        #[arg(trailing_var_arg = true, required = true)]
        task: Vec<String>,
    },
    /// Continue a paused run
    Continue {
        run_id: String,
        #[arg(long, env = "WEFT_EXEC")]
        exec: String,
        #[arg(long, short = 'y')]
        yes: bool,
        /// Guidance handed to retried attempts
        #[arg(long)]
        feedback: Option<String>,
        /// Take over a run left executing by a process that died
        #[arg(long)]
        recover: bool,
    },
    /// Re-execute a run from a node, keeping upstream results
    Play {
        run_id: String,
        node_id: String,
        #[arg(long, env = "WEFT_EXEC")]
        exec: String,
        /// Context variables to override (KEY=JSON)
        #[arg(long = "set")]
        overrides: Vec<String>,
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Fork a run at a node into a new run
    Branch {
        run_id: String,
        node_id: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        hypothesis: String,
        /// Context variables to change in the branch (KEY=JSON)
        #[arg(long = "set")]
        modifications: Vec<String>,
    },
    /// Compare two runs node by node
    Compare { run_a: String, run_b: String },
    /// List recent runs
    List {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show a run with its nodes
    Status { run_id: String },
    /// Show the audited transitions of a run or one of its nodes
    History {
        run_id: String,
        #[arg(long)]
        node: Option<String>,
    },
    /// List checkpoints of a run
    Checkpoints { run_id: String },
    /// Print the captured execution event tree of a run
    Events { run_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weft=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Commands::Templates = cli.command {
        print_templates();
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    let workspace = config.workspace_dir();
    std::fs::create_dir_all(&workspace)?;
    let store: Arc<dyn RunStore> = Arc::new(SqliteStore::open(&config.database_path())?);
    let event_bus = Arc::new(EventBus::default());
    let orchestrator = Orchestrator::new(config.clone(), store.clone(), event_bus.clone());

    match cli.command {
        Commands::Templates => {}
        Commands::Run {
            mode,
            exec,
            max_attempts,
            approval_nodes,
            yes,
            task,
        } => {
            let mode = mode.unwrap_or_else(|| config.engine.default_mode.clone());
            let overrides = DagOverrides {
                max_attempts,
                approval_nodes,
                ..Default::default()
            };
            let run = orchestrator.create_run(&mode, &task.join(" "), overrides)?;
            println!("Run {} created ({})", run.id, mode);
            let control = RunControl::new();
            let report = drive(&orchestrator, &control, yes, |control| {
                orchestrator.execute(&run.id, Arc::new(CommandRunner::new(exec)), control)
            })
            .await?;
            print_report(&report);
        }
        Commands::Continue {
            run_id,
            exec,
            yes,
            feedback,
            recover,
        } => {
            let run_id = RunId::from_str(&run_id);
            if recover && orchestrator.recover(&run_id)? {
                println!("Recovered interrupted run {}", run_id);
            }
            let control = RunControl::new();
            if let Some(feedback) = feedback {
                control.set_feedback(feedback);
            }
            let report = drive(&orchestrator, &control, yes, |control| {
                orchestrator.execute(&run_id, Arc::new(CommandRunner::new(exec)), control)
            })
            .await?;
            print_report(&report);
        }
        Commands::Play {
            run_id,
            node_id,
            exec,
            overrides,
            yes,
        } => {
            let run_id = RunId::from_str(&run_id);
            let overrides = parse_assignments(&overrides)?;
            let control = RunControl::new();
            let report = drive(&orchestrator, &control, yes, |control| {
                orchestrator.play_from(
                    &run_id,
                    &node_id,
                    Some(&overrides),
                    Arc::new(CommandRunner::new(exec)),
                    control,
                )
            })
            .await?;
            print_report(&report);
        }
        Commands::Branch {
            run_id,
            node_id,
            name,
            hypothesis,
            modifications,
        } => {
            let req = BranchRequest {
                parent_run_id: RunId::from_str(&run_id),
                branch_point: node_id,
                name,
                hypothesis,
                modifications: parse_assignments(&modifications)?,
            };
            let branch_id = orchestrator.branches().create_branch(&req)?;
            println!("Branch {} created from {} at {}", branch_id, run_id, req.branch_point);
        }
        Commands::Compare { run_a, run_b } => {
            let cmp = orchestrator
                .branches()
                .compare_branches(&RunId::from_str(&run_a), &RunId::from_str(&run_b))?;
            println!("{} ({}) vs {} ({})", cmp.run_a, cmp.state_a, cmp.run_b, cmp.state_b);
            println!("  identical nodes: {}", cmp.identical);
            for diff in &cmp.diffs {
                println!(
                    "  {:<20} {:<16} {:<16}{}",
                    diff.node_id,
                    opt_display(&diff.status_a),
                    opt_display(&diff.status_b),
                    if diff.output_differs { " output differs" } else { "" }
                );
            }
        }
        Commands::List { limit } => {
            for run in store.list_runs(limit)? {
                println!(
                    "{}  {:<16} {:<22} {}",
                    run.id,
                    run.state,
                    run.mode,
                    truncate(&run.task, 60)
                );
            }
        }
        Commands::Status { run_id } => {
            let run_id = RunId::from_str(&run_id);
            let run = store.get_run(&run_id)?;
            println!("Run:   {}", run.id);
            println!("Mode:  {}", run.mode);
            println!("State: {}", run.state);
            println!("Task:  {}", run.task);
            println!("Dir:   {}", run.work_dir.display());
            if let Some(parent) = &run.parent_run_id {
                println!(
                    "Branched from {} at {}",
                    parent,
                    run.branch_point.as_deref().unwrap_or("?")
                );
            }
            if let Some(branch) = store.get_branch(&run_id)? {
                println!("Branch: {} ({})", branch.name, branch.hypothesis);
            }
            println!();
            for node in store.load_nodes(&run_id)? {
                println!(
                    "  {:>3}  {:<20} {:<12} {:<16} {}",
                    node.step_number,
                    node.id,
                    node.node_type.as_str(),
                    node.status,
                    node.label
                );
            }
        }
        Commands::History { run_id, node } => {
            let run_id = RunId::from_str(&run_id);
            let entity = match node {
                Some(node_id) => EntityRef::node(&run_id, node_id),
                None => EntityRef::run(&run_id),
            };
            for t in orchestrator.machine().history(&entity)? {
                println!(
                    "{}  {} -> {}  [{}] {}",
                    t.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    t.from_state,
                    t.to_state,
                    t.actor,
                    t.reason
                );
            }
        }
        Commands::Checkpoints { run_id } => {
            for cp in orchestrator.checkpoints().list(&RunId::from_str(&run_id))? {
                println!(
                    "{:>4}  {:<12} {:<20} {}",
                    cp.step_number,
                    cp.kind.as_str(),
                    cp.node_id.as_deref().unwrap_or("-"),
                    cp.created_at.to_rfc3339()
                );
            }
        }
        Commands::Events { run_id } => {
            let captor = EventCaptor::new(RunId::from_str(&run_id), store.clone());
            print_event_tree(&captor, None, 0)?;
        }
    }

    Ok(())
}

/// Execute with gate prompts on stdin and Ctrl-C mapped to cancellation.
async fn drive<'a, F, Fut>(
    orchestrator: &'a Orchestrator,
    control: &'a RunControl,
    auto_approve: bool,
    start: F,
) -> anyhow::Result<RunReport>
where
    F: FnOnce(&'a RunControl) -> Fut,
    Fut: std::future::Future<Output = weft_core::error::Result<RunReport>>,
{
    let gate_handle = tokio::spawn(answer_gates(
        orchestrator.event_bus().clone(),
        orchestrator.broker().clone(),
        auto_approve,
    ));

    let run = start(control);
    tokio::pin!(run);
    let report = loop {
        tokio::select! {
            report = &mut run => break report?,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling run");
                control.cancel();
            }
        }
    };
    gate_handle.abort();
    Ok(report)
}

/// Prompt for every gate opened while a run executes.
async fn answer_gates(event_bus: Arc<EventBus>, broker: Arc<ApprovalBroker>, auto_approve: bool) {
    let mut rx = event_bus.subscribe();
    while let Ok(event) = rx.recv().await {
        let WorkflowEvent::GateOpened {
            request_id,
            node_ids,
            reasons,
            ..
        } = event
        else {
            continue;
        };

        eprintln!("\n[APPROVAL] nodes: {}", node_ids.join(", "));
        for reason in &reasons {
            eprintln!("  - {}", reason);
        }
        let decision = if auto_approve {
            ApprovalDecision::Approved
        } else {
            prompt_decision().await
        };
        if !broker.respond(&request_id, decision).await {
            warn!(request_id = %request_id, "Approval request no longer pending");
        }
    }
}

async fn prompt_decision() -> ApprovalDecision {
    let answer = tokio::task::spawn_blocking(|| {
        eprint!("Allow? [Y/n/reason to deny] ");
        io::stderr().flush().ok();
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line).map(|_| line)
    })
    .await;

    match answer {
        Ok(Ok(line)) => match line.trim() {
            "" | "y" | "Y" | "yes" => ApprovalDecision::Approved,
            "n" | "N" | "no" => ApprovalDecision::Denied {
                reason: "denied by user".into(),
            },
            reason => ApprovalDecision::Denied {
                reason: reason.to_string(),
            },
        },
        _ => ApprovalDecision::Denied {
            reason: "no answer on stdin".into(),
        },
    }
}

fn load_config(path: &PathBuf) -> anyhow::Result<WeftConfig> {
    if path.exists() {
        return Ok(WeftConfig::load(path)?);
    }
    let home_config = dirs_home().map(|h| h.join(".weft").join("config.toml"));
    match home_config {
        Some(path) if path.exists() => {
            info!(path = %path.display(), "Loading config from home directory");
            Ok(WeftConfig::load(&path)?)
        }
        _ => {
            info!("No config file found, using defaults");
            Ok(WeftConfig::default())
        }
    }
}

/// Parse `KEY=VALUE` pairs; values that are not JSON are kept as strings.
fn parse_assignments(pairs: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut map = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("expected KEY=VALUE, got '{}'", pair))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        map.insert(key.trim().to_string(), value);
    }
    Ok(map)
}

fn print_templates() {
    let registry = WorkflowRegistry;
    println!("Modes:");
    for mode in registry.modes() {
        println!("  {:<22} {:<16} {}", mode.mode, mode.template, mode.description);
    }
    println!("\nTemplates:");
    for template in registry.templates() {
        let nodes: Vec<&str> = template.nodes.iter().map(|n| n.id).collect();
        println!("  {:<16} {} [{}]", template.id, template.description, nodes.join(" -> "));
    }
}

fn print_report(report: &RunReport) {
    println!("\nRun {} {}", report.run_id, report.state);
    println!(
        "  levels: {}  checkpoints: {}  completed: {}",
        report.levels,
        report.checkpoints,
        report.outputs.len()
    );
    for failure in &report.failures {
        println!("  [failed] {}", failure);
    }
    if !report.pending.is_empty() {
        println!("  pending: {}", report.pending.join(", "));
    }
}

fn print_event_tree(captor: &EventCaptor, parent: Option<u64>, depth: usize) -> anyhow::Result<()> {
    for event in captor.children(parent)? {
        let node = event
            .node_id
            .as_deref()
            .map(|n| format!(" [{}]", n))
            .unwrap_or_default();
        println!("{}{} {}{}", "  ".repeat(depth), event.seq, event.event_type, node);
        print_event_tree(captor, Some(event.seq), depth + 1)?;
    }
    Ok(())
}

fn opt_display<T: std::fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "-".into())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
