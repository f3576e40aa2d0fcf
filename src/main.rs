use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use entraflow_core::config::{dirs_home, AppConfig};
use entraflow_core::event::EventBus;
use entraflow_core::traits::StateStore;
use entraflow_core::types::{AgentRequest, RunId, WorkflowRun};
use entraflow_core::workflow::{WorkflowDefinition, WorkflowFile};

use entraflow_engine::{AgentRegistry, MemoryStateStore, Orchestrator, RunLogger, SqliteStateStore};

#[derive(Parser)]
#[command(name = "entraflow", version, about = "DAG orchestrator for agent workflows")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "entraflow.toml", env = "ENTRAFLOW_CONFIG")]
    config: PathBuf,

    /// Keep run state in memory only (nothing is written to the state database)
    #[arg(long, global = true)]
    ephemeral: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new run of a workflow
    Run {
        #[command(flatten)]
        source: WorkflowSource,
        /// Run input as KEY=VALUE (VALUE is parsed as JSON when possible)
        #[arg(short, long = "input")]
        inputs: Vec<String>,
        /// Print the final run as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resume an interrupted or failed run
    Resume {
        /// Run ID
        run_id: String,
        /// Print the final run as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the state of a run
    Status {
        /// Run ID
        run_id: String,
        /// Print the full run as JSON
        #[arg(long)]
        json: bool,
    },
    /// List stored runs, newest first
    Runs,
    /// List configured workflows
    Workflows,
    /// Show the execution order of a workflow, level by level
    Plan {
        #[command(flatten)]
        source: WorkflowSource,
    },
    /// Validate a workflow without running it
    Validate {
        #[command(flatten)]
        source: WorkflowSource,
    },
    /// List registered agents with their health
    Agents,
    /// Run a single agent outside any workflow
    Test {
        /// Agent name
        #[arg(short, long)]
        agent: String,
        /// JSON file with `config`, `inputs`, `upstream` and optional `node_id`
        #[arg(short, long)]
        input_file: Option<PathBuf>,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Args)]
struct WorkflowSource {
    /// Name of a workflow from the config file
    #[arg(required_unless_present = "file")]
    workflow: Option<String>,
    /// Load the workflow from a standalone TOML file instead
    #[arg(short, long, conflicts_with = "workflow")]
    file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "entraflow=debug,entraflow_engine=debug,info"
    } else {
        "entraflow=info,entraflow_engine=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "entraflow", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    let registry = Arc::new(AgentRegistry::with_builtins());

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Workflows => {
            let workflows = config.all_workflows()?;
            if workflows.is_empty() {
                println!("No workflows configured.");
            }
            for wf in &workflows {
                println!("{:<24} {} nodes  {}", wf.name, wf.nodes.len(), wf.description);
            }
        }
        Commands::Agents => print_agents(&registry),
        Commands::Test { agent, input_file } => {
            let request = match &input_file {
                Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
                None => AgentRequest::default(),
            };
            let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
            let orchestrator = Orchestrator::new(registry.clone(), store, config.engine.clone());
            let result = orchestrator
                .execute_agent(&agent, request.into_context(&agent))
                .await;
            match result {
                Ok(payload) => {
                    println!("{}", serde_json::to_string_pretty(&payload)?);
                    println!();
                    print_agents(&registry);
                }
                Err(e) => {
                    eprintln!("Agent '{}' failed: {}", agent, e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Validate { source } => {
            let definition = resolve_workflow(&config, &source)?;
            let name = definition.name.clone();
            let graph = entraflow_engine::ExecutionGraph::build(Arc::new(definition), &registry)?;
            println!("Workflow '{}' is valid ({} nodes).", name, graph.len());
        }
        Commands::Plan { source } => {
            let definition = resolve_workflow(&config, &source)?;
            let graph = entraflow_engine::ExecutionGraph::build(Arc::new(definition), &registry)?;
            println!("Execution plan for '{}':", graph.definition().name);
            for (level, ids) in graph.levels().iter().enumerate() {
                println!("  level {}: {}", level, ids.join(", "));
            }
            println!("Order: {}", graph.ordered_ids().join(" -> "));
        }
        Commands::Run {
            source,
            inputs,
            json,
        } => {
            let definition = Arc::new(resolve_workflow(&config, &source)?);
            let inputs = parse_inputs(&inputs)?;
            let store = open_store(&config, cli.ephemeral)?;
            let label = definition.name.clone();
            let run = execute(&config, registry, store, &label, |orch| async move {
                orch.start(definition, inputs).await
            })
            .await?;
            report(&run, json)?;
        }
        Commands::Resume { run_id, json } => {
            let store = open_store(&config, cli.ephemeral)?;
            let run_id = RunId::from_string(&run_id);
            let label = format!("resume-{}", run_id);
            let run = execute(&config, registry, store, &label, |orch| async move {
                orch.resume(&run_id).await
            })
            .await?;
            report(&run, json)?;
        }
        Commands::Status { run_id, json } => {
            let store = open_store(&config, cli.ephemeral)?;
            let run = store.load(&RunId::from_string(&run_id)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                print_run(&run);
            }
        }
        Commands::Runs => {
            let store = open_store(&config, cli.ephemeral)?;
            let orchestrator = Orchestrator::new(registry, store, config.engine.clone());
            let runs = orchestrator.list_runs().await?;
            if runs.is_empty() {
                println!("No runs recorded.");
            }
            for s in &runs {
                println!(
                    "{}  {:<20} {:<20} {}/{} succeeded  {}",
                    s.run_id,
                    s.workflow,
                    s.status.to_string(),
                    s.succeeded,
                    s.total,
                    s.created_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Load config from the given path, then `~/.entraflow/config.toml`, else defaults.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".entraflow").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    warn!(path = %path.display(), "No config file found, using defaults");
    Ok(AppConfig::default())
}

fn resolve_workflow(config: &AppConfig, source: &WorkflowSource) -> anyhow::Result<WorkflowDefinition> {
    if let Some(file) = &source.file {
        return Ok(WorkflowFile::from_file(file)?.workflow);
    }
    let name = source
        .workflow
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("no workflow given"))?;
    Ok(config.find_workflow(name)?)
}

fn open_store(config: &AppConfig, ephemeral: bool) -> anyhow::Result<Arc<dyn StateStore>> {
    if ephemeral {
        return Ok(Arc::new(MemoryStateStore::new()));
    }
    let path = config.state_db_path();
    info!(path = %path.display(), "Opening state store");
    Ok(Arc::new(SqliteStateStore::open(&path)?))
}

fn parse_inputs(raw: &[String]) -> anyhow::Result<HashMap<String, serde_json::Value>> {
    raw.iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("input '{}' is not KEY=VALUE", pair))?;
            let value = serde_json::from_str(value)
                .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
            Ok((key.trim().to_string(), value))
        })
        .collect()
}

/// Build an orchestrator with Ctrl-C cancellation and optional JSONL run
/// logging, then drive one run through `f`.
async fn execute<F, Fut>(
    config: &AppConfig,
    registry: Arc<AgentRegistry>,
    store: Arc<dyn StateStore>,
    label: &str,
    f: F,
) -> anyhow::Result<WorkflowRun>
where
    F: FnOnce(Arc<Orchestrator>) -> Fut,
    Fut: std::future::Future<Output = entraflow_core::Result<WorkflowRun>>,
{
    let event_bus = Arc::new(EventBus::default());
    let orchestrator = Arc::new(
        Orchestrator::new(registry, store, config.engine.clone()).with_event_bus(event_bus.clone()),
    );

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run (in-flight nodes will finish)");
            cancel.cancel();
        }
    });

    let result = match config.log_dir() {
        Some(dir) => {
            let (result, path) = RunLogger::new(dir)
                .record(&event_bus, label, f(orchestrator))
                .await;
            if let Some(path) = path {
                info!(path = %path.display(), "Run log written");
            }
            result
        }
        None => f(orchestrator).await,
    };
    Ok(result?)
}

fn report(run: &WorkflowRun, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(run)?);
    } else {
        print_run(run);
    }
    if run.status.is_failure() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_agents(registry: &AgentRegistry) {
    println!(
        "{:<14} {:<8} {:>10} {:>8}  {:<19}  DESCRIPTION",
        "AGENT", "HEALTH", "EXECUTIONS", "FAILURES", "LAST RUN"
    );
    for health in registry.statuses() {
        let description = registry
            .get(&health.name)
            .map(|a| a.description().to_string())
            .unwrap_or_default();
        let last_run = health
            .last_run_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<14} {:<8} {:>10} {:>8}  {:<19}  {}",
            health.name,
            if health.healthy() { "ok" } else { "failing" },
            health.executions,
            health.failures,
            last_run,
            description
        );
    }
}

fn print_run(run: &WorkflowRun) {
    println!("Run:      {}", run.run_id);
    println!("Workflow: {}", run.workflow_name());
    println!("Status:   {}", run.status);
    println!("Started:  {}", run.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(done) = run.completed_at {
        println!("Finished: {}", done.format("%Y-%m-%d %H:%M:%S"));
    }
    if run.durability_degraded {
        println!("Warning: some state saves failed; resuming this run may repeat work.");
    }
    println!();
    for node in run.ordered_nodes() {
        let error = node
            .last_error
            .as_ref()
            .map(|e| format!("  ({})", e))
            .unwrap_or_default();
        println!(
            "  {:<20} {:<10} attempts={}{}",
            node.node_id,
            node.status.to_string(),
            node.attempts,
            error
        );
    }
}
