//! orc CLI.
//!
//! Drives tasks through a configured workflow to completion.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use orc::backend::{FileBackend, PersistentBackend};
use orc::cancellation::CancellationToken;
use orc::git::ShellGit;
use orc::harness::create_turn_executor;
use orc::judge::{LlmJudge, TurnExecutorJudge};
use orc::task::{Task, TaskWeight};
use orc::workflow::{RunOptions, WorkflowConfig, WorkflowRunner};
use orc::{Config, Result};

#[derive(Parser)]
#[command(name = "orc")]
#[command(author, version, about = "Autonomous task-execution engine")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task through its workflow from the beginning
    Run {
        /// Task id
        task_id: String,

        /// Workflow definition file
        #[arg(long, default_value = "workflow.toml")]
        workflow: PathBuf,

        /// Stop after this phase completes
        #[arg(long)]
        to_phase: Option<String>,

        /// Short-circuit every gate to approved
        #[arg(long)]
        skip_gates: bool,

        /// Extra instructions folded into the next retry context
        #[arg(long)]
        context: Option<String>,
    },

    /// Resume a paused or interrupted task
    Resume {
        /// Task id
        task_id: String,

        /// Workflow definition file
        #[arg(long, default_value = "workflow.toml")]
        workflow: PathBuf,

        #[arg(long)]
        skip_gates: bool,
    },

    /// Show a task's current status
    Status {
        /// Task id
        task_id: String,
    },

    /// Show a single phase's stored artifact
    Show {
        /// Task id
        task_id: String,

        /// Phase id
        phase_id: String,
    },

    /// Create a new task
    New {
        /// Task title
        title: String,

        /// Task description
        #[arg(long, default_value = "")]
        description: String,

        /// Task weight: trivial, small, medium, large, greenfield
        #[arg(long, default_value = "medium")]
        weight: String,
    },

    /// Initialize .orc directory with a default config
    Init,

    /// Show the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { EnvFilter::new("debug") } else { EnvFilter::new("info") };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { task_id, workflow, to_phase, skip_gates, context } => {
            run_task(&config, &task_id, &workflow, to_phase, skip_gates, context).await?;
        }

        Commands::Resume { task_id, workflow, skip_gates } => {
            run_task(&config, &task_id, &workflow, None, skip_gates, None).await?;
        }

        Commands::Status { task_id } => {
            let backend = open_backend(&config)?;
            let task = backend.load_task(&task_id).await?;
            println!("{}: {:?}", task.id, task.status);
            if let Some(phase) = &task.substate.current_phase {
                println!("current phase: {}", phase);
            }
            if let Some(reason) = &task.substate.blocked_reason {
                println!("blocked: {}", reason);
            }
        }

        Commands::Show { task_id, phase_id } => {
            let backend = open_backend(&config)?;
            match backend.load_artifact(&task_id, &phase_id).await? {
                Some(content) => println!("{}", content),
                None => println!("no artifact recorded for phase \"{}\"", phase_id),
            }
        }

        Commands::New { title, description, weight } => {
            let backend = open_backend(&config)?;
            let id = backend.get_next_task_id().await?;
            let mut task = Task::new(&id, &title, &description);
            task.weight = parse_weight(&weight)?;
            backend.save_task(&task).await?;
            println!("created task {}", task.id);
        }

        Commands::Init => {
            orc::config::init()?;
            info!("initialized .orc directory");
        }

        Commands::Config => match toml::to_string_pretty(&config) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("failed to serialize config: {}", e),
        },
    }

    Ok(())
}

fn parse_weight(s: &str) -> Result<TaskWeight> {
    match s {
        "trivial" => Ok(TaskWeight::Trivial),
        "small" => Ok(TaskWeight::Small),
        "medium" => Ok(TaskWeight::Medium),
        "large" => Ok(TaskWeight::Large),
        "greenfield" => Ok(TaskWeight::Greenfield),
        other => Err(orc::Error::Config(format!("unknown task weight \"{}\"", other))),
    }
}

fn open_backend(config: &Config) -> Result<Arc<dyn PersistentBackend>> {
    Ok(Arc::new(FileBackend::new(config.state_dir())?))
}

async fn run_task(
    config: &Config,
    task_id: &str,
    workflow_path: &PathBuf,
    to_phase: Option<String>,
    skip_gates: bool,
    context: Option<String>,
) -> Result<()> {
    let mut config = config.clone();
    config.skip_gates = config.skip_gates || skip_gates;

    let workflow_config = WorkflowConfig::load(workflow_path)?;
    let backend = open_backend(&config)?;
    let git: Arc<dyn orc::git::Git> = Arc::new(ShellGit::new(PathBuf::from(".")));
    let turn_executor: Arc<dyn orc::harness::TurnExecutor> = Arc::from(create_turn_executor(&config)?);

    let judge: Option<Arc<dyn LlmJudge>> = if config.judge.enabled {
        Some(Arc::new(TurnExecutorJudge::new(turn_executor.clone(), config.judge.model.clone())))
    } else {
        None
    };

    let cancellation = CancellationToken::new();
    cancellation.install_pause_signal()?;

    let runner = WorkflowRunner::new(workflow_config, config, backend, git, turn_executor, judge, cancellation);
    let task = runner.run(task_id, RunOptions { to_phase, extra_context: context }).await?;

    println!("task {} finished as {:?}", task.id, task.status);
    Ok(())
}
