mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "maestro",
    about = "Route work between specialised modes through validated handoff reports",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .maestro/ or .git/)
    #[arg(long, global = true, env = "MAESTRO_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize maestro in the current project
    Init {
        /// Project name (default: the root directory's name)
        #[arg(long)]
        name: Option<String>,

        /// Discard existing workflow state and start from an idle workflow
        #[arg(long)]
        reset: bool,
    },

    /// Show workflow status, facts, open issues, artifacts and history
    State,

    /// List the mode catalogue
    Modes {
        /// Only modes holding this capability
        #[arg(long)]
        capability: Option<String>,
    },

    /// Parse and validate a handoff report without applying it
    Check {
        /// Report file (markdown or JSON)
        file: PathBuf,

        /// Also check that this mode may emit the report's kind
        #[arg(long)]
        mode: Option<String>,
    },

    /// Accept a handoff report into workflow state
    Apply {
        /// Report file (markdown or JSON)
        file: PathBuf,

        /// Mode that produced the report
        #[arg(long)]
        mode: String,
    },

    /// Start a workflow and drive it through the configured executors
    Run {
        /// What needs to be done
        objective: String,

        /// Task category (e.g. debug, design, implement)
        #[arg(long)]
        category: String,

        /// Start with this mode instead of choosing by capability
        #[arg(long)]
        mode: Option<String>,

        /// Constraint handed to every task (repeatable)
        #[arg(long = "constraint")]
        constraints: Vec<String>,
    },

    /// Resume a blocked workflow with a directive
    Resume {
        /// Mode to dispatch next
        #[arg(long)]
        mode: String,

        /// Instruction for the mode (default: the workflow objective)
        #[arg(long)]
        instruction: Option<String>,

        /// Category of the remaining work (default: the workflow category)
        #[arg(long)]
        category: Option<String>,
    },

    /// Dispatch several independent tasks concurrently, then continue routing
    FanOut {
        /// Branch as `mode:category:instruction` (repeatable)
        #[arg(long = "branch", required = true)]
        branches: Vec<String>,
    },

    /// Inspect the project configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init { name, reset } => cmd::init::run(&root, name.as_deref(), reset, cli.json),
        Commands::State => cmd::state::run(&root, cli.json),
        Commands::Modes { capability } => cmd::modes::run(&root, capability.as_deref(), cli.json),
        Commands::Check { file, mode } => {
            cmd::report::check(&root, &file, mode.as_deref(), cli.json)
        }
        Commands::Apply { file, mode } => cmd::report::apply(&root, &file, &mode, cli.json),
        Commands::Run {
            objective,
            category,
            mode,
            constraints,
        } => cmd::run::run(&root, &objective, &category, mode, constraints, cli.json),
        Commands::Resume {
            mode,
            instruction,
            category,
        } => cmd::run::resume(&root, &mode, instruction, category, cli.json),
        Commands::FanOut { branches } => cmd::run::fan_out(&root, &branches, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
