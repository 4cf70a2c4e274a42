mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{handoff::HandoffSubcommand, run::RunExit, tasks::TasksSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "ralph",
    about = "Run-state and handoff orchestration for agent-driven story execution",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .ralph/ or .git/)
    #[arg(long, global = true, env = "RALPH_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize Ralph in the current project
    Init {
        /// Project name (default: directory name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Start the HTTP API server
    Serve {
        /// Port to listen on (default: server.port from config)
        #[arg(long)]
        port: Option<u16>,

        /// Open the state endpoint in a browser once listening
        #[arg(long)]
        open: bool,
    },

    /// Show run state and per-version progress
    State,

    /// Rank the runnable stories of a version
    #[command(disable_version_flag = true)]
    Next {
        #[arg(long)]
        version: Option<String>,
    },

    /// Drive the execution loop until it halts
    #[command(disable_version_flag = true)]
    Run {
        /// PRD version (default: current story's, else latest)
        #[arg(long)]
        version: Option<String>,

        /// Skip human gates and keep going after each completed story
        #[arg(long)]
        auto: bool,

        /// Stop after the first completed story
        #[arg(long)]
        one_shot: bool,

        /// Work on this story only
        #[arg(long)]
        story: Option<String>,

        #[arg(long)]
        max_iterations: Option<u32>,

        /// Discard the current story's checkpoints and failure streak first
        #[arg(long)]
        retry_clean: bool,

        /// Answer the pending gate (proceed, clarify, skip, merge, feedback, retry)
        #[arg(long)]
        answer: Option<String>,

        /// Clarification, feedback or report text sent with --answer
        #[arg(long, short = 'm')]
        message: Option<String>,
    },

    /// Time out stale handoffs and reset the run state
    Reset,

    /// Report agent status for a story
    Signal {
        story: String,

        /// complete, blocked or progress
        action: String,

        #[arg(long, short = 'm')]
        message: Option<String>,

        #[arg(long)]
        pr_url: Option<String>,

        /// Signal endpoint (default: RALPH_SIGNAL_URL, else the configured port)
        #[arg(long, env = "RALPH_SIGNAL_URL")]
        url: Option<String>,

        /// Apply directly to the project database instead of posting to a server
        #[arg(long)]
        local: bool,
    },

    /// Manage agent handoffs
    Handoff {
        #[command(subcommand)]
        subcommand: HandoffSubcommand,
    },

    /// Import a PRD document (JSON or YAML)
    Import { file: PathBuf },

    /// Show one story with its checkpoints, handoffs and execution log
    Story { id: String },

    /// Manage the refinement task queue
    Tasks {
        #[command(subcommand)]
        subcommand: TasksSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } | Commands::Run { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init { name } => cmd::init::run(&root, name.as_deref()),
        Commands::Serve { port, open } => cmd::serve::run(&root, port, open),
        Commands::State => cmd::state::run(&root, cli.json),
        Commands::Next { version } => cmd::next::run(&root, version.as_deref(), cli.json),
        Commands::Run {
            version,
            auto,
            one_shot,
            story,
            max_iterations,
            retry_clean,
            answer,
            message,
        } => cmd::run::run(
            &root,
            cmd::run::RunArgs {
                version,
                auto,
                one_shot,
                story,
                max_iterations,
                retry_clean,
                answer,
                message,
            },
            cli.json,
        ),
        Commands::Reset => cmd::reset::run(&root, cli.json),
        Commands::Signal {
            story,
            action,
            message,
            pr_url,
            url,
            local,
        } => cmd::signal::run(
            &root,
            cmd::signal::SignalArgs {
                story,
                action,
                message,
                pr_url,
                url,
                local,
            },
            cli.json,
        ),
        Commands::Handoff { subcommand } => cmd::handoff::run(&root, subcommand, cli.json),
        Commands::Import { file } => cmd::import::run(&root, &file, cli.json),
        Commands::Story { id } => cmd::story::run(&root, &id, cli.json),
        Commands::Tasks { subcommand } => cmd::tasks::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        let code = e.downcast_ref::<RunExit>().map_or(1, RunExit::exit_code);
        std::process::exit(code);
    }
}
