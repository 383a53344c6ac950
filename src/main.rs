use clap::{Parser, Subcommand};

use slimline::errors::exit_code;

mod cmd;

#[derive(Parser)]
#[command(name = "slimline")]
#[command(version, about = "Context weight-loss tool for coding-agent transcripts — prune bloated JSONL session files")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

const SESSION_HELP: &str = "Session ID, UUID prefix, path, or 'current' for auto-detect";

#[derive(Subcommand)]
pub enum Commands {
    /// List sessions with sizes
    List {
        /// Filter by project name
        #[arg(long)]
        project: Option<String>,
    },
    /// Show the current session for this project
    Current {
        /// Also run diagnosis
        #[arg(short = 'd', long)]
        diagnose: bool,
    },
    /// Analyze bloat sources (read-only)
    Diagnose {
        #[arg(help = SESSION_HELP)]
        session: String,
    },
    /// Run a prescription (dry-run by default)
    Treat {
        #[arg(help = SESSION_HELP)]
        session: String,
        /// Prescription: gentle, standard, aggressive
        #[arg(short = 'r', long = "rx")]
        rx: Option<String>,
        /// Apply changes (default is dry-run)
        #[arg(long)]
        execute: bool,
        /// Thinking block mode: remove, truncate, signature-only
        #[arg(long = "thinking-mode")]
        thinking_mode: Option<String>,
    },
    /// Run a single strategy
    Strategy {
        /// Strategy name (see 'slimline formulary')
        name: String,
        #[arg(help = SESSION_HELP)]
        session: String,
        /// Show action details
        #[arg(short = 'v', long)]
        verbose: bool,
        /// Apply changes (default is dry-run)
        #[arg(long)]
        execute: bool,
        #[arg(long = "thinking-mode")]
        thinking_mode: Option<String>,
    },
    /// Treat the current session and auto-resume after exit
    Reload {
        /// Prescription: gentle, standard, aggressive (default: standard)
        #[arg(short = 'r', long = "rx")]
        rx: Option<String>,
        #[arg(long = "thinking-mode")]
        thinking_mode: Option<String>,
    },
    /// Save team state from the current session (no pruning)
    Checkpoint {
        /// Print the team state after saving
        #[arg(long)]
        show: bool,
    },
    /// Background sentinel — prune before the host agent compacts
    Guard {
        /// Hard threshold in MB: full prune + reload
        #[arg(long, default_value_t = 50.0)]
        threshold: f64,
        /// Soft threshold in MB: gentle prune, no reload (default: 60% of --threshold)
        #[arg(long = "soft-threshold")]
        soft_threshold: Option<f64>,
        /// Hard threshold in tokens, checked alongside --threshold
        #[arg(long = "threshold-tokens")]
        threshold_tokens: Option<u64>,
        /// Check interval in seconds
        #[arg(long, default_value_t = 30)]
        interval: u64,
        /// Prescription for the hard tier (default: standard)
        #[arg(short = 'r', long = "rx")]
        rx: Option<String>,
        /// Prune without auto-reload at the hard threshold
        #[arg(long = "no-reload")]
        no_reload: bool,
        /// Disable the reactive overflow watcher
        #[arg(long = "no-reactive")]
        no_reactive: bool,
        /// Run in the background (PID file prevents double starts)
        #[arg(long)]
        daemon: bool,
    },
    /// Check for known problems and fix them
    Doctor {
        /// Auto-fix where possible
        #[arg(long)]
        fix: bool,
    },
    /// Show all strategies and prescriptions
    Formulary,
}

/// Accept the historical single-dash `-rx` spelling alongside `--rx`.
fn normalize_args() -> Vec<String> {
    std::env::args()
        .map(|arg| if arg == "-rx" { "--rx".to_string() } else { arg })
        .collect()
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::List { project } => cmd::cmd_list(project.as_deref()),
        Commands::Current { diagnose } => cmd::cmd_current(*diagnose),
        Commands::Diagnose { session } => cmd::cmd_diagnose(session),
        Commands::Treat { session, rx, execute, thinking_mode } => {
            cmd::cmd_treat(session, rx.as_deref(), *execute, thinking_mode.as_deref())
        }
        Commands::Strategy { name, session, verbose, execute, thinking_mode } => {
            cmd::cmd_strategy(name, session, *verbose, *execute, thinking_mode.as_deref())
        }
        Commands::Reload { rx, thinking_mode } => {
            cmd::cmd_reload(rx.as_deref(), thinking_mode.as_deref())
        }
        Commands::Checkpoint { show } => cmd::cmd_checkpoint(*show),
        Commands::Guard {
            threshold,
            soft_threshold,
            threshold_tokens,
            interval,
            rx,
            no_reload,
            no_reactive,
            daemon,
        } => cmd::cmd_guard(&cmd::GuardArgs {
            threshold_mb: *threshold,
            soft_threshold_mb: *soft_threshold,
            threshold_tokens: *threshold_tokens,
            interval_secs: *interval,
            rx: rx.clone(),
            no_reload: *no_reload,
            no_reactive: *no_reactive,
            daemon: *daemon,
        }),
        Commands::Doctor { fix } => cmd::cmd_doctor(*fix),
        Commands::Formulary => cmd::cmd_formulary(),
    }
}

fn main() {
    let cli = Cli::parse_from(normalize_args());
    if let Err(err) = run(&cli) {
        eprintln!("Error: {err:#}");
        std::process::exit(exit_code(&err));
    }
}
