use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "converge")]
#[command(version)]
#[command(
    about = "Plan declarative monitoring configuration against applied state",
    long_about = None
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Directory holding .state/ and converge.toml
    #[arg(short = 'C', long, global = true, env = "CONVERGE_WORKDIR")]
    pub workdir: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Compare configuration with applied state and show the changes
    Plan(PlanArgs),

    /// Render a saved plan file after checking its signature
    Show {
        /// Plan file written by `plan --out`
        plan: PathBuf,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that a saved plan still matches the configuration
    Verify {
        /// Plan file written by `plan --out`
        plan: PathBuf,

        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Show whether the configuration is converged and the lock is free
    Status(ConfigArgs),

    /// Inspect or edit applied state
    #[command(subcommand)]
    State(StateCommand),

    /// Remove a stale lock left by a crashed run
    Unlock {
        /// Remove the lock even if its holder looks alive
        #[arg(long)]
        force: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Clone)]
pub struct ConfigArgs {
    /// Configuration file(s), .json or .toml; merged in order
    #[arg(short, long = "config", value_name = "FILE", required = true)]
    pub configs: Vec<PathBuf>,
}

#[derive(Args)]
pub struct PlanArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Save a signed plan file
    #[arg(short, long, value_name = "FILE")]
    pub out: Option<PathBuf>,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,

    /// Skip field-level diffs
    #[arg(long)]
    pub no_diff: bool,

    /// Show secret values in diffs
    #[arg(long)]
    pub show_secrets: bool,

    /// Also check for drift against live resources
    #[arg(long)]
    pub check_drift: bool,

    /// Exit with 2 when there are changes
    #[arg(long)]
    pub detailed_exitcode: bool,
}

#[derive(Subcommand)]
pub enum StateCommand {
    /// List applied resources
    List,

    /// Show one applied resource
    Show {
        /// Resource name
        name: String,
    },

    /// Forget a resource without touching it remotely
    Rm {
        /// Resource name
        name: String,

        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },
}
