use anyhow::Result;
use clap::{Parser, Subcommand};
use coursehub_core::identity::Role;
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "coursehub")]
#[command(about = "coursehub - per-user course sessions on a Docker Swarm cluster", long_about = None)]
struct Cli {
    /// Configuration file (default: $COURSEHUB_CONFIG, then ~/.config/coursehub/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch (or reuse) the session of a user in a course
    Launch {
        #[arg(long)]
        user: String,
        /// instructor or learner
        #[arg(long)]
        role: Role,
        #[arg(long)]
        course: String,
        /// Upstream platform id, needed for users without a directory record
        #[arg(long)]
        subject_id: Option<u32>,
        /// Seconds to wait for readiness (overrides the configuration)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Tear down the session of a user
    Teardown {
        #[arg(long)]
        user: String,
    },
    /// Show the session record of a user, or of every known session
    Status {
        #[arg(long)]
        user: Option<String>,
        /// Also ask the cluster for the task health
        #[arg(long)]
        check: bool,
    },
    /// Print the mount plan a launch would use, without side effects
    Plan {
        #[arg(long)]
        user: String,
        #[arg(long)]
        role: Role,
        #[arg(long)]
        course: String,
        #[arg(long)]
        subject_id: Option<u32>,
    },
    /// Load and validate the configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config_path, config) = commands::load_config(cli.config.as_deref())?;
    let _log_guard = commands::logging::init(&config.logging)?;

    match cli.command {
        Commands::Launch {
            user,
            role,
            course,
            subject_id,
            timeout,
        } => commands::session::launch(&config, user, role, course, subject_id, timeout).await?,
        Commands::Teardown { user } => commands::session::teardown(&config, &user).await?,
        Commands::Status { user, check } => {
            commands::session::status(&config, user.as_deref(), check).await?
        }
        Commands::Plan {
            user,
            role,
            course,
            subject_id,
        } => commands::session::plan(&config, user, role, course, subject_id).await?,
        Commands::CheckConfig => commands::check_config(&config_path, &config)?,
    }

    Ok(())
}
