mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// kiln -- build a project from a spec with a team of AI agents.
#[derive(Parser)]
#[command(name = "kiln", version, about)]
struct Cli {
    /// Config file to use instead of ~/.kiln/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and build a project, streaming progress.
    Run {
        /// ProjectSpec JSON file.
        spec: PathBuf,
        /// Precomputed plan JSON. Defaults to the spec's `plan` field, then
        /// to asking the agent for one.
        #[arg(long)]
        plan: Option<PathBuf>,
        /// Workspace directory. Defaults to a fresh directory per session.
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Print events as JSON lines.
        #[arg(long)]
        json: bool,
    },

    /// Check a plan and print its execution order.
    Validate {
        spec: PathBuf,
        #[arg(long)]
        plan: Option<PathBuf>,
    },

    /// Print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;
    kn_telemetry::logging::init_from_config("kiln", &config.general);

    match cli.command {
        Commands::Run {
            spec,
            plan,
            workspace,
            json,
        } => {
            commands::run::run(
                config,
                commands::run::RunOptions {
                    spec,
                    plan,
                    workspace,
                    json,
                },
            )
            .await?;
        }
        Commands::Validate { spec, plan } => {
            commands::validate::run(&spec, plan.as_deref()).await?;
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
