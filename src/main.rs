mod audit;
mod cli;
mod config;
mod expression;
mod logging;
mod tools;
mod workflow;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "flowgate")]
#[command(about = "Run declarative tool workflows with implicit dependencies and an audit gate")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project directory (defaults to current)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Suppress normal output
    #[arg(long, global = true)]
    quiet: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow
    Run {
        /// Workflow name or path
        workflow: String,

        /// Workflow inputs as key=value
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,

        /// Print events and the result as JSON lines
        #[arg(long)]
        json: bool,

        /// Run even if the audit reports blocking findings
        #[arg(long)]
        trusted: bool,

        /// Maximum number of steps running at once
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Write a log file under the user config directory
        #[arg(long)]
        log: bool,
    },

    /// Validate a workflow without running
    Validate {
        /// Workflow name or path
        workflow: String,
    },

    /// Report security findings for a workflow
    Audit {
        /// Workflow name or path
        workflow: String,

        /// Package directory shipped with the workflow
        #[arg(long)]
        package: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the capabilities a workflow needs
    Capabilities {
        /// Workflow name or path
        workflow: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show execution order and dependencies
    Graph {
        /// Workflow name or path
        workflow: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_file = match (&cli.command, &cli.log_file) {
        (_, Some(path)) => Some(PathBuf::from(
            shellexpand::tilde(&path.to_string_lossy()).into_owned(),
        )),
        (Commands::Run { workflow, log: true, .. }, None) => {
            Some(logging::default_log_path(workflow)?)
        }
        _ => None,
    };
    let log_guard = logging::init_logging(cli.debug, cli.quiet, log_file.as_deref())?;

    let project_dir = cli
        .dir
        .as_ref()
        .map(|dir| PathBuf::from(shellexpand::tilde(&dir.to_string_lossy()).into_owned()));
    let project_dir = project_dir.as_deref();
    let config = config::FlowgateConfig::load(project_dir)?;

    let exit_code = match cli.command {
        Commands::Run {
            workflow,
            args,
            json,
            trusted,
            max_concurrency,
            ..
        } => {
            let mode = cli::OutputMode::from_flags(json, cli.quiet);
            let handler = cli::create_handler(mode, cli.debug);
            let token = cli::CancellationToken::new();
            tokio::spawn(cli::setup_signal_handlers(token.clone()));

            let options = cli::RunOptions {
                trusted,
                max_concurrency,
            };
            cli::run_workflow(&workflow, &args, project_dir, &config, &options, handler, token)
                .await?
        }

        Commands::Validate { workflow } => {
            let mode = cli::OutputMode::from_flags(false, cli.quiet);
            let handler = cli::create_handler(mode, cli.debug);
            cli::validate_workflow(&workflow, project_dir, handler.as_ref())?
        }

        Commands::Audit {
            workflow,
            package,
            json,
        } => {
            let mode = cli::OutputMode::from_flags(json, cli.quiet);
            let handler = cli::create_handler(mode, cli.debug);
            cli::audit_workflow(
                &workflow,
                project_dir,
                package.as_deref(),
                &config,
                handler.as_ref(),
            )?
        }

        Commands::Capabilities { workflow, json } => {
            let mode = cli::OutputMode::from_flags(json, cli.quiet);
            let handler = cli::create_handler(mode, cli.debug);
            cli::show_capabilities(&workflow, project_dir, handler.as_ref())?
        }

        Commands::Graph { workflow, json } => {
            let mode = cli::OutputMode::from_flags(json, cli.quiet);
            let handler = cli::create_handler(mode, cli.debug);
            cli::show_graph(&workflow, project_dir, handler.as_ref())?
        }
    };

    if exit_code != 0 {
        drop(log_guard);
        std::process::exit(exit_code);
    }
    Ok(())
}
