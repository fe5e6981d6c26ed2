//! Lumen CLI - run canvas code headlessly against persistent sessions.

mod check;
mod exec;
mod sweep;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use lumen_core::LumenConfig;

#[derive(Parser)]
#[command(name = "lumen")]
#[command(about = "Persistent interpreter sessions for Lumen canvases")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute source files in a session and place their outputs
    Exec {
        /// Files to execute, one source each
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Session key shared by all files
        #[arg(short, long, default_value = "default")]
        session: String,

        /// Layout file holding the slots of previous runs
        #[arg(long)]
        layout: Option<PathBuf>,

        /// Frame of the source element as x,y,width,height
        #[arg(long, default_value = "0,0,400,200", value_parser = exec::parse_anchor)]
        anchor: lumen_core::Anchor,

        /// Submit all files at once instead of one after another
        #[arg(long)]
        parallel: bool,

        /// Per-execution timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Delete expired artifact files
    Sweep,

    /// Show the resolved configuration and interpreter
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // Helper to format lumen-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(lumen_err) = err.downcast_ref::<lumen_core::Error>() {
            anyhow::anyhow!("{}", lumen_err.with_hint())
        } else {
            err
        }
    };

    let mut config = LumenConfig::load(cli.config.as_deref())
        .map_err(anyhow::Error::from)
        .map_err(format_error)?;

    match cli.command {
        Commands::Exec {
            files,
            session,
            layout,
            anchor,
            parallel,
            timeout_ms,
        } => {
            if let Some(timeout_ms) = timeout_ms {
                config.session.execution_timeout_ms = timeout_ms;
            }
            let options = exec::ExecOptions {
                session,
                layout,
                anchor,
                parallel,
            };
            exec::execute(&config, &files, &options).await.map_err(format_error)?;
        }

        Commands::Sweep => sweep::execute(&config).map_err(format_error)?,

        Commands::Check => check::execute(&config).map_err(format_error)?,
    }

    Ok(())
}
