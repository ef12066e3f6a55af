//! execudf CLI - run and check SQL functions backed by external executables.

mod admit;
mod check;
mod invoke;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "execudf")]
#[command(about = "Run and check SQL functions backed by external executables")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Invoke a function on tab-separated rows read from stdin
    Invoke {
        /// Path to the function catalog (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Name of the function to call
        #[arg(short, long)]
        function: String,

        /// Parameter value of a parametrized function, in declaration order
        #[arg(short, long = "param")]
        params: Vec<String>,

        /// Query id used to tag diagnostics (generated when omitted)
        #[arg(long)]
        query_id: Option<String>,

        /// Directory that relative program paths resolve against
        #[arg(long)]
        scripts_dir: Option<PathBuf>,
    },

    /// Decide whether a query calling these functions may use the result cache
    Admit {
        /// Path to the function catalog (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Session setting: throw, save or ignore
        #[arg(long, default_value = "throw")]
        policy: String,

        /// Functions called by the query (default: every catalog function)
        functions: Vec<String>,
    },

    /// Validate a function catalog and list its functions
    Check {
        /// Path to the function catalog (JSON)
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; stdout carries result rows
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Invoke {
            config,
            function,
            params,
            query_id,
            scripts_dir,
        } => {
            invoke::execute(&config, &function, params, query_id, scripts_dir).await?;
        }

        Commands::Admit {
            config,
            policy,
            functions,
        } => admit::execute(&config, &policy, &functions)?,

        Commands::Check { config } => check::execute(&config)?,
    }

    Ok(())
}
