pub mod daemon;
pub mod executions;

use clap::{Parser, Subcommand};

/// Repo Build Daemon - a self-hosted clone-and-build job daemon
#[derive(Parser, Debug)]
#[command(
    name = "rbd",
    version,
    about = "Repo Build Daemon - a self-hosted clone-and-build job daemon"
)]
pub struct Cli {
    /// Daemon host
    #[arg(long, default_value = "127.0.0.1", global = true)]
    pub host: String,

    /// Daemon port
    #[arg(long, default_value_t = 8419, global = true)]
    pub port: u16,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the daemon
    Start {
        /// Run in foreground (don't detach)
        #[arg(short = 'f', long)]
        foreground: bool,

        /// Path to configuration file
        #[arg(short = 'c', long = "config")]
        config: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(short = 'p', long)]
        port: Option<u16>,

        /// Data directory path
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },

    /// Stop the daemon
    Stop {
        /// Force kill the daemon process
        #[arg(long)]
        force: bool,
    },

    /// Show daemon status
    Status,

    /// Request a new execution of the build job
    Trigger {
        /// Follow the execution's log output
        #[arg(long)]
        follow: bool,
    },

    /// List executions
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Stream an execution's log (tails live if still running)
    Logs {
        /// Execution id
        id: i64,
    },
}

/// Build the base URL for the daemon HTTP API.
pub fn base_url(host: &str, port: u16) -> String {
    format!("http://{}:{}", host, port)
}

/// Format a connection error message for when the daemon is not reachable.
pub fn connection_error_message(host: &str, port: u16) -> String {
    format!(
        "Could not connect to daemon at {}:{}. Is it running? (try: rbd start)",
        host, port
    )
}

/// Dispatch the CLI command to the appropriate handler.
pub async fn dispatch(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Some(Commands::Start {
            foreground,
            config,
            port,
            data_dir,
        }) => {
            daemon::cmd_start(
                &cli.host,
                *foreground,
                config.as_deref(),
                *port,
                data_dir.as_deref(),
            )
            .await
        }
        Some(Commands::Stop { force }) => daemon::cmd_stop(&cli.host, cli.port, *force).await,
        Some(Commands::Status) => daemon::cmd_status(&cli.host, cli.port, cli.verbose).await,
        Some(Commands::Trigger { follow }) => {
            executions::cmd_trigger(&cli.host, cli.port, *follow).await
        }
        Some(Commands::List { json }) => executions::cmd_list(&cli.host, cli.port, *json).await,
        Some(Commands::Logs { id }) => executions::cmd_logs(&cli.host, cli.port, *id).await,
        None => {
            // No subcommand provided -- print help
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}
