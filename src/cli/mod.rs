use clap::{Parser, Subcommand};

pub mod commands;

#[derive(Parser)]
#[command(name = "fleet-kernel")]
#[command(about = "Coordination kernel for a fleet of worker agents")]
#[command(long_about = "fleet-kernel hands out lease locks on files and exclusive commands, \
                       watches agent heartbeats and walks failed agents through a recovery ladder, \
                       and grows or shrinks worker pools from queue depth. Start it with 'fleet-kernel run'.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the kernel and supervise the configured pools until interrupted
    Run {
        /// Stop after this many seconds instead of waiting for a signal
        #[arg(long, help = "Run for a fixed number of seconds, then shut down gracefully")]
        duration: Option<u64>,
    },
    /// Inspect or write the kernel configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Dry-run one scaling decision from the given pool figures
    Decide {
        /// Pool to evaluate against the configured limits
        #[arg(long, default_value = "default", help = "Pool whose configured limits apply")]
        pool: String,
        /// Jobs waiting in the queue
        #[arg(long, default_value = "0", help = "Jobs waiting in the pool queue")]
        queue_depth: u64,
        /// Jobs currently being processed
        #[arg(long, default_value = "0", help = "Jobs currently in flight")]
        processing: u64,
        /// Agents currently running in the pool
        #[arg(long, default_value = "1", help = "Agents currently running in the pool")]
        current_agents: u32,
        /// Rolling average job duration in seconds
        #[arg(long, default_value = "0", help = "Average processing time in seconds")]
        avg_time: f64,
        /// Failed share of finished jobs
        #[arg(long, default_value = "0", help = "Error rate between 0.0 and 1.0")]
        error_rate: f64,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Write a configuration file with the default values
    Init {
        /// Destination file
        #[arg(long, default_value = "fleet-kernel.toml", help = "Where to write the configuration")]
        path: String,
        /// Overwrite an existing file
        #[arg(long, help = "Overwrite the file if it already exists")]
        force: bool,
    },
}
