use anyhow::Result;
use clap::Parser;

use fleet_kernel::cli::commands::{config::ConfigCommand, decide::DecideCommand, run::RunCommand};
use fleet_kernel::cli::{Cli, Commands, ConfigAction};
use fleet_kernel::{config, init_telemetry, shutdown_telemetry};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config()?;
    init_telemetry(&config.observability)?;

    let result = tokio::runtime::Runtime::new()?.block_on(async {
        match cli.command {
            // Default behavior: no subcommand runs the kernel until a signal arrives
            None => RunCommand::new(None).execute(config).await,
            Some(Commands::Run { duration }) => RunCommand::new(duration).execute(config).await,
            Some(Commands::Config { action }) => match action {
                ConfigAction::Show => ConfigCommand::Show.execute(config),
                ConfigAction::Init { path, force } => {
                    ConfigCommand::Init { path, force }.execute(config)
                }
            },
            Some(Commands::Decide {
                pool,
                queue_depth,
                processing,
                current_agents,
                avg_time,
                error_rate,
            }) => DecideCommand {
                pool,
                queue_depth,
                processing,
                current_agents,
                avg_time,
                error_rate,
            }
            .execute(config),
        }
    });

    shutdown_telemetry();
    result
}
