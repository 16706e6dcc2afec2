use clap::Parser;
use execrelay::cli::{Cli, Commands};
use execrelay::config::AppConfig;
use execrelay::error::{RelayError, Result};
use tracing::error;

mod main_runtime;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;
    let _log_guard = main_runtime::init_logging(&config.logging);

    if let Err(problems) = config.validate() {
        for problem in &problems {
            error!(%problem, "invalid configuration");
        }
        return Err(RelayError::InvalidConfig(problems.join("; ")));
    }

    let result = match cli.command {
        Commands::Run => main_runtime::run_coordinator(config).await,
        Commands::Serve => main_runtime::serve(config).await,
        Commands::Migrate => main_runtime::migrate(config).await,
    };

    if let Err(e) = &result {
        error!(error = %e, fatal = e.is_fatal(), "execrelay stopped");
    }
    result
}
