use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "execrelay")]
#[command(version)]
#[command(about = "Exchange command coordinator", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding default.toml and per-environment overrides
    #[arg(short, long, default_value = "config", env = "EXECRELAY_CONFIG_DIR")]
    pub config: String,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Claim, execute and verify commands for the configured connector
    Run,
    /// Accept submissions over HTTP and time out overdue commands
    Serve,
    /// Apply database migrations and exit
    Migrate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommand_and_config_dir() {
        let cli = Cli::try_parse_from(["execrelay", "--config", "/etc/execrelay", "serve"]).unwrap();
        assert_eq!(cli.command, Commands::Serve);
        assert_eq!(cli.config, "/etc/execrelay");
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["execrelay"]).is_err());
    }
}
