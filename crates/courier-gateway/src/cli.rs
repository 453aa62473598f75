use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "courier", version, about = "Slack relay and task scheduler for the Claude agent")]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the scheduler, plus the Slack relay when `[relay]` is configured.
    Serve,
    /// Run one task now and deliver its output to the task's sinks.
    Run { task: String },
    Check {
        /// Output format: human (default) or json
        #[arg(long, value_enum, default_value_t = CheckFormat::Human)]
        format: CheckFormat,
    },
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum CheckFormat {
    Human,
    Json,
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_global_config() {
        let cli = Cli::try_parse_from(["courier", "run", "news-brief", "--config", "c.toml"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some("c.toml"));
        assert!(matches!(cli.command, Commands::Run { ref task } if task == "news-brief"));
    }

    #[test]
    fn check_format_defaults_to_human() {
        let cli = Cli::try_parse_from(["courier", "check"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Check {
                format: CheckFormat::Human
            }
        ));
        let cli = Cli::try_parse_from(["courier", "check", "--format", "json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Check {
                format: CheckFormat::Json
            }
        ));
        assert!(Cli::try_parse_from(["courier", "check", "--format", "xml"]).is_err());
    }
}
