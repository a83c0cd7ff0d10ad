//! troupe CLI: the main entry point.
//!
//! Commands:
//! - `agents`  List configured agent definitions and available factories
//! - `check`   Validate configuration and build every agent once
//! - `run`     Run a coordination pattern over registered agents

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use troupe_config::AppConfig;

mod builtin;
mod commands;

#[derive(Parser)]
#[command(
    name = "troupe",
    about = "troupe: multi-agent coordination patterns",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.troupe/config.toml)
    #[arg(short, long, global = true, env = "TROUPE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List agent definitions and factories
    Agents,

    /// Validate the configuration
    Check,

    /// Run a pattern
    Run(commands::run::RunArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;
    let registry = troupe_core::FactoryRegistry::new();
    builtin::register(&registry);

    match cli.command {
        Commands::Agents => commands::agents::run(&config, &registry),
        Commands::Check => commands::check::run(&config, &registry),
        Commands::Run(args) => commands::run::run(&config, &registry, args).await,
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    match path {
        Some(path) => {
            let mut config = AppConfig::load_from(path)
                .with_context(|| format!("loading {}", path.display()))?;
            config.apply_env_overrides(|key| std::env::var(key).ok())?;
            config.validate()?;
            Ok(config)
        }
        None => Ok(AppConfig::load()?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_arguments() {
        let cli = Cli::try_parse_from([
            "troupe",
            "-v",
            "run",
            "ensemble",
            "--agents",
            "a,b,c",
            "--input",
            "hello",
            "--strategy",
            "weighted",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.agents, vec!["a", "b", "c"]);
                assert_eq!(args.input.as_deref(), Some("hello"));
                assert_eq!(args.strategy.as_deref(), Some("weighted"));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn unknown_pattern_is_rejected() {
        assert!(Cli::try_parse_from(["troupe", "run", "tournament", "--agents", "a"]).is_err());
    }

    #[test]
    fn missing_config_file_means_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/troupe.toml"))).unwrap();
        assert!(config.agents.is_empty());
    }
}
