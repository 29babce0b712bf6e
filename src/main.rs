//! Binary entry point for memkeep.
//!
//! A thin command-line front end over [`memkeep::ResourceCoordinator`].

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow needless_pass_by_value for command functions
#![allow(clippy::needless_pass_by_value)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

use clap::{Parser, Subcommand};
use memkeep::config::MemkeepConfig;
use memkeep::observability::{self, ObservabilityConfig};
use memkeep::services::DEFAULT_RECALL_LIMIT;
use memkeep::{DecisionInput, PatternInput, PurgeOutcome, ResourceCoordinator};
use secrecy::ExposeSecret;
use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;

type CmdResult = Result<(), Box<dyn std::error::Error>>;

/// Memkeep - persistent project memory for tool-calling assistants.
#[derive(Parser)]
#[command(name = "memkeep")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file.
    #[arg(short, long, global = true, env = "MEMKEEP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Record a decision.
    Remember {
        /// What was decided.
        decision: String,

        /// Why.
        rationale: String,

        /// Surrounding context.
        #[arg(long, default_value = "")]
        context: String,

        /// Alternatives that were considered.
        #[arg(long, default_value = "")]
        alternatives: String,
    },

    /// Search decisions, newest first.
    Recall {
        /// Keyword to match in decision, rationale or context.
        keyword: Option<String>,

        /// Maximum number of results (1-100).
        #[arg(short, long, default_value_t = DEFAULT_RECALL_LIMIT)]
        limit: usize,
    },

    /// Store or update a named pattern.
    Pattern {
        /// Unique pattern name.
        name: String,

        /// What the pattern is.
        description: String,

        /// Example usage.
        #[arg(long, default_value = "")]
        example: String,

        /// When to apply it.
        #[arg(long, default_value = "")]
        when_to_use: String,
    },

    /// List patterns.
    Patterns,

    /// Set a context value.
    Context {
        /// Context key.
        key: String,

        /// Value.
        value: String,
    },

    /// List context values.
    Contexts,

    /// Show counts and limits.
    Stats,

    /// Run health probes.
    Health,

    /// Export everything as JSON.
    Export {
        /// Output file (stdout if omitted).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Import a JSON export.
    Import {
        /// Input file.
        file: PathBuf,

        /// Replace all stored data instead of merging.
        #[arg(long)]
        replace: bool,
    },

    /// Delete all stored data (asks for the confirmation token).
    Purge,
}

/// Main entry point.
fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        },
    };

    let _observability = match observability::init(ObservabilityConfig {
        logging: config.logging.clone().verbose(cli.verbose),
        metrics: config.metrics.clone(),
        metrics_expose: config.metrics.enabled,
    }) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to initialize observability: {e}");
            return ExitCode::FAILURE;
        },
    };

    let coordinator = ResourceCoordinator::open(config);
    let result = run_command(&coordinator, cli.command);
    coordinator.close();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        },
    }
}

/// Loads configuration.
fn load_config(path: Option<&std::path::Path>) -> memkeep::Result<MemkeepConfig> {
    match path {
        Some(path) => MemkeepConfig::load_from_file(path),
        None => Ok(MemkeepConfig::load_default()),
    }
}

fn run_command(coordinator: &ResourceCoordinator, command: Commands) -> CmdResult {
    match command {
        Commands::Remember {
            decision,
            rationale,
            context,
            alternatives,
        } => {
            let input = DecisionInput::new(decision, rationale)
                .with_context(context)
                .with_alternatives(alternatives);
            let id = coordinator.remember_decision(input)?;
            println!("Decision recorded (id {id})");
            Ok(())
        },

        Commands::Recall { keyword, limit } => cmd_recall(coordinator, keyword, limit),

        Commands::Pattern {
            name,
            description,
            example,
            when_to_use,
        } => {
            let input = PatternInput::new(name.clone(), description)
                .with_example(example)
                .with_when_to_use(when_to_use);
            coordinator.store_pattern(input)?;
            println!("Pattern '{name}' stored");
            Ok(())
        },

        Commands::Patterns => {
            let patterns = coordinator.get_patterns()?;
            if patterns.is_empty() {
                println!("No patterns stored");
            }
            for pattern in patterns {
                println!("{}: {}", pattern.name, pattern.description);
                if !pattern.when_to_use.is_empty() {
                    println!("  when: {}", pattern.when_to_use);
                }
                if !pattern.example.is_empty() {
                    println!("  example: {}", pattern.example);
                }
            }
            Ok(())
        },

        Commands::Context { key, value } => {
            coordinator.set_context(&key, &value)?;
            println!("Context '{key}' set");
            Ok(())
        },

        Commands::Contexts => {
            for (key, value) in coordinator.get_context()? {
                println!("{key} = {value}");
            }
            Ok(())
        },

        Commands::Stats => cmd_stats(coordinator),

        Commands::Health => {
            let report = coordinator.health_check()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        },

        Commands::Export { output } => {
            let document = coordinator.export_memory()?;
            let json = serde_json::to_string_pretty(&document)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    println!("Exported to {}", path.display());
                },
                None => println!("{json}"),
            }
            Ok(())
        },

        Commands::Import { file, replace } => {
            let json = std::fs::read_to_string(&file)?;
            let report = coordinator.import_memory(&json, !replace)?;
            println!(
                "Imported {} decisions, {} patterns, {} context keys ({} skipped, {} evicted)",
                report.decisions, report.patterns, report.context, report.skipped, report.evicted
            );
            Ok(())
        },

        Commands::Purge => cmd_purge(coordinator),
    }
}

/// Recall command.
fn cmd_recall(coordinator: &ResourceCoordinator, keyword: Option<String>, limit: usize) -> CmdResult {
    let decisions = coordinator.recall_decisions(keyword.as_deref(), limit)?;
    println!("Found {} decisions:", decisions.len());
    for decision in decisions {
        println!();
        println!("[{}] {} ({})", decision.id, decision.decision, decision.timestamp);
        println!("  why: {}", decision.rationale);
        if !decision.context.is_empty() {
            println!("  context: {}", decision.context);
        }
        if !decision.alternatives.is_empty() {
            println!("  alternatives: {}", decision.alternatives);
        }
    }
    Ok(())
}

/// Stats command.
fn cmd_stats(coordinator: &ResourceCoordinator) -> CmdResult {
    let stats = coordinator.memory_stats()?;
    let limit = coordinator.rate_limit_status();
    let pool = coordinator.pool_stats();

    println!("Memory:");
    println!(
        "  decisions: {}/{} ({:.1}%)",
        stats.decisions,
        stats.limits.max_decisions,
        stats.decisions_used_percent()
    );
    println!(
        "  patterns:  {}/{} ({:.1}%)",
        stats.patterns,
        stats.limits.max_patterns,
        stats.patterns_used_percent()
    );
    println!(
        "  context:   {}/{} ({:.1}%)",
        stats.context_keys,
        stats.limits.max_context_keys,
        stats.context_used_percent()
    );
    println!("  database:  {} bytes", stats.db_size_bytes);
    println!("Rate limit:");
    println!(
        "  {}/{} used in {}s window{}",
        limit.current_usage,
        limit.max_ops,
        limit.window_secs,
        if limit.durable { " (durable)" } else { "" }
    );
    println!("Pool:");
    println!(
        "  {} pooled, {} idle, {} temporary, {} exhaustions",
        pool.size, pool.available, pool.temp_active, pool.exhaustion_count
    );
    Ok(())
}

/// Purge command: issues a token, then reads it back from stdin.
fn cmd_purge(coordinator: &ResourceCoordinator) -> CmdResult {
    let PurgeOutcome::ConfirmationRequired { token, expires_in } = coordinator.purge_memory(None)?
    else {
        return Err("purge ran without confirmation".into());
    };

    eprintln!("WARNING: this permanently deletes every decision, pattern and context value.");
    eprintln!(
        "Type the token below within {}s to confirm: {}",
        expires_in.as_secs(),
        token.expose_secret()
    );

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    match coordinator.purge_memory(Some(line.trim()))? {
        PurgeOutcome::Purged(report) => {
            println!(
                "Purged {} decisions, {} patterns, {} context keys",
                report.decisions, report.patterns, report.context
            );
            Ok(())
        },
        PurgeOutcome::ConfirmationRequired { .. } => Err("purge was not confirmed".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_import_replace() {
        let cli = Cli::try_parse_from(["memkeep", "import", "dump.json", "--replace"]).unwrap();
        assert!(matches!(cli.command, Commands::Import { replace: true, .. }));
    }

    #[test]
    fn test_parse_recall_defaults() {
        let cli = Cli::try_parse_from(["memkeep", "-v", "recall"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Recall { keyword, limit } => {
                assert!(keyword.is_none());
                assert_eq!(limit, DEFAULT_RECALL_LIMIT);
            },
            _ => panic!("expected recall"),
        }
    }
}
