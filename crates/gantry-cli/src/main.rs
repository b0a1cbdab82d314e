// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gantry_core::{Tier, ToolDefinition};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Exit code for runtime errors.
const EXIT_RUNTIME_ERROR: i32 = 1;
/// Exit code for usage / argument errors (clap exits with 2 automatically).
#[allow(dead_code)]
const EXIT_USAGE_ERROR: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "gantry", version, about = "Gantry operator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Configuration inspection.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Parse and validate a tool definition file against its structural invariants.
    ToolValidate {
        /// Path to a JSON file containing a tool definition.
        file: PathBuf,
    },

    /// Print the built-in admission limits for a subscription tier.
    PolicyDefaults {
        /// Subscription tier.
        #[arg(value_enum)]
        tier: TierArg,
    },

    /// Print the default per-provider price table used for cost accounting.
    PriceShow,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Load and validate a config file (or the built-in defaults), printing any warnings.
    Check {
        /// Path to a TOML config file. Omit to validate the built-in defaults.
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Load a config file (or the built-in defaults) and print it as JSON.
    Show {
        /// Path to a TOML config file. Omit to print the built-in defaults.
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum TierArg {
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl From<TierArg> for Tier {
    fn from(value: TierArg) -> Self {
        match value {
            TierArg::Free => Tier::Free,
            TierArg::Starter => Tier::Starter,
            TierArg::Pro => Tier::Pro,
            TierArg::Enterprise => Tier::Enterprise,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("gantry=debug")
    } else {
        EnvFilter::new("gantry=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match cli.command {
        Commands::Config { action } => cmd_config(action),
        Commands::ToolValidate { file } => cmd_tool_validate(&file),
        Commands::PolicyDefaults { tier } => cmd_policy_defaults(tier.into()),
        Commands::PriceShow => cmd_price_show(),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Check { path } => {
            let config = gantry_config::load_config(path.as_deref())
                .with_context(|| "failed to load config")?;
            let warnings = gantry_config::validate_config(&config)
                .with_context(|| "config failed validation")?;
            if warnings.is_empty() {
                println!("config is valid, no warnings");
            } else {
                for w in &warnings {
                    println!("warning: {w}");
                }
            }
            Ok(())
        }
        ConfigAction::Show { path } => {
            let config = gantry_config::load_config(path.as_deref())
                .with_context(|| "failed to load config")?;
            let json = serde_json::to_string_pretty(&config)
                .context("failed to serialize config")?;
            println!("{json}");
            Ok(())
        }
    }
}

fn cmd_tool_validate(file: &PathBuf) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let tool: ToolDefinition =
        serde_json::from_str(&content).with_context(|| format!("failed to parse {}", file.display()))?;
    match tool.validate() {
        Ok(()) => {
            println!("{}: valid", tool.id);
            Ok(())
        }
        Err(errors) => {
            for e in &errors {
                println!("{:?}", e);
            }
            anyhow::bail!("{} failed {} invariant check(s)", tool.id, errors.len());
        }
    }
}

fn cmd_policy_defaults(tier: Tier) -> Result<()> {
    let limits = gantry_policy::tier_defaults(tier);
    println!("{limits:#?}");
    Ok(())
}

fn cmd_price_show() -> Result<()> {
    for entry in gantry_metering::default_price_table() {
        println!("{}/{}: ${:.6}", entry.provider, entry.operation, entry.unit_price_usd);
    }
    Ok(())
}
