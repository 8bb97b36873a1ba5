//! Command-line interface parsing and handling.

pub mod say;
pub mod tools;


use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::cli::say::run_say;
use crate::cli::tools::run_tools;
use crate::core::config::{default_config_path, EngineConfig};
use crate::utils::logging::init_tracing;

const GIT_DESCRIBE: &str = match option_env!("VERGEN_GIT_DESCRIBE") {
    Some(describe) => describe,
    None => "unknown",
};

#[derive(Parser)]
#[command(name = "toolstream")]
#[command(version, long_version = GIT_DESCRIBE)]
#[command(about = "Stream LLM replies that call MCP tool servers mid-conversation")]
#[command(
    long_about = "Toolstream drives an OpenAI-compatible chat endpoint and runs the tool calls \
the model embeds in its reply against MCP servers, feeding results back until the turn is done.\n\n\
Configuration lives in config.toml ([engine], [[providers]], [[tool_servers]]).\n\
Credentials are read from the system keyring (service \"toolstream\"), falling back to \
TOOLSTREAM_API_KEY.\n\n\
Logging:\n\
  RUST_LOG          Filter for diagnostic logs (default toolstream=info)\n\
  --log <file>      Append diagnostic logs to a file instead of stderr"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config.toml
    #[arg(short = 'c', long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Provider id from the config
    #[arg(short = 'p', long, global = true, value_name = "PROVIDER")]
    pub provider: Option<String>,

    /// Override the provider's model
    #[arg(short = 'm', long, global = true, value_name = "MODEL")]
    pub model: Option<String>,

    /// Append diagnostic logs to this file
    #[arg(short = 'l', long, global = true, value_name = "FILE")]
    pub log: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one turn non-interactively and print the reply
    Say {
        /// Prompt text
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        prompt: Vec<String>,
    },
    /// List configured tool servers and their tools
    Tools {
        /// Refresh tool lists from the servers and save them to the config
        #[arg(long)]
        sync: bool,
    },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(args.log.as_deref())?;

    let config_path = match args.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let config = EngineConfig::load_from_path(&config_path)?;

    match args.command {
        Commands::Say { prompt } => run_say(config, prompt, args.provider, args.model).await,
        Commands::Tools { sync } => run_tools(config, &config_path, sync).await,
    }
}
