use clap::{Parser, Subcommand};
use std::path::PathBuf;
use toolstage_core::PlatformKey;

use crate::tracing::{LogLevel, TracingFormat};

#[derive(Parser, Debug)]
#[command(name = "toolstage")]
#[command(about = "Resolve, stage and run bundled per-platform tools")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, env = "TOOLSTAGE_CONFIG", help = "Path to a TOML configuration file")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Directory holding bundled packages")]
    pub tools_root: Option<PathBuf>,

    #[arg(long, global = true, help = "Directory packages are staged into")]
    pub scratch_dir: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_parser = parse_platform,
        help = "Stage for this platform instead of the host (e.g. linux-arm64)"
    )]
    pub platform: Option<PlatformKey>,

    #[arg(
        short = 'l',
        long,
        global = true,
        help = "Set logging level",
        default_value = "warn",
        value_enum
    )]
    pub level: LogLevel,

    #[arg(long, global = true, help = "Log output format", default_value = "compact", value_enum)]
    pub log_format: TracingFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Show the platform tools are resolved for")]
    Platform,

    #[command(about = "List bundled packages")]
    List {
        #[arg(long, help = "Print JSON")]
        json: bool,
    },

    #[command(about = "Stage a tool and print its executable path")]
    Stage {
        #[arg(help = "Tool name")]
        name: String,
        #[arg(long = "require", short = 'r', default_value = "*", help = "Version or version requirement")]
        version: String,
        #[arg(long, help = "Print the staged tool as JSON")]
        json: bool,
    },

    #[command(about = "Stage a tool and run it")]
    Run {
        #[arg(help = "Tool name")]
        name: String,
        #[arg(long = "require", short = 'r', default_value = "*", help = "Version or version requirement")]
        version: String,
        #[arg(long, help = "Timeout in seconds")]
        timeout: Option<u64>,
        #[arg(long = "env", short = 'e', value_parser = parse_env_pair, help = "KEY=VALUE passed to the tool")]
        env: Vec<(String, String)>,
        #[arg(long, help = "Pass this process's PATH to the tool")]
        inherit_path: bool,
        #[arg(last = true, help = "Arguments for the tool")]
        args: Vec<String>,
    },

    #[command(about = "Delete every staged tool")]
    Clean,
}

fn parse_platform(value: &str) -> Result<PlatformKey, String> {
    PlatformKey::parse(value).ok_or_else(|| format!("unknown platform '{value}'"))
}

fn parse_env_pair(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, val)) if !key.is_empty() => Ok((key.to_string(), val.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{value}'")),
    }
}
