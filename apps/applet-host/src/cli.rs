use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "applet-host",
    about = "Host out-of-process panel applets over the session bus",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "APPLET_HOST_CONFIG",
        value_name = "PATH",
        help = "Config file (defaults to <config dir>/applet-host/config.toml)"
    )]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "APPLET_HOST_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "APPLET_HOST_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Parse an applet identifier and show the bus names it maps to
    CheckId(CheckIdArgs),
    /// List the properties a container can read and write
    Properties,
    /// Host an applet against a simulated factory and print what happens
    Simulate(SimulateArgs),
    /// Load an applet from the session bus and report its events until interrupted
    #[cfg(feature = "session-bus")]
    Host(HostArgs),
}

#[derive(Args, Debug, Default)]
pub struct HostArgs {
    #[arg(value_name = "IID", help = "Applet identifier, <factory-id>::<applet-id>")]
    pub iid: String,

    #[arg(
        long = "placement-hint",
        value_name = "HINT",
        allow_negative_numbers = true,
        help = "Override the configured placement hint"
    )]
    pub placement_hint: Option<i32>,

    #[arg(long = "get", value_name = "NAME", help = "Read a property after loading")]
    pub gets: Vec<String>,

    #[arg(long, action = clap::ArgAction::SetTrue, help = "Print one JSON object per line")]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct CheckIdArgs {
    #[arg(value_name = "IID", help = "Applet identifier, <factory-id>::<applet-id>")]
    pub iid: String,

    #[arg(long, action = clap::ArgAction::SetTrue, help = "Print JSON instead of text")]
    pub json: bool,
}

#[derive(Args, Debug, Default)]
pub struct SimulateArgs {
    #[arg(value_name = "IID", help = "Applet identifier, <factory-id>::<applet-id>")]
    pub iid: String,

    #[arg(
        long = "out-of-process",
        action = clap::ArgAction::SetTrue,
        help = "Have the factory report an out-of-process applet"
    )]
    pub out_of_process: bool,

    #[arg(
        long = "embed-handle",
        value_name = "WINDOW",
        default_value_t = 0,
        help = "Window handle the factory hands back for embedding"
    )]
    pub embed_handle: u32,

    #[arg(
        long = "placement-hint",
        value_name = "HINT",
        allow_negative_numbers = true,
        help = "Override the configured placement hint"
    )]
    pub placement_hint: Option<i32>,

    #[arg(long = "get", value_name = "NAME", help = "Read a property after loading")]
    pub gets: Vec<String>,

    #[arg(
        long = "set",
        value_name = "NAME=VALUE",
        value_parser = parse_assignment,
        help = "Write a property after loading (arrays as 1,2,3)"
    )]
    pub sets: Vec<(String, String)>,

    #[arg(long, action = clap::ArgAction::SetTrue, help = "Request the applet context menu")]
    pub popup: bool,

    #[arg(
        long,
        action = clap::ArgAction::SetTrue,
        help = "Kill the factory afterwards and wait for the container to notice"
    )]
    pub crash: bool,

    #[arg(long, action = clap::ArgAction::SetTrue, help = "Print JSON instead of text")]
    pub json: bool,
}

fn parse_assignment(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{raw}'")),
    }
}
