//! This module defines the command line arguments notes-api accepts.

use std::path::PathBuf;
use termcolor::ColorChoice;

use crate::{cmd, db::cmd::DbCommand};


#[derive(Debug, clap::Parser)]
#[command(about = "GraphQL API for notes, backed by PostgreSQL.")]
pub(crate) struct Args {
    #[command(subcommand)]
    pub(crate) cmd: Command,

    /// Whether to use colors and other ANSI codes in the output: "auto",
    /// "always" or "never". "auto" uses colors if stdout/stderr is a terminal.
    #[arg(long, global = true, default_value = "auto", value_parser = parse_color_choice)]
    pub(crate) color: ColorChoice,
}

#[derive(Debug, clap::Subcommand)]
pub(crate) enum Command {
    /// Starts the HTTP server serving the GraphQL API.
    Serve {
        #[command(flatten)]
        shared: Shared,
    },

    /// Database operations.
    Db {
        #[command(subcommand)]
        cmd: DbCommand,

        #[command(flatten)]
        shared: Shared,
    },

    /// Checks config, DB connection and error messages to find problems in
    /// the environment. Exits with 0 if everything is Ok, and with 1
    /// otherwise.
    Check {
        #[command(flatten)]
        shared: Shared,
    },

    /// Outputs a template for the configuration file (which includes
    /// descriptions or all options).
    WriteConfig {
        /// Target file. If not specified, the template is written to stdout.
        target: Option<PathBuf>,
    },

    /// Exports the API as GraphQL schema.
    ExportApiSchema {
        #[command(flatten)]
        args: cmd::export_api_schema::Args,
    },
}

#[derive(Debug, clap::Args)]
pub(crate) struct Shared {
    /// Path to the configuration file. If this is not specified, the path in
    /// `NOTES_API_CONFIG_PATH` is used, or else `config.toml` or
    /// `/etc/notes-api/config.toml`.
    #[arg(short, long)]
    pub(crate) config: Option<PathBuf>,
}

impl Args {
    pub(crate) fn stdout_color(&self) -> ColorChoice {
        self.resolve_auto(std::io::IsTerminal::is_terminal(&std::io::stdout()))
    }

    pub(crate) fn stderr_color(&self) -> ColorChoice {
        self.resolve_auto(std::io::IsTerminal::is_terminal(&std::io::stderr()))
    }

    fn resolve_auto(&self, is_terminal: bool) -> ColorChoice {
        match self.color {
            ColorChoice::Auto if is_terminal => ColorChoice::Auto,
            ColorChoice::Auto => ColorChoice::Never,
            other => other,
        }
    }
}

impl Command {
    /// Short name used to fill `${cmd}` in the log file path.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Command::Serve { .. } => "serve",
            Command::Db { .. } => "db",
            Command::Check { .. } => "check",
            Command::WriteConfig { .. } => "write-config",
            Command::ExportApiSchema { .. } => "export-api-schema",
        }
    }
}

fn parse_color_choice(s: &str) -> Result<ColorChoice, &'static str> {
    match s {
        "auto" => Ok(ColorChoice::Auto),
        "always" => Ok(ColorChoice::Always),
        "never" => Ok(ColorChoice::Never),
        _ => Err("invalid color choice, must be one of 'auto', 'always' and 'never'"),
    }
}
