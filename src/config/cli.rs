use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the hearth binary.
#[derive(Debug, Parser)]
#[command(
    name = "hearth",
    version,
    about = "Static asset and template server with dependency-tracked compilation"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "HEARTH_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Serve assets over HTTP.
    Serve(Box<ServeArgs>),
    /// Render one template to standard output.
    Render(RenderArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the directory assets are served from.
    #[arg(long = "resources-root", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub resources_root: Option<PathBuf>,

    /// Toggle script and stylesheet minification.
    #[arg(
        long = "minify",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub minify: Option<bool>,

    /// Override the client cache lifetime; zero disables caching.
    #[arg(long = "cache-seconds", value_name = "SECONDS")]
    pub cache_seconds: Option<u64>,

    /// Override the number of concurrent compilations.
    #[arg(long = "executor-workers", value_name = "COUNT")]
    pub executor_workers: Option<usize>,

    /// Override how many compilations may wait for a worker.
    #[arg(long = "executor-queue-size", value_name = "COUNT")]
    pub executor_queue_size: Option<usize>,
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Override the template directory.
    #[arg(long = "templates-root", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub templates_root: Option<PathBuf>,

    /// JSON file providing the rendering scope.
    #[arg(long = "scope", value_name = "FILE", value_hint = ValueHint::FilePath, conflicts_with = "scope_json")]
    pub scope: Option<PathBuf>,

    /// Inline JSON rendering scope.
    #[arg(long = "scope-json", value_name = "JSON")]
    pub scope_json: Option<String>,

    /// Template name, with or without the default suffix.
    #[arg(value_name = "TEMPLATE")]
    pub name: String,
}
