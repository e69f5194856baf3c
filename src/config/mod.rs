//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    net::SocketAddr,
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

pub use cli::{CliArgs, Command, LoggingOverrides, RenderArgs, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "hearth";
const ENV_PREFIX: &str = "HEARTH";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_RESOURCES_ROOT: &str = "public";
const DEFAULT_TEMPLATES_ROOT: &str = "templates";
const DEFAULT_TEMPLATE_SUFFIX: &str = "mustache";
const DEFAULT_EXECUTOR_WORKERS: usize = 4;
const DEFAULT_EXECUTOR_QUEUE_SIZE: usize = 32;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub resources: ResourceSettings,
    pub templates: TemplateSettings,
    pub executor: ExecutorSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct ResourceSettings {
    pub root: PathBuf,
    pub minify: bool,
    pub less_fallback: bool,
    pub pretty_json: bool,
    /// `0` means `Cache-Control: no-cache`.
    pub cache_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct TemplateSettings {
    pub root: PathBuf,
    /// Default extension, without the leading dot.
    pub suffix: String,
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub workers: NonZeroUsize,
    pub queue_size: usize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Render(args)) => raw.apply_render_overrides(args),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    resources: RawResourceSettings,
    templates: RawTemplateSettings,
    executor: RawExecutorSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(root) = overrides.resources_root.as_ref() {
            self.resources.root = Some(root.clone());
        }
        if let Some(minify) = overrides.minify {
            self.resources.minify = Some(minify);
        }
        if let Some(seconds) = overrides.cache_seconds {
            self.resources.cache_seconds = Some(seconds);
        }
        if let Some(workers) = overrides.executor_workers {
            self.executor.workers = Some(workers);
        }
        if let Some(queue_size) = overrides.executor_queue_size {
            self.executor.queue_size = Some(queue_size);
        }

        self.apply_logging_overrides(&overrides.logging);
    }

    fn apply_render_overrides(&mut self, args: &RenderArgs) {
        if let Some(root) = args.templates_root.as_ref() {
            self.templates.root = Some(root.clone());
        }
        self.apply_logging_overrides(&args.logging);
    }

    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            resources,
            templates,
            executor,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            resources: build_resource_settings(resources)?,
            templates: build_template_settings(templates)?,
            executor: build_executor_settings(executor)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.host", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_resource_settings(resources: RawResourceSettings) -> Result<ResourceSettings, LoadError> {
    let root = resources
        .root
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RESOURCES_ROOT));
    if root.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "resources.root",
            "path must not be empty",
        ));
    }

    let minify = resources.minify.unwrap_or(false);
    Ok(ResourceSettings {
        root,
        minify,
        less_fallback: resources.less_fallback.unwrap_or(true),
        pretty_json: resources.pretty_json.unwrap_or(!minify),
        cache_seconds: resources.cache_seconds.unwrap_or(0),
    })
}

fn build_template_settings(templates: RawTemplateSettings) -> Result<TemplateSettings, LoadError> {
    let root = templates
        .root
        .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMPLATES_ROOT));
    if root.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "templates.root",
            "path must not be empty",
        ));
    }

    let suffix = templates
        .suffix
        .unwrap_or_else(|| DEFAULT_TEMPLATE_SUFFIX.to_string());
    let suffix = suffix.trim().trim_start_matches('.').to_string();
    if suffix.is_empty() {
        return Err(LoadError::invalid("templates.suffix", "must not be empty"));
    }
    if suffix.contains(['/', '\\']) {
        return Err(LoadError::invalid(
            "templates.suffix",
            "must not contain path separators",
        ));
    }

    Ok(TemplateSettings { root, suffix })
}

fn build_executor_settings(executor: RawExecutorSettings) -> Result<ExecutorSettings, LoadError> {
    let workers = executor.workers.unwrap_or(DEFAULT_EXECUTOR_WORKERS);
    let workers = NonZeroUsize::new(workers)
        .ok_or_else(|| LoadError::invalid("executor.workers", "must be greater than zero"))?;

    Ok(ExecutorSettings {
        workers,
        queue_size: executor.queue_size.unwrap_or(DEFAULT_EXECUTOR_QUEUE_SIZE),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawResourceSettings {
    root: Option<PathBuf>,
    minify: Option<bool>,
    less_fallback: Option<bool>,
    pretty_json: Option<bool>,
    cache_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTemplateSettings {
    root: Option<PathBuf>,
    suffix: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawExecutorSettings {
    workers: Option<usize>,
    queue_size: Option<usize>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
