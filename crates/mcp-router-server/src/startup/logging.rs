//! Console and rolling-file logging.
//!
//! Besides the root `mcp-router.log`, events are routed by tracing target into
//! per-component files, all rotated by `logging.rotation`:
//!
//! | Log File       | Component                          | Target Prefixes                                   |
//! |----------------|------------------------------------|---------------------------------------------------|
//! | mcp-router.log | Root logger (all components)       | (all)                                             |
//! | health.log     | Health probes and circuit breakers | mcp_router_core::health, ::circuit_breaker        |
//! | registry.log   | Registration and registry watches  | mcp_router_core::registrar, ::subscriber, client  |
//! | routing.log    | Discovery, cache and selection     | mcp_router_core::router, ::discovery, ::cache     |
//! | audit.log      | Audit events (tracing writer)      | mcp_router_core::audit                            |

use std::path::PathBuf;

use anyhow::Context;
pub use mcp_router_common::config::LogRotation;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

const ROOT_LOG_FILE: &str = "mcp-router.log";
const DEFAULT_LEVEL: &str = "info";

struct ComponentLogDef {
    file_name: &'static str,
    targets: &'static [&'static str],
}

const COMPONENT_LOGS: &[ComponentLogDef] = &[
    ComponentLogDef {
        file_name: "health.log",
        targets: &["mcp_router_core::health", "mcp_router_core::circuit_breaker"],
    },
    ComponentLogDef {
        file_name: "registry.log",
        targets: &[
            "mcp_router_core::registrar",
            "mcp_router_core::subscriber",
            "mcp_router_client",
        ],
    },
    ComponentLogDef {
        file_name: "routing.log",
        targets: &[
            "mcp_router_core::router",
            "mcp_router_core::discovery",
            "mcp_router_core::cache",
        ],
    },
    ComponentLogDef {
        file_name: "audit.log",
        targets: &["mcp_router_core::audit"],
    },
];

fn rolling(rotation: LogRotation) -> Rotation {
    match rotation {
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Never => Rotation::NEVER,
    }
}

/// Resolved logging settings of the binary.
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Filter directive used when `RUST_LOG` is unset, e.g. `info,mcp_router_core=debug`
    pub level: String,
    pub console_output: bool,
    /// Rolling file directory; no files are written when absent
    pub log_dir: Option<PathBuf>,
    pub rotation: LogRotation,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: DEFAULT_LEVEL.to_string(),
            console_output: true,
            log_dir: None,
            rotation: LogRotation::Daily,
        }
    }
}

impl LogSettings {
    /// Build from the `logging` section, with an optional level from the command line.
    pub fn from_config(
        config: &mcp_router_common::config::LoggingConfig,
        level_override: Option<&str>,
    ) -> Self {
        let level = level_override
            .unwrap_or(&config.level)
            .trim()
            .to_string();

        Self {
            level: if level.is_empty() {
                DEFAULT_LEVEL.to_string()
            } else {
                level
            },
            // without a log directory the console is the only sink
            console_output: config.console || config.dir.is_none(),
            log_dir: config.dir.as_ref().map(PathBuf::from),
            rotation: config.rotation,
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL))
    }
}

/// Keeps the non-blocking file writers flushing. Hold it until exit.
pub struct LoggingGuard {
    _file_guards: Vec<WorkerGuard>,
}

fn component_targets(component: &ComponentLogDef) -> Targets {
    component
        .targets
        .iter()
        .fold(Targets::new(), |targets, target| {
            targets.with_target(*target, LevelFilter::TRACE)
        })
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured level for the console and
/// root file. Component files capture every level of their targets.
pub fn init_logging(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let mut guards: Vec<WorkerGuard> = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if settings.console_output {
        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_filter(settings.filter());
        layers.push(Box::new(console_layer));
    }

    if let Some(log_dir) = &settings.log_dir {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

        let root_appender =
            RollingFileAppender::new(rolling(settings.rotation), log_dir, ROOT_LOG_FILE);
        let (root_nb, root_guard) = tracing_appender::non_blocking(root_appender);
        guards.push(root_guard);

        let root_layer = fmt::layer()
            .with_writer(root_nb)
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_filter(settings.filter());
        layers.push(Box::new(root_layer));

        for component in COMPONENT_LOGS {
            let appender =
                RollingFileAppender::new(rolling(settings.rotation), log_dir, component.file_name);
            let (nb, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);

            let layer = fmt::layer()
                .with_writer(nb)
                .with_target(true)
                .with_ansi(false)
                .with_filter(component_targets(component));
            layers.push(Box::new(layer));
        }
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    if let Some(log_dir) = &settings.log_dir {
        tracing::info!(
            log_dir = %log_dir.display(),
            "File logging initialized: {} (root) + {} component log files",
            ROOT_LOG_FILE,
            COMPONENT_LOGS.len()
        );
    }

    Ok(LoggingGuard {
        _file_guards: guards,
    })
}
