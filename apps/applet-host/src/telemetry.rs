pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::{Path, PathBuf};
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
    use tracing_subscriber::EnvFilter;

    pub const FILTER_ENV: &str = "APPLET_HOST_LOG_FILTER";

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    /// Keeps the non-blocking writer flushing; set once the subscriber is
    /// installed.
    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let (writer, guard) = open_writer(config.file.as_deref())?;
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(build_env_filter(config.level.to_filter()))
            .with_target(config.level >= LogLevel::Debug)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;
        let _ = GUARD.set(guard);
        Ok(())
    }

    /// Appends to `file` when given, otherwise writes to stderr.
    fn open_writer(file: Option<&Path>) -> Result<(NonBlocking, WorkerGuard), InitError> {
        let Some(path) = file else {
            return Ok(tracing_appender::non_blocking(std::io::stderr()));
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| InitError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(tracing_appender::non_blocking(file))
    }

    fn build_env_filter(level: LevelFilter) -> EnvFilter {
        match std::env::var(FILTER_ENV) {
            Ok(filter) if !filter.trim().is_empty() => EnvFilter::new(filter),
            _ => EnvFilter::new(default_filter_for(level)),
        }
    }

    /// Verbose levels only apply to our own crates; everything else stays
    /// at `info`.
    fn default_filter_for(level: LevelFilter) -> String {
        match level {
            LevelFilter::TRACE => "info,applet_host=trace,applet_bus=trace".to_owned(),
            LevelFilter::DEBUG => "info,applet_host=debug,applet_bus=debug".to_owned(),
            LevelFilter::INFO => "info".to_owned(),
            LevelFilter::WARN => "warn".to_owned(),
            LevelFilter::ERROR => "error".to_owned(),
            LevelFilter::OFF => "off".to_owned(),
        }
    }

}
