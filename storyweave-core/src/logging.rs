use tracing::Level;
use tracing_subscriber::{
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Crates whose events follow the configured level. Everything else
/// (tokio, config loaders) stays at `warn` unless `RUST_LOG` says otherwise.
const STORYWEAVE_TARGETS: &[&str] = &["storyweave", "storyweave_core", "storyweave_realtime"];

/// Initialize structured logging.
///
/// `RUST_LOG` wins when set. Output goes to stderr (stdout is left to the
/// CLI's own output) or is appended to `file_path`.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = build_filter(config)?;
    let writer = log_writer(config.file_path.as_deref())?;
    let registry = tracing_subscriber::registry().with(filter);

    if config.format.as_str() == "json" {
        let layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_writer(writer);
        registry.with(layer).try_init()?;
    } else {
        let layer = fmt::layer()
            .pretty()
            .with_target(true)
            .with_line_number(true)
            .with_file(false)
            .with_ansi(config.file_path.is_none())
            .with_writer(writer);
        registry.with(layer).try_init()?;
    }

    Ok(())
}

fn build_filter(config: &LoggingConfig) -> anyhow::Result<EnvFilter> {
    let level = parse_log_level(&config.level)?;
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    Ok(EnvFilter::try_new(default_directives(level))?)
}

/// `warn` globally, `level` for the storyweave crates
fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    std::iter::once("warn".to_string())
        .chain(STORYWEAVE_TARGETS.iter().map(|target| format!("{target}={level}")))
        .collect::<Vec<_>>()
        .join(",")
}

fn log_writer(file_path: Option<&str>) -> anyhow::Result<BoxMakeWriter> {
    match file_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Ok(BoxMakeWriter::new(std::sync::Arc::new(file)))
        }
        None => Ok(BoxMakeWriter::new(std::io::stderr)),
    }
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_log_level("WARNING").unwrap(), Level::WARN);
        assert!(parse_log_level("invalid").is_err());
    }

    #[test]
    fn test_default_directives_scope_storyweave_crates() {
        let directives = default_directives(Level::DEBUG);
        assert_eq!(
            directives,
            "warn,storyweave=debug,storyweave_core=debug,storyweave_realtime=debug"
        );
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn test_log_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storyweave.log");
        assert!(log_writer(Some(path.to_str().unwrap())).is_ok());
        assert!(path.exists());
    }

    #[test]
    fn test_init_rejects_bad_level() {
        let config = LoggingConfig {
            level: "loud".to_string(),
            ..Default::default()
        };
        assert!(init_logging(&config).is_err());
    }
}
