//! Logging configuration using tracing.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Pick the filter directive for a run.
///
/// An explicit `--log-level` wins, then the `-v` count (a dry run counts as
/// at least one `-v`), then the configured level.
pub fn resolve_level(explicit: Option<&str>, verbosity: u8, dry_run: bool, configured: &str) -> String {
    if let Some(level) = explicit {
        return level.to_string();
    }

    let verbosity = if dry_run { verbosity.max(1) } else { verbosity };
    match verbosity {
        0 => configured.to_string(),
        1 => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Initialize logging with the specified level. `RUST_LOG` overrides it.
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_level_wins() {
        assert_eq!(resolve_level(Some("trace"), 2, true, "warn"), "trace");
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(resolve_level(None, 0, false, "warn"), "warn");
        assert_eq!(resolve_level(None, 1, false, "warn"), "info");
        assert_eq!(resolve_level(None, 2, false, "warn"), "debug");
        assert_eq!(resolve_level(None, 5, false, "warn"), "debug");
    }

    #[test]
    fn test_dry_run_implies_verbose() {
        assert_eq!(resolve_level(None, 0, true, "warn"), "info");
        assert_eq!(resolve_level(None, 2, true, "warn"), "debug");
    }
}
