//! Tracing setup with a filter that can be changed at runtime

use anyhow::{Context, Result};
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

/// Handle for replacing the active log filter
#[derive(Clone)]
pub struct LogControl {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogControl {
    /// Replace the filter with `directives` (`EnvFilter` syntax).
    ///
    /// A malformed directive string leaves the current filter in force.
    pub fn apply(&self, directives: &str) -> Result<()> {
        let filter = EnvFilter::try_new(directives)
            .with_context(|| format!("invalid log directives '{}'", directives))?;
        self.handle
            .reload(filter)
            .context("log subscriber is gone")?;
        Ok(())
    }
}

fn base_filter(default_directive: &str) -> EnvFilter {
    let filter = EnvFilter::from_default_env();
    match default_directive.parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(e) => {
            eprintln!("ignoring default log directive '{}': {}", default_directive, e);
            filter
        }
    }
}

/// Install the global subscriber: `RUST_LOG` plus `default_directive`,
/// formatted to stderr.
///
/// Calling it again keeps the first subscriber; the returned handle then
/// controls nothing and `apply` reports an error.
pub fn init(default_directive: &str) -> LogControl {
    let (filter, handle) = reload::Layer::new(base_filter(default_directive));
    if tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .is_err()
    {
        warn!("Global log subscriber already installed");
    }
    LogControl { handle }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_swaps_filter_and_rejects_garbage() {
        let (layer, handle) = reload::Layer::new(EnvFilter::new("info"));
        let subscriber = tracing_subscriber::registry().with(layer);
        let control = LogControl { handle };
        let _guard = tracing::subscriber::set_default(subscriber);

        assert!(control.apply("vigil=debug,warn").is_ok());
        assert!(control.apply("vigil=notalevel").is_err());
    }

    #[test]
    fn apply_after_subscriber_dropped_fails() {
        let (layer, handle) = reload::Layer::<EnvFilter, Registry>::new(EnvFilter::new("info"));
        drop(layer);
        let control = LogControl { handle };
        assert!(control.apply("debug").is_err());
    }
}
