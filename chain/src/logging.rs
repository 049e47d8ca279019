//! Stderr tracing for the agent loop.
//!
//! Diagnostics only: chain dumps and run results are produced by `export`
//! and never depend on the log level.
//!
//! The level comes from `RUST_LOG` when set, otherwise from the number of
//! `-v` flags given to the binary. Without either, only warnings (tool
//! backend failures, retries, timeouts) are shown.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter directives for a `-v` count when `RUST_LOG` is unset.
///
/// Verbosity raises this crate's level first; dependencies stay at `warn`
/// until `-vvv`.
pub fn default_directives(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "warn,chain=info",
        2 => "warn,chain=debug",
        _ => "debug,chain=trace",
    }
}

/// Install the stderr subscriber (compact format).
///
/// ```bash
/// RUST_LOG=chain::io::sandbox=debug chain exec --tools tools.json snippet.txt
/// chain -vv exec --tools tools.json snippet.txt
/// ```
///
/// A second call is a no-op.
pub fn init(verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose > 1)
                .compact(),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_crate_level_first() {
        assert_eq!(default_directives(0), "warn");
        assert!(default_directives(1).contains("chain=info"));
        assert!(default_directives(2).contains("chain=debug"));
        assert_eq!(default_directives(9), default_directives(3));
    }

    #[test]
    fn directives_parse_as_filters() {
        for verbose in 0..4 {
            assert!(EnvFilter::try_new(default_directives(verbose)).is_ok());
        }
    }

    #[test]
    fn init_twice_does_not_panic() {
        init(0);
        init(2);
    }
}
