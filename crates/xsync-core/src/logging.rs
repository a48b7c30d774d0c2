//! Log setup and consumer log scanning
//!
//! Both sides of an exchange log through `tracing` to stdout in plain text. The producer
//! captures the consumer's stdout and treats any line carrying [`ERROR_MARKER`] as a failure,
//! independent of the exit code.

use tracing_subscriber::EnvFilter;

/// Marker the producer looks for in consumer output. Matches the `ERROR` level tag.
pub const ERROR_MARKER: &str = "ERROR";

/// Default filter when neither `XSYNC_LOG` nor an explicit filter is set.
pub const DEFAULT_FILTER: &str = "info";

/// Install the stdout subscriber. Later calls are no-ops, so every test may call this.
pub fn init(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(false)
        .with_writer(std::io::stdout)
        .try_init();
}

/// Lines of `output` that report an error.
pub fn scan_for_errors(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.contains(ERROR_MARKER))
        .map(|line| line.trim_end().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_for_errors() {
        let out = "2026-01-01T00:00:00Z  INFO opened handle\n\
                   2026-01-01T00:00:01Z ERROR data mismatch at offset 3\n\
                   done\n";
        let errors = scan_for_errors(out);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].ends_with("data mismatch at offset 3"));
        assert!(scan_for_errors("all good\n").is_empty());
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init("debug");
        init("not a [valid filter");
    }
}
