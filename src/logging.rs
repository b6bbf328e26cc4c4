//! Logger setup shared by both binaries
//!
//! `RUST_LOG` decides the filter; without it the default is `info`.
//! `-v` forces `debug` regardless.

use env_logger::{Builder, Env};
use log::LevelFilter;

/// Builder reading its filter from `env`, defaulting to `info`
pub fn builder_from(env: Env<'_>, verbose: bool) -> Builder {
    let mut builder = Builder::from_env(env.default_filter_or("info"));
    if verbose {
        builder.filter_level(LevelFilter::Debug);
    }
    builder
}

/// Install the global logger from `RUST_LOG`
pub fn init(verbose: bool) {
    builder_from(Env::default(), verbose).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test reads its own variable so parallel tests never race
    fn env(var: &'static str) -> Env<'static> {
        Env::new().filter(var)
    }

    #[test]
    fn test_defaults_to_info() {
        let logger = builder_from(env("DNSFERRY_TEST_LOG_UNSET"), false).build();
        assert_eq!(logger.filter(), LevelFilter::Info);
    }

    #[test]
    fn test_env_filter_honoured() {
        std::env::set_var("DNSFERRY_TEST_LOG_DEBUG", "debug");
        let logger = builder_from(env("DNSFERRY_TEST_LOG_DEBUG"), false).build();
        assert_eq!(logger.filter(), LevelFilter::Debug);

        std::env::set_var("DNSFERRY_TEST_LOG_WARN", "warn");
        let logger = builder_from(env("DNSFERRY_TEST_LOG_WARN"), false).build();
        assert_eq!(logger.filter(), LevelFilter::Warn);
    }

    #[test]
    fn test_verbose_forces_debug() {
        std::env::set_var("DNSFERRY_TEST_LOG_ERROR", "error");
        let logger = builder_from(env("DNSFERRY_TEST_LOG_ERROR"), true).build();
        assert_eq!(logger.filter(), LevelFilter::Debug);
    }
}
