//! Observability utilities for agents.

#![warn(missing_docs, clippy::pedantic)]

pub mod tracing_support {
    //! Structured tracing helpers.
    //!
    //! Filters come from `RUST_LOG` when it is set and parses, otherwise from
    //! the default directive supplied by the caller.

    use anyhow::{Context, Result};
    use tracing_subscriber::EnvFilter;

    /// Directive used when neither `RUST_LOG` nor the caller supplies one.
    pub const DEFAULT_FILTER: &str = "info";

    /// Formatting options for the process-wide subscriber.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TracingConfig {
        default_filter: String,
        with_target: bool,
        ansi: bool,
    }

    impl Default for TracingConfig {
        fn default() -> Self {
            Self::new(DEFAULT_FILTER)
        }
    }

    impl TracingConfig {
        /// Creates a configuration falling back to `default_filter`.
        #[must_use]
        pub fn new(default_filter: impl Into<String>) -> Self {
            Self {
                default_filter: default_filter.into(),
                with_target: false,
                ansi: true,
            }
        }

        /// Returns the fallback filter directive.
        #[must_use]
        pub fn default_filter(&self) -> &str {
            &self.default_filter
        }

        /// Includes event targets (module paths) in the output.
        #[must_use]
        pub const fn with_target(mut self, enabled: bool) -> Self {
            self.with_target = enabled;
            self
        }

        /// Enables or disables ANSI colours.
        #[must_use]
        pub const fn with_ansi(mut self, enabled: bool) -> Self {
            self.ansi = enabled;
            self
        }

        /// Builds the filter, preferring `RUST_LOG`.
        #[must_use]
        pub fn env_filter(&self) -> EnvFilter {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| self.fallback_filter())
        }

        fn fallback_filter(&self) -> EnvFilter {
            EnvFilter::try_new(&self.default_filter)
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
        }
    }

    /// Installs the global fmt subscriber with `default_filter` as fallback.
    ///
    /// # Panics
    ///
    /// Panics if a global subscriber is already installed. Use [`try_init`]
    /// where that can happen.
    pub fn init(default_filter: &str) {
        let config = TracingConfig::new(default_filter);
        tracing_subscriber::fmt()
            .with_env_filter(config.env_filter())
            .with_target(config.with_target)
            .with_ansi(config.ansi)
            .init();
    }

    /// Installs the global fmt subscriber described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if a global subscriber is already installed.
    pub fn try_init(config: &TracingConfig) -> Result<()> {
        tracing_subscriber::fmt()
            .with_env_filter(config.env_filter())
            .with_target(config.with_target)
            .with_ansi(config.ansi)
            .try_init()
            .map_err(|err| anyhow::anyhow!(err))
            .context("failed to install tracing subscriber")
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn invalid_default_falls_back_to_info() {
            let config = TracingConfig::new("=[not a directive");
            assert_eq!(config.fallback_filter().to_string(), DEFAULT_FILTER);
        }

        #[test]
        fn second_install_is_reported() {
            let config = TracingConfig::new("debug").with_ansi(false);
            let _ = try_init(&config);
            let second = try_init(&config);
            assert!(second.is_err());
        }
    }
}
