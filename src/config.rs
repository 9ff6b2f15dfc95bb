use std::time::Duration;

/// Process-wide validation policy.
///
/// Plain data handed to [`Validator::new`](crate::Validator::new); loading it
/// from the environment or a config file is the embedder's business.
#[derive(Debug, Clone)]
pub struct Config {
    /// Master switch. When false every hook is a no-op returning success.
    pub enabled: bool,
    /// Suppress diagnostics sink output, keep error returns.
    pub quiet: bool,
    /// Downgrade `WrongOrder` and `WrongReleaseOrder` to reported warnings.
    pub soft_order: bool,
    /// Advisory flag for wrappers: panic instead of returning the violation.
    /// The core itself never panics on a violation.
    pub panic_on_violation: bool,
    /// Threshold applied to classes created implicitly by call site: order
    /// checking is skipped when the caller expects to wait less than this.
    pub min_order_check_wait: Duration,
    /// Same, for the deadlock-detection walk.
    pub min_block_check_wait: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enabled: true,
            quiet: false,
            soft_order: false,
            panic_on_violation: false,
            min_order_check_wait: Duration::ZERO,
            min_block_check_wait: Duration::ZERO,
        }
    }
}

impl Config {
    pub fn disabled() -> Self {
        Config { enabled: false, ..Config::default() }
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn soft_order(mut self) -> Self {
        self.soft_order = true;
        self
    }

    pub fn panic_on_violation(mut self) -> Self {
        self.panic_on_violation = true;
        self
    }
}
