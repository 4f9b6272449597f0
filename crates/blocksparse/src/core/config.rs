//! Run-time configuration for kernel dispatch.
//!
//! [`Config`] only controls how work is scheduled. Results are identical for
//! serial and parallel dispatch up to floating-point summation order.

/// Disables parallel dispatch when set to any value.
pub const FORCE_SERIAL_ENV: &str = "BLOCKSPARSE_FORCE_SERIAL";
/// Overrides [`Config::min_parallel_rows`].
pub const MIN_PARALLEL_ROWS_ENV: &str = "BLOCKSPARSE_MIN_PARALLEL_ROWS";

/// Scheduling knobs for the forward and backward kernels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Run row work items on the rayon thread pool.
    pub parallel: bool,
    /// Minimum number of (block-row, batch) work items before the kernels go
    /// parallel. Smaller calls run on the calling thread.
    pub min_parallel_rows: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            parallel: true,
            min_parallel_rows: 4,
        }
    }
}

impl Config {
    /// Serial configuration, mostly useful for debugging and tests.
    pub fn serial() -> Self {
        Self {
            parallel: false,
            ..Self::default()
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        if std::env::var_os(FORCE_SERIAL_ENV).is_some() {
            self.parallel = false;
        }
        if let Ok(raw) = std::env::var(MIN_PARALLEL_ROWS_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(rows) => self.min_parallel_rows = rows,
                Err(_) => log::warn!(
                    "ignoring {MIN_PARALLEL_ROWS_ENV}={raw:?}: expected an unsigned integer"
                ),
            }
        }
    }

    /// Whether `work_items` row tasks should be dispatched in parallel.
    pub(crate) fn use_parallel(&self, work_items: usize) -> bool {
        self.parallel && work_items >= self.min_parallel_rows.max(1)
    }
}
