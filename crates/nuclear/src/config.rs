//! Construction-time configuration (§6).

use std::num::NonZeroUsize;

/// Input to [`crate::power_plant::PowerPlant::new`].
#[derive(Clone, Debug)]
pub struct Configuration {
    /// Fixed size of the worker pool. Always at least one thread; enforced
    /// by the type rather than a runtime check.
    pub thread_count: NonZeroUsize,

    /// Default level passed through to the `log` facade installed by the
    /// embedding application; the kernel itself only ever calls
    /// `log::log!` at or below this as a courtesy default.
    pub default_log_level: log::LevelFilter,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            thread_count: NonZeroUsize::new(1).unwrap(),
            default_log_level: log::LevelFilter::Info,
        }
    }
}

impl Configuration {
    pub fn new(thread_count: NonZeroUsize) -> Self {
        Configuration {
            thread_count,
            ..Default::default()
        }
    }

    pub fn with_log_level(mut self, level: log::LevelFilter) -> Self {
        self.default_log_level = level;
        self
    }
}
