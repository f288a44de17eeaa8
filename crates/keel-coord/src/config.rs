//! Coordinator tuning

use crate::MitigationStrategy;
use std::time::Duration;

/// Detection thresholds and sweep cadence.
///
/// These are policy knobs, not invariants; the defaults suit
/// interactive agent workloads.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// How often the background sweep expires locks and runs detection
    pub sweep_interval: Duration,
    /// Transition history retained per agent
    pub livelock_window: usize,
    /// A pattern must repeat at least this many times
    pub livelock_min_repeats: usize,
    /// Longest state pattern considered a livelock
    pub livelock_max_period: usize,
    /// Silence longer than this counts as "no progress"
    pub progress_timeout: Duration,
    /// Strategy the sweep applies to its own detections; `None` leaves
    /// mitigation to the operator
    pub auto_mitigate: Option<MitigationStrategy>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_millis(500),
            livelock_window: 10,
            livelock_min_repeats: 3,
            livelock_max_period: 3,
            progress_timeout: Duration::from_secs(60),
            auto_mitigate: Some(MitigationStrategy::Abort),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_progress_timeout(mut self, timeout: Duration) -> Self {
        self.progress_timeout = timeout;
        self
    }

    pub fn with_auto_mitigate(mut self, strategy: Option<MitigationStrategy>) -> Self {
        self.auto_mitigate = strategy;
        self
    }

    pub fn with_livelock_window(mut self, window: usize) -> Self {
        self.livelock_window = window;
        self
    }
}
