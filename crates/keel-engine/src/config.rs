//! Engine configuration

fn default_max_parallel() -> usize {
    4
}

fn default_task_timeout_ms() -> u64 {
    30_000
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

/// Tunables for one orchestrator instance.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Upper bound on tasks executing concurrently within a wave.
    pub max_parallel_tasks: usize,
    /// Per-attempt wall-clock budget for tasks that declare none.
    /// Also bounds how long a parked human approval is awaited.
    pub default_task_timeout_ms: u64,
    /// How long a task waits for its declared resource locks. Doubles
    /// as the hold TTL enforced by the coordinator sweep.
    pub lock_acquire_timeout_ms: u64,
    /// Capture a cortex snapshot after every committed task.
    pub snapshot_on_success: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: default_max_parallel(),
            default_task_timeout_ms: default_task_timeout_ms(),
            lock_acquire_timeout_ms: default_lock_timeout_ms(),
            snapshot_on_success: true,
        }
    }
}

impl EngineConfig {
    pub fn with_max_parallel_tasks(mut self, max: usize) -> Self {
        self.max_parallel_tasks = max.max(1);
        self
    }

    pub fn with_default_task_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_task_timeout_ms = timeout_ms;
        self
    }

    pub fn with_lock_acquire_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.lock_acquire_timeout_ms = timeout_ms;
        self
    }

    pub fn with_snapshot_on_success(mut self, enabled: bool) -> Self {
        self.snapshot_on_success = enabled;
        self
    }
}
