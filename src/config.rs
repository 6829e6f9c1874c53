use std::path::PathBuf;
use std::time::Duration;

/// Policy applied by the scheduler when a calculation arrives and no worker
/// in the target pool is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoCapacityPolicy {
    /// Log a warning and discard the calculation. The bulk member stays
    /// unscheduled and is picked up again on the next pool reconcile.
    Drop,
    /// Re-offer the calculation to the scheduling channel after a delay.
    Requeue { delay_ms: u64 },
}

impl Default for NoCapacityPolicy {
    fn default() -> Self {
        NoCapacityPolicy::Drop
    }
}

/// Backoff parameters for a task queue's per-key rate limiter.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// First retry delay; doubles on each consecutive failure of a key.
    pub base_delay_ms: u64,
    /// Upper bound on the per-key delay.
    pub max_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5,
            max_delay_ms: 1000,
        }
    }
}

impl QueueConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Configuration for the scheduler loop that consumes the bounded
/// calculation channel.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Capacity of the calculation hand-off channel. Producers block when
    /// the scheduler falls behind.
    pub channel_capacity: usize,
    pub no_capacity_policy: NoCapacityPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            no_capacity_policy: NoCapacityPolicy::Drop,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Namespace whose objects this dispatcher manages. Events from other
    /// namespaces are filtered out at watch time.
    pub namespace: String,
    /// Root of the shared filesystem where factory output files land.
    pub shared_root: PathBuf,
    pub scheduler: SchedulerConfig,
    pub queue: QueueConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            namespace: "calc-dispatch".to_string(),
            shared_root: PathBuf::from("/var/lib/calc-dispatch"),
            scheduler: SchedulerConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub namespace: String,
    /// Name of the WorkerPool this agent registers into.
    pub worker_pool: String,
    /// Stable node identity; the key of this agent's pool entry.
    pub nodename: String,
    /// Display name reported in the pool entry; calculations are assigned
    /// against this name.
    pub hostname: String,
    pub heartbeat_interval_ms: u64,
    pub queue: QueueConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            namespace: "calc-dispatch".to_string(),
            worker_pool: "default".to_string(),
            nodename: "node-1".to_string(),
            hostname: "worker-1".to_string(),
            heartbeat_interval_ms: 10_000,
            queue: QueueConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn new(worker_pool: impl Into<String>, nodename: impl Into<String>) -> Self {
        Self {
            worker_pool: worker_pool.into(),
            nodename: nodename.into(),
            ..Default::default()
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_config_default() {
        let cfg = QueueConfig::default();
        assert_eq!(cfg.base_delay(), Duration::from_millis(5));
        assert_eq!(cfg.max_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn scheduler_config_default() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.channel_capacity, 64);
        assert_eq!(cfg.no_capacity_policy, NoCapacityPolicy::Drop);
    }

    #[test]
    fn dispatcher_config_new_overrides_namespace() {
        let cfg = DispatcherConfig::new("vega");
        assert_eq!(cfg.namespace, "vega");
        assert_eq!(cfg.shared_root, PathBuf::from("/var/lib/calc-dispatch"));
    }

    #[test]
    fn worker_config_new() {
        let cfg = WorkerConfig::new("pool-a", "node-7");
        assert_eq!(cfg.worker_pool, "pool-a");
        assert_eq!(cfg.nodename, "node-7");
        assert_eq!(cfg.heartbeat_interval(), Duration::from_millis(10_000));
    }
}
