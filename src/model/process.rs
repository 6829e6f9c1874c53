use serde::{Deserialize, Serialize};

use super::labels;
use super::meta::ObjectMeta;

/// Mirror of a worker agent's host process, maintained by the deployment
/// layer. Its deletion is the liveness signal that triggers cleanup of the
/// calculations assigned to that worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerProcess {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub running: bool,
}

impl WorkerProcess {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name)
                .with_labels(&[(labels::ROLE, labels::ROLE_WORKER)]),
            running: false,
        }
    }

    pub fn is_worker(&self) -> bool {
        self.meta.label(labels::ROLE) == Some(labels::ROLE_WORKER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_process_carries_worker_role() {
        let process = WorkerProcess::new("ns", "worker-0");
        assert!(process.is_worker());
        assert!(!process.running);
    }

    #[test]
    fn unlabeled_process_is_not_a_worker() {
        let process = WorkerProcess {
            meta: ObjectMeta::new("ns", "other-0"),
            running: true,
        };
        assert!(!process.is_worker());
    }
}
