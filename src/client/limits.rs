//! Block I/O admission
//!
//! Two layers per operation class: a keyed semaphore per storage node and a
//! global semaphore for the whole process. Work takes the node permit first,
//! then the global one, and releases them in reverse order.

use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};

use crate::config::IoConfig;
use crate::domain::ids::NodeId;
use crate::error::{BlockOp, Error, Result};
use crate::sync::{KeyedPermit, KeyedSemaphore};

#[derive(Debug)]
struct OpLimit {
    global: Arc<Semaphore>,
    agent: KeyedSemaphore<NodeId>,
}

impl OpLimit {
    fn new(global: usize, agent: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global)),
            agent: KeyedSemaphore::new(agent),
        }
    }
}

#[derive(Debug)]
pub struct IoLimits {
    write: OpLimit,
    replicate: OpLimit,
    read: OpLimit,
}

/// Both permits of one admitted operation.
#[must_use = "the operation is admitted only while the permit is held"]
pub struct IoPermit<'a> {
    // field order drops the global permit before the node permit
    _global: SemaphorePermit<'a>,
    _agent: KeyedPermit<'a, NodeId>,
}

impl IoLimits {
    pub fn new(config: &IoConfig) -> Self {
        Self {
            write: OpLimit::new(config.write_concurrency_global, config.write_concurrency_agent),
            replicate: OpLimit::new(
                config.replicate_concurrency_global,
                config.replicate_concurrency_agent,
            ),
            read: OpLimit::new(config.read_concurrency_global, config.read_concurrency_agent),
        }
    }

    fn limit(&self, op: BlockOp) -> &OpLimit {
        match op {
            BlockOp::Write | BlockOp::Preallocate => &self.write,
            BlockOp::Replicate => &self.replicate,
            BlockOp::Read => &self.read,
        }
    }

    /// Wait for room on `node` and in the process for one `op`.
    pub async fn acquire(&self, op: BlockOp, node: NodeId) -> Result<IoPermit<'_>> {
        let limit = self.limit(op);
        let agent = limit.agent.acquire(node).await?;
        let global = limit
            .global
            .acquire()
            .await
            .map_err(|e| Error::Internal(format!("{} semaphore closed: {}", op, e)))?;
        Ok(IoPermit {
            _global: global,
            _agent: agent,
        })
    }

    /// Global permits currently free for `op`.
    pub fn available(&self, op: BlockOp) -> usize {
        self.limit(op).global.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config(global: usize, agent: usize) -> IoConfig {
        IoConfig {
            write_concurrency_global: global,
            write_concurrency_agent: agent,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_permits_released_on_drop() {
        let limits = IoLimits::new(&config(4, 2));
        {
            let _a = limits.acquire(BlockOp::Write, NodeId::new()).await.unwrap();
            assert_eq!(limits.available(BlockOp::Write), 3);
        }
        assert_eq!(limits.available(BlockOp::Write), 4);
        assert_eq!(limits.available(BlockOp::Read), 256);
    }

    #[tokio::test]
    async fn test_agent_limit_applies_per_node() {
        let limits = Arc::new(IoLimits::new(&config(64, 1)));
        let node = NodeId::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let limits = limits.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limits.acquire(BlockOp::Write, node).await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }
}
