use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::PoolConfig;
use crate::task::Task;

/// Named worker pools. Build tasks never compete with short synchronous ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    Sync,
    Async,
    Build,
    /// Diagnostic capability probes only
    Alternative,
}

impl PoolKind {
    pub fn for_task(task: &Task) -> Self {
        if task.is_async {
            PoolKind::Async
        } else if is_build_type(&task.task_type) {
            PoolKind::Build
        } else {
            PoolKind::Sync
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PoolKind::Sync => "sync",
            PoolKind::Async => "async",
            PoolKind::Build => "build",
            PoolKind::Alternative => "alternative",
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Task types following the build naming convention, e.g. `DOCKER_BUILD`.
pub fn is_build_type(task_type: &str) -> bool {
    task_type.to_ascii_uppercase().contains("BUILD")
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolOccupancy {
    pub pool: PoolKind,
    pub capacity: usize,
    pub active: usize,
    pub queued: usize,
}

/// A bounded pool: at most `capacity` submitted futures run at once.
#[derive(Debug)]
pub struct WorkerPool {
    kind: PoolKind,
    capacity: usize,
    permits: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
}

struct CountGuard(Arc<AtomicUsize>);

impl CountGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for CountGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    pub fn new(kind: PoolKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            active: Arc::new(AtomicUsize::new(0)),
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Queue `work`; it starts once a slot is free.
    pub fn spawn<F>(&self, work: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let active = Arc::clone(&self.active);
        let queued = CountGuard::new(&self.queued);
        let kind = self.kind;

        tokio::spawn(async move {
            let permit = permits.acquire_owned().await;
            drop(queued);
            let Ok(_permit) = permit else {
                tracing::warn!(pool = %kind, "Pool closed, dropping work");
                return;
            };
            let _active = CountGuard::new(&active);
            work.await;
        })
    }

    pub fn occupancy(&self) -> PoolOccupancy {
        PoolOccupancy {
            pool: self.kind,
            capacity: self.capacity,
            active: self.active.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug)]
pub struct ExecutorPools {
    sync: WorkerPool,
    async_tasks: WorkerPool,
    build: WorkerPool,
    alternative: WorkerPool,
}

impl ExecutorPools {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            sync: WorkerPool::new(PoolKind::Sync, config.sync),
            async_tasks: WorkerPool::new(PoolKind::Async, config.async_tasks),
            build: WorkerPool::new(PoolKind::Build, config.build),
            alternative: WorkerPool::new(PoolKind::Alternative, config.alternative),
        }
    }

    pub fn pool(&self, kind: PoolKind) -> &WorkerPool {
        match kind {
            PoolKind::Sync => &self.sync,
            PoolKind::Async => &self.async_tasks,
            PoolKind::Build => &self.build,
            PoolKind::Alternative => &self.alternative,
        }
    }

    pub fn for_task(&self, task: &Task) -> &WorkerPool {
        self.pool(PoolKind::for_task(task))
    }

    pub fn occupancy(&self) -> Vec<PoolOccupancy> {
        [
            PoolKind::Sync,
            PoolKind::Async,
            PoolKind::Build,
            PoolKind::Alternative,
        ]
        .into_iter()
        .map(|kind| self.pool(kind).occupancy())
        .collect()
    }
}
