// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use async_trait::async_trait;
use manta_common::error::{MantaError, Result};
use manta_common::metrics;
use manta_common::model::{ActorId, Language, ResourceSet, TaskId, WorkerId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Registered,
    Idle,
    Leased,
    Dead,
}

#[derive(Clone)]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    pub language: Language,
    pub state: WorkerState,
    pub assigned_task_id: Option<TaskId>,
    /// Set once the worker finished an actor-creation task; the worker is
    /// pinned to that actor until it dies.
    pub owned_actor_id: Option<ActorId>,
    pub resource_ids_held: ResourceSet,
}

/// Control handle over one worker process.
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    /// Graceful stop (SIGTERM for real processes).
    async fn shutdown(&self);
    /// Forced stop (SIGKILL).
    async fn kill(&self);
}

#[async_trait]
pub trait WorkerProcessFactory: Send + Sync {
    async fn start_worker(&self, language: Language) -> Result<Arc<dyn WorkerHandle>>;
}

struct WorkerEntry {
    record: WorkerRecord,
    handle: Option<Arc<dyn WorkerHandle>>,
}

#[derive(Default)]
struct PoolState {
    workers: HashMap<WorkerId, WorkerEntry>,
    num_starting: usize,
}

/// The node's worker processes: registration, idle bookkeeping, leasing for
/// task execution, actor pinning, and teardown.
pub struct WorkerPool {
    state: Mutex<PoolState>,
    factory: Arc<dyn WorkerProcessFactory>,
    kill_timeout: Duration,
    /// How many workers one forked process registers.
    workers_per_process: usize,
}

impl WorkerPool {
    pub fn new(
        factory: Arc<dyn WorkerProcessFactory>,
        kill_timeout: Duration,
        workers_per_process: usize,
    ) -> Self {
        WorkerPool {
            state: Mutex::new(PoolState::default()),
            factory,
            kill_timeout,
            workers_per_process: workers_per_process.max(1),
        }
    }

    /// Launches a new worker process. Each worker it hosts announces itself
    /// through `register_worker` once it has connected.
    pub async fn start_worker(&self, language: Language) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.num_starting += self.workers_per_process;
        }
        match self.factory.start_worker(language).await {
            Ok(_handle) => Ok(()),
            Err(error) => {
                let mut state = self.state.lock().unwrap();
                state.num_starting = state
                    .num_starting
                    .saturating_sub(self.workers_per_process);
                Err(error)
            }
        }
    }

    /// A newly forked worker connected. It starts out Registered and becomes
    /// Idle when it first asks for work.
    pub fn register_worker(
        &self,
        worker_id: WorkerId,
        language: Language,
        handle: Option<Arc<dyn WorkerHandle>>,
    ) {
        let mut state = self.state.lock().unwrap();
        state.num_starting = state.num_starting.saturating_sub(1);
        state.workers.insert(
            worker_id,
            WorkerEntry {
                record: WorkerRecord {
                    worker_id,
                    language,
                    state: WorkerState::Registered,
                    assigned_task_id: None,
                    owned_actor_id: None,
                    resource_ids_held: ResourceSet::new(),
                },
                handle,
            },
        );
        info!(%worker_id, %language, "worker registered");
        self.update_metrics(&state);
    }

    pub fn mark_idle(&self, worker_id: &WorkerId) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.workers.get_mut(worker_id) {
            if entry.record.state != WorkerState::Dead {
                entry.record.state = WorkerState::Idle;
            }
        }
        self.update_metrics(&state);
    }

    /// Pops an idle, unpinned worker of the given language.
    pub fn pop_idle(&self, language: Language) -> Option<WorkerId> {
        let mut state = self.state.lock().unwrap();
        let worker_id = state
            .workers
            .values()
            .find(|entry| {
                entry.record.state == WorkerState::Idle
                    && entry.record.language == language
                    && entry.record.owned_actor_id.is_none()
            })
            .map(|entry| entry.record.worker_id)?;
        Some(worker_id)
    }

    /// The idle worker pinned to this actor, if any.
    pub fn actor_worker(&self, actor_id: &ActorId) -> Option<(WorkerId, bool)> {
        let state = self.state.lock().unwrap();
        state
            .workers
            .values()
            .find(|entry| entry.record.owned_actor_id.as_ref() == Some(actor_id))
            .map(|entry| {
                (
                    entry.record.worker_id,
                    entry.record.state == WorkerState::Idle,
                )
            })
    }

    pub fn lease(
        &self,
        worker_id: &WorkerId,
        task_id: TaskId,
        resources: ResourceSet,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state.workers.get_mut(worker_id).ok_or_else(|| {
            MantaError::key_error(format!("leasing unknown worker {worker_id}"))
        })?;
        if entry.record.state != WorkerState::Idle {
            return Err(MantaError::invalid(format!(
                "worker {worker_id} is not idle"
            )));
        }
        entry.record.state = WorkerState::Leased;
        entry.record.assigned_task_id = Some(task_id);
        entry.record.resource_ids_held = resources;
        self.update_metrics(&state);
        Ok(())
    }

    /// Returns a leased worker to Idle, handing back the resources it held.
    pub fn return_worker(&self, worker_id: &WorkerId) -> Option<ResourceSet> {
        let mut state = self.state.lock().unwrap();
        let entry = state.workers.get_mut(worker_id)?;
        if entry.record.state != WorkerState::Leased {
            warn!(%worker_id, "returning a worker that was not leased");
            return None;
        }
        entry.record.state = WorkerState::Idle;
        entry.record.assigned_task_id = None;
        let held = std::mem::take(&mut entry.record.resource_ids_held);
        self.update_metrics(&state);
        Some(held)
    }

    /// Pins the worker to the actor it just created.
    pub fn bind_actor(&self, worker_id: &WorkerId, actor_id: ActorId) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.workers.get_mut(worker_id) {
            entry.record.owned_actor_id = Some(actor_id);
            debug!(%worker_id, %actor_id, "worker pinned to actor");
        }
    }

    /// Removes a worker that died or was told to go. Returns its final
    /// record so the caller can fail its in-flight task and release its
    /// resources.
    pub fn disconnect(&self, worker_id: &WorkerId) -> Option<WorkerRecord> {
        let mut state = self.state.lock().unwrap();
        let mut entry = state.workers.remove(worker_id)?;
        entry.record.state = WorkerState::Dead;
        self.update_metrics(&state);
        Some(entry.record)
    }

    pub fn worker_record(&self, worker_id: &WorkerId) -> Option<WorkerRecord> {
        let state = self.state.lock().unwrap();
        state
            .workers
            .get(worker_id)
            .map(|entry| entry.record.clone())
    }

    pub fn idle_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .workers
            .values()
            .filter(|entry| entry.record.state == WorkerState::Idle)
            .count()
    }

    pub fn num_starting(&self) -> usize {
        self.state.lock().unwrap().num_starting
    }

    /// Graceful teardown: ask every worker to stop, escalate to kill after
    /// the timeout.
    pub async fn drain(&self) {
        let handles: Vec<(WorkerId, Arc<dyn WorkerHandle>)> = {
            let mut state = self.state.lock().unwrap();
            let handles = state
                .workers
                .values()
                .filter_map(|entry| {
                    entry
                        .handle
                        .clone()
                        .map(|handle| (entry.record.worker_id, handle))
                })
                .collect();
            for entry in state.workers.values_mut() {
                entry.record.state = WorkerState::Dead;
            }
            handles
        };

        for (worker_id, handle) in &handles {
            debug!(%worker_id, "asking worker to shut down");
            handle.shutdown().await;
        }
        tokio::time::sleep(self.kill_timeout).await;
        for (worker_id, handle) in &handles {
            debug!(%worker_id, "killing worker");
            handle.kill().await;
        }
        self.state.lock().unwrap().workers.clear();
    }

    fn update_metrics(&self, state: &PoolState) {
        metrics::set_idle_workers(
            state
                .workers
                .values()
                .filter(|entry| entry.record.state == WorkerState::Idle)
                .count(),
        );
        metrics::set_leased_workers(
            state
                .workers
                .values()
                .filter(|entry| entry.record.state == WorkerState::Leased)
                .count(),
        );
    }
}

/// Factory that forks real worker processes from a configured command line.
pub struct ProcessWorkerFactory {
    pub program: String,
    pub args: Vec<String>,
}

struct ProcessWorkerHandle {
    child: Mutex<tokio::process::Child>,
}

#[async_trait]
impl WorkerHandle for ProcessWorkerHandle {
    async fn shutdown(&self) {
        let pid = self.child.lock().unwrap().id();
        if let Some(pid) = pid {
            // SIGTERM first; the kill escalation follows separately.
            let _ = tokio::process::Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .status()
                .await;
        }
    }

    async fn kill(&self) {
        let _ = self.child.lock().unwrap().start_kill();
    }
}

#[async_trait]
impl WorkerProcessFactory for ProcessWorkerFactory {
    async fn start_worker(&self, language: Language) -> Result<Arc<dyn WorkerHandle>> {
        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg("--language")
            .arg(language.to_string())
            .spawn()
            .map_err(|err| MantaError::io_error(format!("failed to start worker: {err}")))?;
        Ok(Arc::new(ProcessWorkerHandle {
            child: Mutex::new(child),
        }))
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use manta_common::model::{JobId, CPU_RESOURCE};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopHandle;

    #[async_trait]
    impl WorkerHandle for NoopHandle {
        async fn shutdown(&self) {}
        async fn kill(&self) {}
    }

    struct CountingFactory {
        started: AtomicUsize,
    }

    #[async_trait]
    impl WorkerProcessFactory for CountingFactory {
        async fn start_worker(&self, _language: Language) -> Result<Arc<dyn WorkerHandle>> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NoopHandle))
        }
    }

    fn pool() -> WorkerPool {
        WorkerPool::new(
            Arc::new(CountingFactory {
                started: AtomicUsize::new(0),
            }),
            Duration::from_millis(10),
            1,
        )
    }

    fn task(i: u8) -> TaskId {
        TaskId::for_driver(JobId::from_bytes([i, 0, 0, 0]), &WorkerId::from_bytes([i; 16]))
    }

    #[test]
    async fn lease_and_return_cycle_preserves_resources() {
        let pool = pool();
        let worker_id = WorkerId::new_random();
        pool.register_worker(worker_id, Language::Rust, Some(Arc::new(NoopHandle)));
        assert!(pool.pop_idle(Language::Rust).is_none());
        pool.mark_idle(&worker_id);
        assert_eq!(pool.pop_idle(Language::Rust), Some(worker_id));

        let resources = ResourceSet::from_units(&[(CPU_RESOURCE, 1)]);
        pool.lease(&worker_id, task(1), resources.clone()).unwrap();
        assert!(pool.pop_idle(Language::Rust).is_none());
        assert_eq!(pool.return_worker(&worker_id), Some(resources));
        assert_eq!(pool.pop_idle(Language::Rust), Some(worker_id));
    }

    #[test]
    async fn actor_bound_workers_are_not_shared() {
        let pool = pool();
        let worker_id = WorkerId::new_random();
        pool.register_worker(worker_id, Language::Rust, None);
        pool.mark_idle(&worker_id);
        let actor_id = ActorId::from_creation_task(&task(2));
        pool.bind_actor(&worker_id, actor_id);

        assert!(pool.pop_idle(Language::Rust).is_none());
        assert_eq!(pool.actor_worker(&actor_id), Some((worker_id, true)));
    }

    #[test]
    async fn disconnect_reports_the_in_flight_task() {
        let pool = pool();
        let worker_id = WorkerId::new_random();
        pool.register_worker(worker_id, Language::Rust, None);
        pool.mark_idle(&worker_id);
        pool.lease(&worker_id, task(3), ResourceSet::new()).unwrap();

        let record = pool.disconnect(&worker_id).unwrap();
        assert_eq!(record.assigned_task_id, Some(task(3)));
        assert!(pool.worker_record(&worker_id).is_none());
    }

    #[test]
    async fn drain_shuts_down_then_kills() {
        struct RecordingHandle {
            shutdowns: Arc<AtomicUsize>,
            kills: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl WorkerHandle for RecordingHandle {
            async fn shutdown(&self) {
                self.shutdowns.fetch_add(1, Ordering::SeqCst);
            }
            async fn kill(&self) {
                assert!(
                    self.shutdowns.load(Ordering::SeqCst) > 0,
                    "kill must follow the graceful shutdown"
                );
                self.kills.fetch_add(1, Ordering::SeqCst);
            }
        }

        let pool = pool();
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let kills = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            pool.register_worker(
                WorkerId::new_random(),
                Language::Rust,
                Some(Arc::new(RecordingHandle {
                    shutdowns: shutdowns.clone(),
                    kills: kills.clone(),
                })),
            );
        }

        pool.drain().await;
        assert_eq!(shutdowns.load(Ordering::SeqCst), 2);
        assert_eq!(kills.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_count(), 0);
        assert!(pool.worker_record(&WorkerId::new_random()).is_none());
    }

    #[test]
    async fn language_mismatch_pops_nothing() {
        let pool = pool();
        let worker_id = WorkerId::new_random();
        pool.register_worker(worker_id, Language::Python, None);
        pool.mark_idle(&worker_id);
        assert!(pool.pop_idle(Language::Rust).is_none());
        assert_eq!(pool.pop_idle(Language::Python), Some(worker_id));
    }
}
