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

use crate::scheduling::cluster_resource_scheduler::{ObjectLocality, SchedulingPolicy};
use crate::scheduling::ClusterView;
use crate::services::worker_pool::WorkerPool;
use manta_common::metrics;
use manta_common::model::{Language, NodeId, SchedulingClass, Task, TaskId, TaskType, WorkerId};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const MAX_SPILLBACK_DOUBLINGS: u32 = 6;

#[derive(Debug, Clone)]
pub struct ClusterTaskManagerConfig {
    pub spillback_backoff_min: Duration,
    pub forward_retry_timeout: Duration,
    pub actor_creation_num_spillbacks_warning: u32,
}

/// A task while it moves through the local scheduling pipeline.
pub struct Work {
    pub task: Task,
    /// Earliest moment the scheduler may look at this entry again.
    retry_at: Option<Instant>,
}

impl Work {
    fn new(task: Task) -> Self {
        Work {
            task,
            retry_at: None,
        }
    }
}

/// What `schedule_pending_tasks` decided for one task. Local tasks still
/// need their dependencies checked by the caller before they can dispatch.
pub enum ScheduleDecision {
    Local(Task),
    Spillback { task: Task, node_id: NodeId },
}

#[derive(Default)]
pub struct DispatchResult {
    pub dispatched: Vec<(Task, WorkerId)>,
    /// Languages for which dispatch stalled on a missing idle worker; the
    /// caller starts workers and retries when one registers.
    pub needs_workers: Vec<Language>,
}

/// The three-queue scheduling state machine: new tasks wait for a node
/// choice, chosen-local tasks wait for arguments, argument-complete tasks
/// wait for a worker. Queues are keyed by scheduling class; dispatch is
/// round-robin across classes and FIFO within one.
pub struct ClusterTaskManager {
    policy: Box<dyn SchedulingPolicy>,
    config: ClusterTaskManagerConfig,
    tasks_to_schedule: VecDeque<Work>,
    waiting_tasks: HashMap<TaskId, Work>,
    dispatch_queues: HashMap<SchedulingClass, VecDeque<Work>>,
    /// Round-robin rotation over the classes with queued work.
    dispatch_order: VecDeque<SchedulingClass>,
    dispatch_index: HashMap<TaskId, SchedulingClass>,
    running: HashMap<TaskId, WorkerId>,
}

impl ClusterTaskManager {
    pub fn new(policy: Box<dyn SchedulingPolicy>, config: ClusterTaskManagerConfig) -> Self {
        ClusterTaskManager {
            policy,
            config,
            tasks_to_schedule: VecDeque::new(),
            waiting_tasks: HashMap::new(),
            dispatch_queues: HashMap::new(),
            dispatch_order: VecDeque::new(),
            dispatch_index: HashMap::new(),
            running: HashMap::new(),
        }
    }

    /// Step 1: a submitted or forwarded task enters the pipeline. Tasks that
    /// bounced between nodes back off before they are considered again.
    pub fn queue_task(&mut self, task: Task, now: Instant) {
        let mut work = Work::new(task);
        let num_forwards = work.task.execution_spec.num_forwards;
        if num_forwards > 0 {
            let doublings = (num_forwards - 1).min(MAX_SPILLBACK_DOUBLINGS);
            work.retry_at = Some(now + self.config.spillback_backoff_min * 2u32.pow(doublings));
        }
        self.tasks_to_schedule.push_back(work);
    }

    /// Step 2: pick a node per queued task. Tasks without a feasible or
    /// available node stay queued for the next resource update.
    pub fn schedule_pending_tasks(
        &mut self,
        view: &ClusterView,
        locality: ObjectLocality<'_>,
        now: Instant,
    ) -> Vec<ScheduleDecision> {
        let mut decisions = Vec::new();
        let mut keep = VecDeque::new();
        while let Some(mut work) = self.tasks_to_schedule.pop_front() {
            if work.retry_at.map(|at| at > now).unwrap_or(false) {
                keep.push_back(work);
                continue;
            }
            match self.policy.schedule(&work.task.spec, view, locality) {
                None => keep.push_back(work),
                Some(node_id) if node_id == view.local_node_id() => {
                    metrics::record_task_scheduled(true);
                    decisions.push(ScheduleDecision::Local(work.task));
                }
                Some(node_id) => {
                    metrics::record_task_scheduled(false);
                    metrics::record_task_spilled_back();
                    work.task.execution_spec.num_forwards += 1;
                    let num_forwards = work.task.execution_spec.num_forwards;
                    if work.task.spec.task_type == TaskType::ActorCreation
                        && num_forwards % self.config.actor_creation_num_spillbacks_warning == 0
                    {
                        warn!(
                            task_id = %work.task.spec.task_id,
                            num_forwards,
                            "actor creation keeps spilling back; the cluster may lack its resources"
                        );
                    }
                    decisions.push(ScheduleDecision::Spillback {
                        task: work.task,
                        node_id,
                    });
                }
            }
        }
        self.tasks_to_schedule = keep;
        decisions
    }

    /// Step 3a: a locally placed task with missing arguments parks until the
    /// dependency manager reports them local.
    pub fn task_waiting(&mut self, task: Task) {
        self.waiting_tasks
            .insert(task.spec.task_id, Work::new(task));
    }

    /// Step 3b: arguments are all local; the task queues for a worker.
    pub fn task_ready(&mut self, task: Task) {
        let class = task.spec.scheduling_class();
        let queue = self.dispatch_queues.entry(class).or_default();
        if queue.is_empty() && !self.dispatch_order.contains(&class) {
            self.dispatch_order.push_back(class);
        }
        self.dispatch_index.insert(task.spec.task_id, class);
        queue.push_back(Work::new(task));
    }

    /// Waiting tasks whose dependencies arrived move on to dispatch.
    pub fn tasks_unblocked(&mut self, ready_ids: &[TaskId]) {
        for task_id in ready_ids {
            if let Some(work) = self.waiting_tasks.remove(task_id) {
                self.task_ready(work.task);
            }
        }
    }

    /// An argument of a queued-for-dispatch task was evicted; the task goes
    /// back to waiting.
    pub fn task_blocked(&mut self, task_id: &TaskId) {
        let Some(class) = self.dispatch_index.remove(task_id) else {
            return;
        };
        if let Some(queue) = self.dispatch_queues.get_mut(&class) {
            if let Some(position) = queue
                .iter()
                .position(|work| work.task.spec.task_id == *task_id)
            {
                let work = queue.remove(position).unwrap();
                self.waiting_tasks.insert(*task_id, work);
            }
        }
    }

    /// Step 4: marry dispatchable tasks with idle workers. One task per
    /// class per round so a hot class cannot starve the others; resources
    /// are re-checked at the moment of dispatch.
    pub fn dispatch(&mut self, pool: &WorkerPool, view: &mut ClusterView) -> DispatchResult {
        let mut result = DispatchResult::default();
        let mut classes_without_progress = 0;
        while classes_without_progress < self.dispatch_order.len() {
            let Some(class) = self.dispatch_order.pop_front() else {
                break;
            };
            let Some(queue) = self.dispatch_queues.get_mut(&class) else {
                continue;
            };
            let Some(head) = queue.front() else {
                self.dispatch_queues.remove(&class);
                continue;
            };

            let language = head.task.spec.language;
            let demand = head.task.spec.required_resources.clone();
            let Some(worker_id) = pool.pop_idle(language) else {
                if !result.needs_workers.contains(&language) {
                    result.needs_workers.push(language);
                }
                self.dispatch_order.push_back(class);
                classes_without_progress += 1;
                continue;
            };
            if !view.acquire_local(&demand) {
                // Another class took the capacity first; the head stays.
                self.dispatch_order.push_back(class);
                classes_without_progress += 1;
                continue;
            }

            let work = queue.pop_front().unwrap();
            let task_id = work.task.spec.task_id;
            if let Err(error) = pool.lease(&worker_id, task_id, demand.clone()) {
                warn!(%worker_id, %error, "lease failed, requeueing task");
                view.release_local(&demand);
                queue.push_front(work);
                self.dispatch_order.push_back(class);
                classes_without_progress += 1;
                continue;
            }

            debug!(%task_id, %worker_id, "task dispatched");
            metrics::record_task_dispatched();
            self.dispatch_index.remove(&task_id);
            self.running.insert(task_id, worker_id);
            result.dispatched.push((work.task, worker_id));
            classes_without_progress = 0;
            if !queue.is_empty() {
                self.dispatch_order.push_back(class);
            } else {
                self.dispatch_queues.remove(&class);
            }
        }
        result
    }

    pub fn task_done(&mut self, task_id: &TaskId) -> Option<WorkerId> {
        self.running.remove(task_id)
    }

    pub fn running_worker(&self, task_id: &TaskId) -> Option<WorkerId> {
        self.running.get(task_id).copied()
    }

    pub fn running_task_of(&self, worker_id: &WorkerId) -> Option<TaskId> {
        self.running
            .iter()
            .find(|(_, running_on)| *running_on == worker_id)
            .map(|(task_id, _)| *task_id)
    }

    /// Best effort: succeeds only while the task is still queued; running
    /// tasks finish and deliver their results.
    pub fn cancel_task(&mut self, task_id: &TaskId) -> bool {
        if let Some(position) = self
            .tasks_to_schedule
            .iter()
            .position(|work| work.task.spec.task_id == *task_id)
        {
            self.tasks_to_schedule.remove(position);
            return true;
        }
        if self.waiting_tasks.remove(task_id).is_some() {
            return true;
        }
        if let Some(class) = self.dispatch_index.remove(task_id) {
            if let Some(queue) = self.dispatch_queues.get_mut(&class) {
                if let Some(position) = queue
                    .iter()
                    .position(|work| work.task.spec.task_id == *task_id)
                {
                    queue.remove(position);
                    return true;
                }
            }
        }
        false
    }

    /// Removes every queued task of a finished job; the caller fails their
    /// return objects so waiters resolve.
    pub fn drain_job(&mut self, job_id: &manta_common::model::JobId) -> Vec<Task> {
        let mut drained = Vec::new();
        let mut keep = VecDeque::new();
        while let Some(work) = self.tasks_to_schedule.pop_front() {
            if work.task.spec.job_id == *job_id {
                drained.push(work.task);
            } else {
                keep.push_back(work);
            }
        }
        self.tasks_to_schedule = keep;

        let waiting_ids: Vec<TaskId> = self
            .waiting_tasks
            .iter()
            .filter(|(_, work)| work.task.spec.job_id == *job_id)
            .map(|(task_id, _)| *task_id)
            .collect();
        for task_id in waiting_ids {
            if let Some(work) = self.waiting_tasks.remove(&task_id) {
                drained.push(work.task);
            }
        }

        for queue in self.dispatch_queues.values_mut() {
            let mut kept = VecDeque::new();
            while let Some(work) = queue.pop_front() {
                if work.task.spec.job_id == *job_id {
                    self.dispatch_index.remove(&work.task.spec.task_id);
                    drained.push(work.task);
                } else {
                    kept.push_back(work);
                }
            }
            *queue = kept;
        }
        drained
    }

    /// The destination rejected a forward; the task re-enters scheduling
    /// after the configured pause.
    pub fn handle_forward_failure(&mut self, task: Task, now: Instant) {
        let mut work = Work::new(task);
        work.retry_at = Some(now + self.config.forward_retry_timeout);
        self.tasks_to_schedule.push_back(work);
    }

    pub fn num_tasks_to_schedule(&self) -> usize {
        self.tasks_to_schedule.len()
    }

    pub fn num_waiting(&self) -> usize {
        self.waiting_tasks.len()
    }

    pub fn num_ready_to_dispatch(&self) -> usize {
        self.dispatch_queues.values().map(|queue| queue.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::scheduling::cluster_resource_scheduler::CapacityLocalityPolicy;
    use crate::services::worker_pool::{WorkerHandle, WorkerPool, WorkerProcessFactory};
    use async_trait::async_trait;
    use manta_common::error::Result;
    use manta_common::model::{
        FunctionDescriptor, JobId, ObjectId, ResourceSet, TaskId, TaskSpecBuilder, CPU_RESOURCE,
    };
    use std::sync::Arc;

    struct NoopFactory;

    struct NoopHandle;

    #[async_trait]
    impl WorkerHandle for NoopHandle {
        async fn shutdown(&self) {}
        async fn kill(&self) {}
    }

    #[async_trait]
    impl WorkerProcessFactory for NoopFactory {
        async fn start_worker(
            &self,
            _language: Language,
        ) -> Result<Arc<dyn WorkerHandle>> {
            Ok(Arc::new(NoopHandle))
        }
    }

    fn manager() -> ClusterTaskManager {
        ClusterTaskManager::new(
            Box::new(CapacityLocalityPolicy),
            ClusterTaskManagerConfig {
                spillback_backoff_min: Duration::from_millis(100),
                forward_retry_timeout: Duration::from_millis(1000),
                actor_creation_num_spillbacks_warning: 100,
            },
        )
    }

    fn pool_with_idle(n: usize) -> WorkerPool {
        let pool = WorkerPool::new(Arc::new(NoopFactory), Duration::from_millis(10), 1);
        for _ in 0..n {
            let worker_id = manta_common::model::WorkerId::new_random();
            pool.register_worker(worker_id, Language::Rust, None);
            pool.mark_idle(&worker_id);
        }
        pool
    }

    fn task(descriptor: &str, cpus: i64, index: u32) -> Task {
        let driver = TaskId::for_driver(
            JobId::from_bytes([3, 3, 3, 3]),
            &WorkerId::from_bytes([1u8; 16]),
        );
        let spec = TaskSpecBuilder::new(
            JobId::from_bytes([3, 3, 3, 3]),
            driver,
            index,
            driver,
            Language::Rust,
            FunctionDescriptor::new([descriptor]),
            vec![],
            1,
            ResourceSet::from_units(&[(CPU_RESOURCE, cpus)]),
            ResourceSet::new(),
        )
        .build();
        Task::new(spec, vec![])
    }

    fn local_view(cpus: i64) -> ClusterView {
        ClusterView::new(
            NodeId::from_bytes([1u8; 16]),
            ResourceSet::from_units(&[(CPU_RESOURCE, cpus)]),
        )
    }

    fn no_locality(_: &ObjectId) -> Vec<(NodeId, u64)> {
        Vec::new()
    }

    #[test]
    fn pipeline_dispatches_a_ready_task() {
        let mut manager = manager();
        let mut view = local_view(2);
        let pool = pool_with_idle(1);

        manager.queue_task(task("f", 1, 0), Instant::now());
        let decisions =
            manager.schedule_pending_tasks(&view, &no_locality, Instant::now());
        assert_eq!(decisions.len(), 1);
        match decisions.into_iter().next().unwrap() {
            ScheduleDecision::Local(queued) => manager.task_ready(queued),
            ScheduleDecision::Spillback { .. } => panic!("must schedule locally"),
        }

        let result = manager.dispatch(&pool, &mut view);
        assert_eq!(result.dispatched.len(), 1);
        // available + held == static after the dispatch
        let held = ResourceSet::from_units(&[(CPU_RESOURCE, 1)]);
        assert_eq!(view.local_available().add(&held), *view.local_static());
    }

    #[test]
    fn resource_recheck_blocks_over_dispatch() {
        let mut manager = manager();
        let mut view = local_view(1);
        let pool = pool_with_idle(2);

        manager.queue_task(task("f", 1, 0), Instant::now());
        manager.queue_task(task("f", 1, 1), Instant::now());
        for decision in manager.schedule_pending_tasks(&view, &no_locality, Instant::now()) {
            match decision {
                ScheduleDecision::Local(queued) => manager.task_ready(queued),
                ScheduleDecision::Spillback { .. } => panic!("single node"),
            }
        }
        // Both pass the schedule-time check against the same 1 CPU; the
        // dispatch-time re-check holds the second one back.
        let result = manager.dispatch(&pool, &mut view);
        assert_eq!(result.dispatched.len(), 1);
        assert_eq!(manager.num_ready_to_dispatch(), 1);
        assert_eq!(manager.num_tasks_to_schedule(), 0);
    }

    #[test]
    fn round_robin_across_classes() {
        let mut manager = manager();
        let mut view = local_view(4);
        let pool = pool_with_idle(4);

        manager.queue_task(task("hot", 1, 0), Instant::now());
        manager.queue_task(task("hot", 1, 1), Instant::now());
        manager.queue_task(task("hot", 1, 2), Instant::now());
        manager.queue_task(task("cold", 1, 3), Instant::now());
        for decision in manager.schedule_pending_tasks(&view, &no_locality, Instant::now()) {
            match decision {
                ScheduleDecision::Local(queued) => manager.task_ready(queued),
                ScheduleDecision::Spillback { .. } => panic!("single node"),
            }
        }

        let result = manager.dispatch(&pool, &mut view);
        let order: Vec<String> = result
            .dispatched
            .iter()
            .map(|(task, _)| task.spec.function_descriptor.to_string())
            .collect();
        // The cold class gets a turn before the hot class drains.
        let cold_position = order.iter().position(|name| name == "cold").unwrap();
        assert!(cold_position <= 1, "cold was starved: {order:?}");
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn missing_workers_are_reported_once_per_language() {
        let mut manager = manager();
        let mut view = local_view(4);
        let pool = pool_with_idle(0);

        manager.queue_task(task("f", 1, 0), Instant::now());
        for decision in manager.schedule_pending_tasks(&view, &no_locality, Instant::now()) {
            match decision {
                ScheduleDecision::Local(queued) => manager.task_ready(queued),
                ScheduleDecision::Spillback { .. } => panic!("single node"),
            }
        }
        let result = manager.dispatch(&pool, &mut view);
        assert!(result.dispatched.is_empty());
        assert_eq!(result.needs_workers, vec![Language::Rust]);
        assert_eq!(manager.num_ready_to_dispatch(), 1);
    }

    #[test]
    fn cancel_succeeds_only_before_running() {
        let mut manager = manager();
        let mut view = local_view(2);
        let pool = pool_with_idle(1);

        let first = task("f", 1, 0);
        let first_id = first.spec.task_id;
        manager.queue_task(first, Instant::now());
        assert!(manager.cancel_task(&first_id));
        assert!(!manager.cancel_task(&first_id));

        let second = task("f", 1, 1);
        let second_id = second.spec.task_id;
        manager.queue_task(second, Instant::now());
        for decision in manager.schedule_pending_tasks(&view, &no_locality, Instant::now()) {
            match decision {
                ScheduleDecision::Local(queued) => manager.task_ready(queued),
                ScheduleDecision::Spillback { .. } => panic!("single node"),
            }
        }
        let result = manager.dispatch(&pool, &mut view);
        assert_eq!(result.dispatched.len(), 1);
        assert!(!manager.cancel_task(&second_id));
        assert_eq!(manager.running_worker(&second_id), Some(result.dispatched[0].1));
    }

    #[test]
    fn forwarded_tasks_back_off_before_rescheduling() {
        let mut manager = manager();
        let view = local_view(2);
        let now = Instant::now();

        let mut bounced = task("f", 1, 0);
        bounced.execution_spec.num_forwards = 2;
        manager.queue_task(bounced, now);
        assert!(manager
            .schedule_pending_tasks(&view, &no_locality, now)
            .is_empty());
        // After the backoff window it schedules.
        let later = now + Duration::from_millis(250);
        assert_eq!(
            manager
                .schedule_pending_tasks(&view, &no_locality, later)
                .len(),
            1
        );
    }

    #[test]
    fn job_drain_empties_every_queue() {
        let mut manager = manager();
        let view = local_view(4);

        let queued = task("f", 1, 0);
        manager.queue_task(queued, Instant::now());
        let waiting = task("f", 1, 1);
        manager.task_waiting(waiting);
        let ready = task("f", 1, 2);
        manager.task_ready(ready);

        let drained = manager.drain_job(&JobId::from_bytes([3, 3, 3, 3]));
        assert_eq!(drained.len(), 3);
        assert_eq!(manager.num_tasks_to_schedule(), 0);
        assert_eq!(manager.num_waiting(), 0);
        assert_eq!(manager.num_ready_to_dispatch(), 0);
        // Other jobs are untouched.
        let _ = view;
    }

    #[test]
    fn waiting_tasks_move_on_unblock() {
        let mut manager = manager();
        let t = task("f", 1, 0);
        let task_id = t.spec.task_id;
        manager.task_waiting(t);
        assert_eq!(manager.num_waiting(), 1);
        manager.tasks_unblocked(&[task_id]);
        assert_eq!(manager.num_waiting(), 0);
        assert_eq!(manager.num_ready_to_dispatch(), 1);
    }
}
