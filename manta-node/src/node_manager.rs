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

use crate::gcs::{Gcs, HeartbeatData, JobData, TaskLeaseData, WorkerData};
use crate::scheduling::actor_scheduling_queue::ActorSchedulingQueue;
use crate::scheduling::cluster_resource_scheduler::CapacityLocalityPolicy;
use crate::scheduling::cluster_task_manager::{
    ClusterTaskManager, ClusterTaskManagerConfig, ScheduleDecision,
};
use crate::scheduling::ClusterView;
use crate::services::dependency_manager::TaskDependencyManager;
use crate::services::object_directory::{LiveNodeView, ObjectDirectory};
use crate::services::object_manager::{ObjectManager, PeerClientPool};
use crate::services::pull_manager::PullManager;
use crate::services::reconstruction::ReconstructionPolicy;
use crate::services::worker_pool::{WorkerPool, WorkerProcessFactory};
use bytes::Bytes;
use dashmap::DashMap;
use manta_common::config::{NodeManagerConfig, ObjectManagerConfig};
use manta_common::error::{MantaError, Result};
use manta_common::model::{
    ActorHandleId, ActorId, ActorState, ErrorTag, JobId, Language, NodeAddress, NodeId, ObjectId,
    ObjectInfo, ObjectValue, ResourceSet, Task, TaskId, TaskType, WorkerId,
};
use manta_object_store::store::{PlasmaError, PlasmaStore, StoreNotification, LOCAL_CLIENT};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct RunningActorTask {
    actor_id: ActorId,
    actor_handle_id: ActorHandleId,
    actor_counter: u64,
    dummy_object_id: ObjectId,
    previous_cursor: Option<ObjectId>,
    delete_previous_cursor: bool,
    task: Task,
}

struct SchedulerState {
    task_manager: ClusterTaskManager,
    view: ClusterView,
    /// Counter sequences are per handle: every fork of an actor handle has
    /// its own strictly ordered stream of calls.
    actor_queues: HashMap<(ActorId, ActorHandleId), ActorSchedulingQueue>,
    /// Actor tasks whose dependencies are not yet local.
    actor_waiting: HashMap<TaskId, Task>,
    /// Actor tasks received before the actor's location is known.
    pending_actor_tasks: HashMap<ActorId, Vec<Task>>,
    actor_locations: HashMap<ActorId, NodeId>,
    /// Creation specs kept for re-running dead actors.
    actor_creation_tasks: HashMap<ActorId, Task>,
    running_actor_tasks: HashMap<TaskId, RunningActorTask>,
    /// Actor-creation tasks currently executing, by task id.
    running_creation_tasks: HashMap<TaskId, ActorId>,
    /// Specs of running normal tasks, for failure marking.
    running_tasks: HashMap<TaskId, Task>,
}

struct BlockedFetch {
    pull_request_id: u64,
    object_ids: Vec<ObjectId>,
}

/// The node-local supervisor: admits and schedules tasks, leases workers,
/// keeps the local store fed with the objects queued tasks need, and takes
/// part in cluster-wide heartbeating and reconstruction.
pub struct NodeManager {
    node_id: NodeId,
    address: NodeAddress,
    config: NodeManagerConfig,
    gcs: Gcs,
    store: Arc<PlasmaStore>,
    directory: Arc<dyn ObjectDirectory>,
    pull_manager: Arc<PullManager>,
    dependency_manager: Arc<TaskDependencyManager>,
    reconstruction: Arc<ReconstructionPolicy>,
    worker_pool: Arc<WorkerPool>,
    object_manager: Arc<ObjectManager>,
    peers: Arc<dyn PeerClientPool>,
    live_nodes: LiveNodeView,
    sched: Mutex<SchedulerState>,
    /// Directory-fed sizes and holders per object, for locality scoring.
    location_cache: Arc<DashMap<ObjectId, Vec<(NodeId, u64)>>>,
    task_senders: DashMap<WorkerId, mpsc::UnboundedSender<Task>>,
    task_receivers: DashMap<WorkerId, Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Task>>>>,
    blocked_fetches: Mutex<HashMap<String, BlockedFetch>>,
    resubmit_sender: mpsc::UnboundedSender<TaskId>,
    resubmit_receiver: Mutex<Option<mpsc::UnboundedReceiver<TaskId>>>,
    last_heartbeat_seen: DashMap<NodeId, Instant>,
    /// Recently submitted task ids, oldest first; the lineage this node
    /// keeps re-executable. Entries beyond the cap are evicted from the
    /// task table.
    lineage: Mutex<std::collections::VecDeque<TaskId>>,
}

impl NodeManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        address: NodeAddress,
        config: NodeManagerConfig,
        object_manager_config: ObjectManagerConfig,
        static_resources: ResourceSet,
        gcs: Gcs,
        store: Arc<PlasmaStore>,
        directory: Arc<dyn ObjectDirectory>,
        live_nodes: LiveNodeView,
        peers: Arc<dyn PeerClientPool>,
        worker_factory: Arc<dyn WorkerProcessFactory>,
    ) -> Arc<NodeManager> {
        let (resubmit_sender, resubmit_receiver) = mpsc::unbounded_channel();

        let pull_peers = peers.clone();
        let pull_node_id = node_id;
        let send_pull_request = Arc::new(move |object_id: ObjectId, target: NodeId| {
            let peers = pull_peers.clone();
            tokio::spawn(async move {
                if let Err(error) = peers.send_pull_request(target, object_id, pull_node_id).await
                {
                    debug!(%object_id, %target, %error, "pull request failed");
                }
            });
        });
        // Restore-from-spill is wired by the embedding process; the default
        // declines so pulls fall back to peers.
        let restore_spilled = Arc::new(|_object_id: ObjectId, _url: String| false);
        let pull_manager = Arc::new(PullManager::new(
            store.bytes_available(),
            object_manager_config.pull_timeout,
            send_pull_request,
            restore_spilled,
        ));

        let reconstruction_sender = resubmit_sender.clone();
        let reconstruction = Arc::new(ReconstructionPolicy::new(
            node_id,
            gcs.task_reconstruction_log.clone(),
            Arc::new(move |task_id| {
                let _ = reconstruction_sender.send(task_id);
            }),
        ));

        let object_manager = Arc::new(ObjectManager::new(
            node_id,
            store.clone(),
            peers.clone(),
            object_manager_config,
        ));

        let worker_pool = Arc::new(WorkerPool::new(
            worker_factory,
            config.kill_worker_timeout,
            config.num_workers_per_process,
        ));

        let task_manager = ClusterTaskManager::new(
            Box::new(CapacityLocalityPolicy),
            ClusterTaskManagerConfig {
                spillback_backoff_min: config.spillback_backoff_min,
                forward_retry_timeout: config.forward_task_retry_timeout,
                actor_creation_num_spillbacks_warning: config
                    .actor_creation_num_spillbacks_warning,
            },
        );

        live_nodes.set_alive(node_id);

        Arc::new(NodeManager {
            node_id,
            address,
            config,
            gcs,
            store,
            directory,
            pull_manager,
            dependency_manager: Arc::new(TaskDependencyManager::new()),
            reconstruction,
            worker_pool,
            object_manager,
            peers,
            live_nodes,
            sched: Mutex::new(SchedulerState {
                task_manager,
                view: ClusterView::new(node_id, static_resources),
                actor_queues: HashMap::new(),
                actor_waiting: HashMap::new(),
                pending_actor_tasks: HashMap::new(),
                actor_locations: HashMap::new(),
                actor_creation_tasks: HashMap::new(),
                running_actor_tasks: HashMap::new(),
                running_creation_tasks: HashMap::new(),
                running_tasks: HashMap::new(),
            }),
            location_cache: Arc::new(DashMap::new()),
            task_senders: DashMap::new(),
            task_receivers: DashMap::new(),
            blocked_fetches: Mutex::new(HashMap::new()),
            resubmit_sender,
            resubmit_receiver: Mutex::new(Some(resubmit_receiver)),
            last_heartbeat_seen: DashMap::new(),
            lineage: Mutex::new(std::collections::VecDeque::new()),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn store(&self) -> &Arc<PlasmaStore> {
        &self.store
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.worker_pool
    }

    pub fn pull_manager(&self) -> &Arc<PullManager> {
        &self.pull_manager
    }

    /// Spawns the periodic loops: heartbeat publication and folding, store
    /// notifications, pull retries, reconstruction ticks, task lease
    /// liveness, job lifecycle, and reconstruction re-submissions.
    pub fn start(self: &Arc<Self>) {
        self.spawn_heartbeat_reporter();
        self.spawn_heartbeat_listener();
        self.spawn_store_listener();
        self.spawn_pull_ticker();
        self.spawn_reconstruction_ticker();
        self.spawn_task_lease_listener();
        self.spawn_job_listener();
        self.spawn_resubmit_loop();

        // Pre-warm the worker pool up to the configured idle target.
        let this = self.clone();
        tokio::spawn(async move {
            for _ in 0..this.config.num_initial_workers {
                if let Err(error) = this.worker_pool.start_worker(Language::Rust).await {
                    warn!(%error, "failed to pre-start a worker");
                }
            }
        });

        info!(
            node_id = %self.node_id,
            protocol_version = self.config.protocol_version,
            "node manager started"
        );
    }

    // ----------------------------------------------------------------
    // Worker-facing operations
    // ----------------------------------------------------------------

    pub async fn register_worker(
        &self,
        worker_id: WorkerId,
        language: Language,
        is_driver: bool,
        job_id: JobId,
    ) -> Result<ResourceSet> {
        if is_driver {
            self.gcs
                .jobs
                .put(JobData {
                    job_id,
                    driver_node_id: self.node_id,
                    is_dead: false,
                })
                .await?;
        } else {
            self.worker_pool.register_worker(worker_id, language, None);
            let (sender, receiver) = mpsc::unbounded_channel();
            self.task_senders.insert(worker_id, sender);
            self.task_receivers
                .insert(worker_id, Arc::new(tokio::sync::Mutex::new(receiver)));
        }
        self.gcs
            .workers
            .add_worker_info(WorkerData {
                worker_id,
                node_id: self.node_id,
                is_alive: true,
            })
            .await?;
        Ok(ResourceSet::new())
    }

    pub async fn submit_task(self: &Arc<Self>, task: Task) -> Result<()> {
        debug!(task_id = %task.spec.task_id, task_type = %task.spec.task_type, "task submitted");
        self.gcs.tasks.add(task.clone()).await?;
        self.record_lineage(task.spec.task_id).await;
        match task.spec.task_type {
            TaskType::Actor => self.route_actor_task(task).await?,
            TaskType::ActorCreation => {
                let mut sched = self.sched.lock().unwrap();
                sched
                    .actor_creation_tasks
                    .insert(task.spec.actor_id, task.clone());
                sched.task_manager.queue_task(task, Instant::now());
            }
            TaskType::Normal => {
                let mut sched = self.sched.lock().unwrap();
                sched.task_manager.queue_task(task, Instant::now());
            }
        }
        self.schedule_and_dispatch().await;
        Ok(())
    }

    /// Long poll of a worker for its next assignment.
    pub async fn get_task(self: &Arc<Self>, worker_id: WorkerId) -> Result<Task> {
        let receiver = self
            .task_receivers
            .get(&worker_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                MantaError::key_error(format!("worker {worker_id} is not registered"))
            })?;
        let mut receiver = receiver.lock().await;
        // A task may already have been assigned between the previous
        // TaskDone and this poll; the worker is then still leased for it.
        if let Ok(task) = receiver.try_recv() {
            return Ok(task);
        }
        self.worker_pool.mark_idle(&worker_id);
        self.schedule_and_dispatch().await;
        receiver
            .recv()
            .await
            .ok_or_else(|| MantaError::interrupted("node manager shutting down"))
    }

    pub async fn task_done(self: &Arc<Self>, worker_id: WorkerId, task_id: TaskId) -> Result<()> {
        debug!(%task_id, %worker_id, "task done");
        let finished_creation = {
            let mut sched = self.sched.lock().unwrap();
            sched.task_manager.task_done(&task_id);
            sched.running_tasks.remove(&task_id);

            if let Some(running) = sched.running_actor_tasks.remove(&task_id) {
                let queue = sched
                    .actor_queues
                    .entry((running.actor_id, running.actor_handle_id))
                    .or_default();
                queue.on_executed(running.actor_counter);
                self.seal_dummy_object(running.dummy_object_id);
                if running.delete_previous_cursor {
                    if let Some(previous) = running.previous_cursor {
                        self.store.delete(&[previous]);
                    }
                }
                None
            } else {
                sched.running_creation_tasks.remove(&task_id)
            }
        };

        if let Some(actor_id) = finished_creation {
            self.finish_actor_creation(worker_id, actor_id).await?;
        }

        if let Some(released) = self.worker_pool.return_worker(&worker_id) {
            let mut sched = self.sched.lock().unwrap();
            sched.view.release_local(&released);
        }

        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0);
        let _ = self
            .gcs
            .profile
            .append_batch(vec![crate::gcs::ProfileEvent {
                component: "node_manager".to_string(),
                event_type: "task_done".to_string(),
                start_ms: now_ms,
                end_ms: now_ms,
            }])
            .await;

        self.schedule_and_dispatch().await;
        Ok(())
    }

    /// Keeps the re-executable lineage bounded: once more tasks than
    /// `max_lineage_size` have been submitted here, the oldest non-actor
    /// entries are forgotten and can no longer be reconstructed.
    async fn record_lineage(&self, task_id: TaskId) {
        let evicted = {
            let mut lineage = self.lineage.lock().unwrap();
            if let Some(position) = lineage.iter().position(|existing| *existing == task_id) {
                lineage.remove(position);
            }
            lineage.push_back(task_id);
            if lineage.len() > self.config.max_lineage_size as usize {
                lineage.pop_front()
            } else {
                None
            }
        };
        if let Some(evicted) = evicted {
            let keep = {
                let sched = self.sched.lock().unwrap();
                sched
                    .actor_creation_tasks
                    .values()
                    .any(|task| task.spec.task_id == evicted)
            };
            if !keep {
                debug!(task_id = %evicted, "evicting task from the lineage cache");
                let _ = self.gcs.tasks.delete(&evicted).await;
            }
        }
    }

    /// Records a checkpoint of the actor's executed-counter frontier; a
    /// later restore re-seeds the dispatch sequence from it.
    pub async fn save_actor_checkpoint(&self, actor_id: ActorId) -> Result<Option<u64>> {
        let next_counter = {
            let sched = self.sched.lock().unwrap();
            sched
                .actor_queues
                .get(&(actor_id, ActorHandleId::nil()))
                .map(|queue| queue.next_counter())
        };
        let Some(next_counter) = next_counter else {
            return Ok(None);
        };
        if next_counter == 0 {
            // Nothing executed yet; there is no frontier to record.
            return Ok(None);
        }
        let checkpoint_id = rand::random::<u64>();
        self.gcs
            .actor_checkpoints
            .add_checkpoint(crate::gcs::ActorCheckpointData {
                checkpoint_id,
                actor_id,
                last_executed_counter: next_counter - 1,
            })
            .await?;
        Ok(Some(checkpoint_id))
    }

    /// The worker is blocked on these objects: pull them here and, unless
    /// this is a plain prefetch, arrange reconstruction of ones that stay
    /// missing.
    pub async fn fetch_or_reconstruct(
        &self,
        object_ids: Vec<ObjectId>,
        fetch_only: bool,
        task_id: TaskId,
    ) -> Result<()> {
        self.fetch_keyed(object_ids, fetch_only, format!("fetch-{task_id}"))
            .await
    }

    async fn fetch_keyed(
        &self,
        object_ids: Vec<ObjectId>,
        fetch_only: bool,
        key: String,
    ) -> Result<()> {
        let missing: Vec<ObjectId> = object_ids
            .iter()
            .filter(|object_id| !self.store.contains(object_id))
            .copied()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        let (pull_request_id, lookups) = self.pull_manager.pull(&missing);
        for object_id in lookups {
            self.subscribe_object_locations(&key, object_id).await?;
        }
        if !fetch_only {
            for object_id in &missing {
                self.reconstruction.listen(*object_id);
            }
        }
        self.blocked_fetches.lock().unwrap().insert(
            key,
            BlockedFetch {
                pull_request_id,
                object_ids: missing,
            },
        );
        Ok(())
    }

    pub async fn notify_unblocked(&self, task_id: TaskId) -> Result<()> {
        self.unblock_keyed(&format!("fetch-{task_id}")).await
    }

    async fn unblock_keyed(&self, key: &str) -> Result<()> {
        let Some(fetch) = self.blocked_fetches.lock().unwrap().remove(key) else {
            return Ok(());
        };
        let to_cancel = self.pull_manager.cancel_pull(fetch.pull_request_id);
        for object_id in to_cancel {
            self.directory
                .unsubscribe_object_locations(key, object_id)
                .await?;
        }
        for object_id in fetch.object_ids {
            self.reconstruction.cancel(object_id);
        }
        Ok(())
    }

    /// Waits until `num_ready` of the objects are local (fetching them in
    /// the background), or the timeout expires with a partial result.
    pub async fn wait(
        &self,
        object_ids: Vec<ObjectId>,
        num_ready: u64,
        timeout: std::time::Duration,
    ) -> Result<(Vec<ObjectId>, Vec<ObjectId>)> {
        if num_ready as usize > object_ids.len() {
            return Err(MantaError::invalid(
                "num_ready exceeds the number of object ids",
            ));
        }
        let key = format!("wait-{:016x}", rand::random::<u64>());
        self.fetch_keyed(object_ids.clone(), true, key.clone()).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut subscription = self.store.subscribe();
        let result = loop {
            let ready: Vec<ObjectId> = object_ids
                .iter()
                .filter(|object_id| self.store.contains(object_id))
                .copied()
                .collect();
            if ready.len() >= num_ready as usize {
                let remaining = object_ids
                    .iter()
                    .filter(|object_id| !ready.contains(object_id))
                    .copied()
                    .collect();
                break (ready, remaining);
            }
            match tokio::time::timeout_at(deadline, subscription.recv()).await {
                Ok(Ok(_)) => continue,
                Ok(Err(_)) | Err(_) => {
                    let remaining = object_ids
                        .iter()
                        .filter(|object_id| !ready.contains(object_id))
                        .copied()
                        .collect();
                    break (ready, remaining);
                }
            }
        };
        self.unblock_keyed(&key).await?;
        Ok(result)
    }

    pub async fn free_objects(&self, object_ids: Vec<ObjectId>, local_only: bool) -> Result<()> {
        let mut peers = Vec::new();
        if !local_only {
            for object_id in &object_ids {
                let update = self.directory.lookup_locations(*object_id, None).await?;
                for node_id in update.node_ids {
                    if !peers.contains(&node_id) {
                        peers.push(node_id);
                    }
                }
            }
        }
        self.object_manager
            .free_objects(object_ids, local_only, peers)
            .await
    }

    pub async fn cancel_task(self: &Arc<Self>, task_id: TaskId) -> Result<bool> {
        let canceled = {
            let mut sched = self.sched.lock().unwrap();
            sched.task_manager.cancel_task(&task_id)
        };
        if canceled {
            if let Some(pull_request_id) =
                self.dependency_manager.unsubscribe_dependencies(&task_id)
            {
                let to_cancel = self.pull_manager.cancel_pull(pull_request_id);
                let callback_id = format!("task-{task_id}");
                for object_id in to_cancel {
                    self.directory
                        .unsubscribe_object_locations(&callback_id, object_id)
                        .await?;
                    self.reconstruction.cancel(object_id);
                }
            }
        }
        Ok(canceled)
    }

    /// A worker process died or disconnected. Its in-flight task fails with
    /// a system-exit marker so waiters wake; a pinned actor goes into
    /// reconstruction.
    pub async fn handle_worker_failure(
        self: &Arc<Self>,
        worker_id: WorkerId,
        intentional: bool,
    ) -> Result<()> {
        let Some(record) = self.worker_pool.disconnect(&worker_id) else {
            return Ok(());
        };
        warn!(%worker_id, intentional, "worker failed");
        self.gcs.workers.report_worker_failure(&worker_id).await?;
        self.task_senders.remove(&worker_id);
        self.task_receivers.remove(&worker_id);

        let tag = if intentional {
            ErrorTag::IntentionalSystemExit
        } else {
            ErrorTag::UnexpectedSystemExit
        };

        let mut actor_to_reconstruct = record.owned_actor_id;
        let mut failed_task = None;
        {
            let mut sched = self.sched.lock().unwrap();
            sched.view.release_local(&record.resource_ids_held);

            if let Some(task_id) = record.assigned_task_id {
                sched.task_manager.task_done(&task_id);
                if let Some(running) = sched.running_actor_tasks.remove(&task_id) {
                    // The call never completed; it reruns on the next
                    // incarnation in its original position.
                    let queue = sched
                        .actor_queues
                        .entry((running.actor_id, running.actor_handle_id))
                        .or_default();
                    queue.requeue(running.task);
                } else if let Some(actor_id) = sched.running_creation_tasks.remove(&task_id) {
                    // The actor never came up; run its creation again.
                    actor_to_reconstruct = Some(actor_id);
                } else if let Some(task) = sched.running_tasks.remove(&task_id) {
                    failed_task = Some(task);
                }
            }
        }

        if let Some(task) = failed_task {
            self.write_error_returns(&task, tag);
        }
        if let Some(actor_id) = actor_to_reconstruct {
            self.begin_actor_reconstruction(actor_id).await?;
        }
        self.schedule_and_dispatch().await;
        Ok(())
    }

    /// A driver went away: its job is finished, which cascades through the
    /// job table subscription on every node.
    pub async fn handle_driver_disconnect(&self, job_id: JobId) -> Result<()> {
        info!(%job_id, "driver disconnected, finishing its job");
        self.gcs.jobs.delete_by_job_id(&job_id).await
    }

    // ----------------------------------------------------------------
    // Peer-facing operations
    // ----------------------------------------------------------------

    pub async fn handle_forwarded_task(self: &Arc<Self>, task: Task) -> Result<()> {
        debug!(task_id = %task.spec.task_id, "received forwarded task");
        match task.spec.task_type {
            TaskType::Actor => self.route_actor_task(task).await?,
            TaskType::ActorCreation => {
                let mut sched = self.sched.lock().unwrap();
                sched
                    .actor_creation_tasks
                    .insert(task.spec.actor_id, task.clone());
                sched.task_manager.queue_task(task, Instant::now());
            }
            TaskType::Normal => {
                let mut sched = self.sched.lock().unwrap();
                sched.task_manager.queue_task(task, Instant::now());
            }
        }
        self.schedule_and_dispatch().await;
        Ok(())
    }

    pub async fn handle_pull_request(&self, object_id: ObjectId, requester: NodeId) -> Result<()> {
        self.object_manager
            .handle_pull_request(object_id, requester)
            .await
    }

    pub fn handle_push(
        &self,
        object_id: ObjectId,
        chunk_index: u64,
        num_chunks: u64,
        metadata_size: u64,
        data: Bytes,
    ) {
        self.object_manager
            .handle_push(object_id, chunk_index, num_chunks, metadata_size, data);
    }

    pub fn handle_free_objects(&self, object_ids: Vec<ObjectId>) {
        self.store.delete(&object_ids);
    }

    /// Serves the ownership-based directory lookups for owners hosted here;
    /// plain GCS-backed deployments never receive these.
    pub async fn handle_owner_location_update(
        &self,
        object_id: ObjectId,
        node_id: NodeId,
        size: Option<u64>,
        added: bool,
    ) -> Result<()> {
        if added {
            self.directory
                .report_object_added(
                    object_id,
                    node_id,
                    &ObjectInfo {
                        object_id,
                        data_size: size.unwrap_or(0),
                        metadata_size: 0,
                        content_hash: 0,
                    },
                )
                .await
        } else {
            self.directory.report_object_removed(object_id, node_id).await
        }
    }

    // ----------------------------------------------------------------
    // Scheduling pipeline
    // ----------------------------------------------------------------

    async fn route_actor_task(self: &Arc<Self>, task: Task) -> Result<()> {
        let actor_id = task.spec.actor_id;
        let destination = {
            let mut sched = self.sched.lock().unwrap();
            match sched.actor_locations.get(&actor_id) {
                Some(node_id) if *node_id == self.node_id => None,
                Some(node_id) => Some(*node_id),
                None => {
                    sched
                        .pending_actor_tasks
                        .entry(actor_id)
                        .or_default()
                        .push(task.clone());
                    return Ok(());
                }
            }
        };

        match destination {
            Some(node_id) => {
                debug!(task_id = %task.spec.task_id, %node_id, "forwarding actor task to its node");
                self.peers.forward_task(node_id, task).await
            }
            None => {
                self.admit_local_actor_task(task).await;
                Ok(())
            }
        }
    }

    /// Subscribes the actor task's dependencies (arguments plus the previous
    /// cursor) and queues it in counter order once they are local.
    async fn admit_local_actor_task(self: &Arc<Self>, task: Task) {
        let task_id = task.spec.task_id;
        let dependencies = task.all_dependencies();
        let ready = self
            .dependency_manager
            .subscribe_dependencies(task_id, &dependencies);
        if ready {
            self.dependency_manager.unsubscribe_dependencies(&task_id);
            let mut sched = self.sched.lock().unwrap();
            let key = (task.spec.actor_id, task.spec.actor_handle_id);
            sched.actor_queues.entry(key).or_default().push(task);
        } else {
            let missing = self.dependency_manager.missing_objects(&task_id);
            {
                let mut sched = self.sched.lock().unwrap();
                sched.actor_waiting.insert(task_id, task);
            }
            self.start_pulls_for_task(task_id, &missing).await;
        }
    }

    async fn start_pulls_for_task(&self, task_id: TaskId, missing: &[ObjectId]) {
        if missing.is_empty() {
            return;
        }
        let (pull_request_id, lookups) = self.pull_manager.pull(missing);
        self.dependency_manager
            .set_pull_request(&task_id, pull_request_id);
        let callback_id = format!("task-{task_id}");
        for object_id in lookups {
            if let Err(error) = self
                .subscribe_object_locations(&callback_id, object_id)
                .await
            {
                warn!(%object_id, %error, "location subscription failed");
            }
        }
        for object_id in missing {
            self.reconstruction.listen(*object_id);
        }
    }

    async fn subscribe_object_locations(
        &self,
        callback_id: &str,
        object_id: ObjectId,
    ) -> Result<()> {
        let pull_manager = self.pull_manager.clone();
        let reconstruction = self.reconstruction.clone();
        let location_cache = self.location_cache.clone();
        self.directory
            .subscribe_object_locations(
                callback_id,
                object_id,
                None,
                Arc::new(move |update| {
                    location_cache.insert(
                        update.object_id,
                        update
                            .node_ids
                            .iter()
                            .map(|node_id| (*node_id, update.size.unwrap_or(0)))
                            .collect(),
                    );
                    if !update.node_ids.is_empty() || update.spilled_url.is_some() {
                        // Someone still has it; that counts as liveness.
                        reconstruction.notify(update.object_id);
                    }
                    pull_manager.on_location_change(
                        update.object_id,
                        update.node_ids,
                        update.spilled_url,
                        update.size,
                    );
                }),
            )
            .await
    }

    /// One full pass of the pipeline: place queued tasks, forward spillback
    /// decisions, park local tasks on their dependencies, and marry ready
    /// tasks with idle workers.
    pub async fn schedule_and_dispatch(self: &Arc<Self>) {
        let decisions = {
            let mut sched = self.sched.lock().unwrap();
            let location_cache = self.location_cache.clone();
            let locality = move |object_id: &ObjectId| {
                location_cache
                    .get(object_id)
                    .map(|entry| entry.value().clone())
                    .unwrap_or_default()
            };
            let sched = &mut *sched;
            sched
                .task_manager
                .schedule_pending_tasks(&sched.view, &locality, Instant::now())
        };

        for decision in decisions {
            match decision {
                ScheduleDecision::Local(task) => {
                    let task_id = task.spec.task_id;
                    let dependencies = task.all_dependencies();
                    let ready = self
                        .dependency_manager
                        .subscribe_dependencies(task_id, &dependencies);
                    if ready {
                        self.dependency_manager.unsubscribe_dependencies(&task_id);
                        let mut sched = self.sched.lock().unwrap();
                        sched.task_manager.task_ready(task);
                    } else {
                        let missing = self.dependency_manager.missing_objects(&task_id);
                        {
                            let mut sched = self.sched.lock().unwrap();
                            sched.task_manager.task_waiting(task);
                        }
                        self.start_pulls_for_task(task_id, &missing).await;
                    }
                }
                ScheduleDecision::Spillback { task, node_id } => {
                    info!(
                        task_id = %task.spec.task_id,
                        %node_id,
                        num_forwards = task.execution_spec.num_forwards,
                        "spilling task back"
                    );
                    if let Err(error) = self.peers.forward_task(node_id, task.clone()).await {
                        warn!(%node_id, %error, "task forward failed, requeueing");
                        let mut sched = self.sched.lock().unwrap();
                        sched
                            .task_manager
                            .handle_forward_failure(task, Instant::now());
                    }
                }
            }
        }

        self.dispatch_round().await;
    }

    async fn dispatch_round(self: &Arc<Self>) {
        let (dispatched, needs_workers) = {
            let mut sched = self.sched.lock().unwrap();
            let sched = &mut *sched;
            let result = sched
                .task_manager
                .dispatch(&self.worker_pool, &mut sched.view);
            let mut dispatched = result.dispatched;
            for (task, _) in &dispatched {
                let task_id = task.spec.task_id;
                match task.spec.task_type {
                    TaskType::ActorCreation => {
                        sched
                            .running_creation_tasks
                            .insert(task_id, task.spec.actor_id);
                    }
                    _ => {
                        sched.running_tasks.insert(task_id, task.clone());
                    }
                }
            }

            // Actor calls run on their pinned worker in per-handle counter
            // order; the pinned worker serializes across handles.
            for ((actor_id, handle_id), queue) in sched.actor_queues.iter_mut() {
                let Some((worker_id, idle)) = self.worker_pool.actor_worker(actor_id) else {
                    continue;
                };
                if !idle {
                    continue;
                }
                let Some(task) = queue.pop_ready(true) else {
                    continue;
                };
                let task_id = task.spec.task_id;
                if self
                    .worker_pool
                    .lease(&worker_id, task_id, ResourceSet::new())
                    .is_ok()
                {
                    sched.running_actor_tasks.insert(
                        task_id,
                        RunningActorTask {
                            actor_id: *actor_id,
                            actor_handle_id: *handle_id,
                            actor_counter: task.spec.actor_counter,
                            dummy_object_id: ObjectId::for_task_return(
                                &task_id,
                                task.spec.num_returns - 1,
                            ),
                            previous_cursor: task
                                .execution_spec
                                .execution_dependencies
                                .first()
                                .copied(),
                            // The first call of a handle depends on a cursor
                            // another handle may still need; forked handles
                            // are tracked through new_actor_handles.
                            delete_previous_cursor: task.spec.new_actor_handles.is_empty()
                                && task.spec.actor_counter > 0,
                            task: task.clone(),
                        },
                    );
                    dispatched.push((task, worker_id));
                } else {
                    queue.requeue(task);
                }
            }
            (dispatched, result.needs_workers)
        };

        for language in needs_workers {
            if self.worker_pool.num_starting() == 0 {
                let pool = self.worker_pool.clone();
                tokio::spawn(async move {
                    if let Err(error) = pool.start_worker(language).await {
                        warn!(%language, %error, "failed to start a worker");
                    }
                });
            }
        }

        for (task, worker_id) in dispatched {
            let task_id = task.spec.task_id;
            self.add_task_lease(task_id).await;
            if let Some(sender) = self.task_senders.get(&worker_id) {
                if sender.send(task).is_err() {
                    warn!(%worker_id, "worker channel closed while dispatching");
                }
            }
        }
    }

    async fn add_task_lease(&self, task_id: TaskId) {
        let lease = TaskLeaseData {
            task_id,
            node_id: self.node_id,
            timeout_ms: self
                .config
                .initial_reconstruction_timeout
                .as_millis()
                .min(self.config.max_task_lease_timeout.as_millis())
                as u64,
        };
        if let Err(error) = self.gcs.task_leases.add_task_lease(lease).await {
            warn!(%task_id, %error, "failed to record task lease");
        }
    }

    async fn finish_actor_creation(
        self: &Arc<Self>,
        worker_id: WorkerId,
        actor_id: ActorId,
    ) -> Result<()> {
        self.worker_pool.bind_actor(&worker_id, actor_id);

        let job_id = {
            let sched = self.sched.lock().unwrap();
            sched
                .actor_creation_tasks
                .get(&actor_id)
                .map(|task| task.spec.job_id)
        };
        let existing = self.gcs.actors.get(&actor_id).await?;
        let data = crate::gcs::ActorData {
            actor_id,
            state: ActorState::Alive,
            node_id: self.node_id,
            worker_id,
            job_id: job_id
                .or_else(|| existing.as_ref().map(|data| data.job_id))
                .unwrap_or_else(JobId::nil),
            num_restarts: existing
                .as_ref()
                .map(|data| data.num_restarts + 1)
                .unwrap_or(0),
        };
        if existing.is_some() {
            self.gcs.actors.update(data).await?;
        } else {
            self.gcs.actors.register(data).await?;
        }

        let pending = {
            let mut sched = self.sched.lock().unwrap();
            sched.actor_locations.insert(actor_id, self.node_id);
            sched
                .actor_queues
                .entry((actor_id, ActorHandleId::nil()))
                .or_default();
            sched
                .pending_actor_tasks
                .remove(&actor_id)
                .unwrap_or_default()
        };
        for task in pending {
            self.admit_local_actor_task(task).await;
        }
        info!(%actor_id, %worker_id, "actor is alive");
        self.schedule_and_dispatch().await;
        Ok(())
    }

    async fn begin_actor_reconstruction(self: &Arc<Self>, actor_id: ActorId) -> Result<()> {
        if let Some(mut data) = self.gcs.actors.get(&actor_id).await? {
            data.state = ActorState::Reconstructing;
            self.gcs.actors.update(data).await?;
        }
        // Restore the counter sequence from the latest checkpoint, if one
        // was recorded.
        let checkpoints = self.gcs.actor_checkpoints.checkpoints(&actor_id).await?;
        if let Some(checkpoint) = checkpoints.last() {
            let mut sched = self.sched.lock().unwrap();
            if let Some(queue) = sched
                .actor_queues
                .get_mut(&(actor_id, ActorHandleId::nil()))
            {
                queue.reset_to(checkpoint.last_executed_counter + 1);
            }
        }

        let creation_task = {
            let sched = self.sched.lock().unwrap();
            sched.actor_creation_tasks.get(&actor_id).cloned()
        };
        match creation_task {
            Some(task) => {
                info!(%actor_id, task_id = %task.spec.task_id, "re-running actor creation");
                self.submit_task(task).await?;
            }
            None => {
                warn!(%actor_id, "no creation task recorded; actor is lost");
                if let Some(mut data) = self.gcs.actors.get(&actor_id).await? {
                    data.state = ActorState::Dead;
                    self.gcs.actors.update(data).await?;
                }
            }
        }
        Ok(())
    }

    fn seal_dummy_object(&self, object_id: ObjectId) {
        match self.store.create(LOCAL_CLIENT, object_id, 0, 0, true) {
            Ok(_) => {
                let _ = self.store.write(LOCAL_CLIENT, object_id, &[], &[]);
                self.store.seal(LOCAL_CLIENT, object_id);
            }
            Err(PlasmaError::ObjectExists) => {}
            Err(error) => {
                warn!(%object_id, %error, "failed to create actor cursor object");
            }
        }
    }

    /// Fails a task's returns with the given tag so waiters resolve instead
    /// of hanging.
    fn write_error_returns(&self, task: &Task, tag: ErrorTag) {
        let value = ObjectValue::error(tag);
        for object_id in task.spec.return_ids() {
            if self.store.contains(&object_id) {
                continue;
            }
            match self.store.create(
                LOCAL_CLIENT,
                object_id,
                value.data.len(),
                value.metadata.len(),
                true,
            ) {
                Ok(_) => {
                    let _ = self
                        .store
                        .write(LOCAL_CLIENT, object_id, &value.data, &value.metadata);
                    self.store.seal(LOCAL_CLIENT, object_id);
                }
                Err(PlasmaError::ObjectExists) => {}
                Err(error) => warn!(%object_id, %error, "failed to write error marker"),
            }
        }
    }

    // ----------------------------------------------------------------
    // Background loops
    // ----------------------------------------------------------------

    fn spawn_heartbeat_reporter(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.heartbeat_timeout);
            loop {
                ticker.tick().await;
                let (static_resources, available) = {
                    let sched = this.sched.lock().unwrap();
                    (
                        sched.view.local_static().clone(),
                        sched.view.local_available().clone(),
                    )
                };
                let heartbeat = HeartbeatData {
                    node_id: this.node_id,
                    address: this.address.clone(),
                    static_resources,
                    available_resources: available,
                };
                if let Err(error) = this.gcs.heartbeats.report(heartbeat).await {
                    warn!(%error, "failed to report heartbeat");
                }
            }
        });
    }

    fn spawn_heartbeat_listener(self: &Arc<Self>) {
        let this = self.clone();
        let mut events = self.gcs.heartbeats.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(heartbeat) => {
                        if heartbeat.node_id == this.node_id {
                            continue;
                        }
                        this.last_heartbeat_seen
                            .insert(heartbeat.node_id, Instant::now());
                        this.live_nodes.set_alive(heartbeat.node_id);
                        {
                            let mut sched = this.sched.lock().unwrap();
                            sched.view.update_node(
                                heartbeat.node_id,
                                heartbeat.static_resources,
                                heartbeat.available_resources,
                            );
                        }
                        // Remote capacity may unblock queued tasks.
                        this.schedule_and_dispatch().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        // Death fold: nodes that stop heartbeating for long enough are
        // removed from the live view and the scheduler.
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.heartbeat_timeout);
            loop {
                ticker.tick().await;
                let deadline =
                    this.config.heartbeat_timeout * this.config.num_heartbeats_timeout as u32;
                let dead: Vec<NodeId> = this
                    .last_heartbeat_seen
                    .iter()
                    .filter(|entry| entry.value().elapsed() > deadline)
                    .map(|entry| *entry.key())
                    .collect();
                for node_id in dead {
                    warn!(%node_id, "node declared dead");
                    this.last_heartbeat_seen.remove(&node_id);
                    this.live_nodes.mark_dead(&node_id);
                    let mut sched = this.sched.lock().unwrap();
                    sched.view.remove_node(&node_id);
                }
            }
        });
    }

    fn spawn_store_listener(self: &Arc<Self>) {
        let this = self.clone();
        let mut notifications = self.store.subscribe();
        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(StoreNotification::ObjectAdded(info)) => {
                        this.on_object_added(info).await;
                    }
                    Ok(StoreNotification::ObjectRemoved(object_id)) => {
                        this.on_object_removed(object_id).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "store notification listener lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn on_object_added(self: &Arc<Self>, info: ObjectInfo) {
        let object_id = info.object_id;
        if let Err(error) = self
            .directory
            .report_object_added(object_id, self.node_id, &info)
            .await
        {
            warn!(%object_id, %error, "failed to report object to the directory");
        }
        self.pull_manager.on_object_local(object_id);
        self.pull_manager
            .update_pulls_based_on_available_memory(self.store.bytes_available());
        self.reconstruction.cancel(object_id);

        let ready = self.dependency_manager.handle_object_local(object_id);
        if !ready.is_empty() {
            let mut sched = self.sched.lock().unwrap();
            let mut normal_ready = Vec::new();
            for task_id in ready {
                self.dependency_manager.unsubscribe_dependencies(&task_id);
                if let Some(task) = sched.actor_waiting.remove(&task_id) {
                    let key = (task.spec.actor_id, task.spec.actor_handle_id);
                    sched.actor_queues.entry(key).or_default().push(task);
                } else {
                    normal_ready.push(task_id);
                }
            }
            sched.task_manager.tasks_unblocked(&normal_ready);
        }
        self.schedule_and_dispatch().await;
    }

    async fn on_object_removed(self: &Arc<Self>, object_id: ObjectId) {
        if let Err(error) = self
            .directory
            .report_object_removed(object_id, self.node_id)
            .await
        {
            warn!(%object_id, %error, "failed to report removal to the directory");
        }
        let blocked = self.dependency_manager.handle_object_missing(object_id);
        if !blocked.is_empty() {
            {
                let mut sched = self.sched.lock().unwrap();
                for task_id in &blocked {
                    sched.task_manager.task_blocked(task_id);
                }
            }
            for task_id in blocked {
                let missing = self.dependency_manager.missing_objects(&task_id);
                self.start_pulls_for_task(task_id, &missing).await;
            }
        }
    }

    fn spawn_pull_ticker(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.fetch_timeout);
            loop {
                ticker.tick().await;
                this.pull_manager
                    .update_pulls_based_on_available_memory(this.store.bytes_available());
                this.pull_manager.tick(Instant::now());
            }
        });
    }

    fn spawn_reconstruction_ticker(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.reconstruction_timeout);
            loop {
                ticker.tick().await;
                if let Err(error) = this.reconstruction.tick().await {
                    warn!(%error, "reconstruction tick failed");
                }
            }
        });
    }

    fn spawn_task_lease_listener(self: &Arc<Self>) {
        let this = self.clone();
        let mut events = self.gcs.task_leases.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(lease) => {
                        if lease.node_id != this.node_id {
                            // Someone is executing the task; its returns are
                            // alive.
                            this.reconstruction.notify_task(&lease.task_id);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn spawn_job_listener(self: &Arc<Self>) {
        let this = self.clone();
        let mut events = self.gcs.jobs.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(job) if job.is_dead => {
                        info!(job_id = %job.job_id, "job finished, draining its tasks");
                        let drained = {
                            let mut sched = this.sched.lock().unwrap();
                            sched.task_manager.drain_job(&job.job_id)
                        };
                        for task in drained {
                            this.dependency_manager
                                .unsubscribe_dependencies(&task.spec.task_id);
                            this.write_error_returns(&task, ErrorTag::TaskFailed);
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn spawn_resubmit_loop(self: &Arc<Self>) {
        let this = self.clone();
        let receiver = self.resubmit_receiver.lock().unwrap().take();
        let Some(mut receiver) = receiver else {
            return;
        };
        tokio::spawn(async move {
            while let Some(task_id) = receiver.recv().await {
                match this.gcs.tasks.get(&task_id).await {
                    Ok(Some(task)) => {
                        info!(%task_id, "re-submitting task for reconstruction");
                        if let Err(error) = this.submit_task(task).await {
                            warn!(%task_id, %error, "reconstruction resubmission failed");
                        }
                    }
                    Ok(None) => {
                        warn!(%task_id, "reconstruction requested for an unknown task");
                    }
                    Err(error) => {
                        warn!(%task_id, %error, "task table read failed during reconstruction");
                    }
                }
            }
        });
    }
}
