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

use super::*;
use dashmap::DashMap;
use manta_common::error::MantaError;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

const SUBSCRIPTION_BUFFER: usize = 4096;

/// Reference backend for every GCS table, shared process-wide. All writes
/// are serialized per table through the owning map entry; subscriptions are
/// fan-out broadcasts of the applied writes in application order.
pub struct InMemoryGcs {
    jobs: DashMap<JobId, JobData>,
    actors: DashMap<ActorId, ActorData>,
    tasks: DashMap<TaskId, Task>,
    task_leases: DashMap<TaskId, TaskLeaseData>,
    /// The append-only reconstruction log; index-addressed, write-once.
    reconstruction_log: Mutex<HashMap<TaskId, Vec<TaskReconstructionData>>>,
    objects: DashMap<ObjectId, ObjectTableData>,
    heartbeats: DashMap<NodeId, HeartbeatData>,
    workers: DashMap<WorkerId, WorkerData>,
    actor_checkpoints: Mutex<HashMap<ActorId, Vec<ActorCheckpointData>>>,
    profile_events: Mutex<Vec<ProfileEvent>>,

    job_events: broadcast::Sender<JobData>,
    actor_events: broadcast::Sender<ActorData>,
    task_events: broadcast::Sender<Task>,
    task_lease_events: broadcast::Sender<TaskLeaseData>,
    object_events: broadcast::Sender<ObjectTableData>,
    heartbeat_events: broadcast::Sender<HeartbeatData>,
}

impl InMemoryGcs {
    pub fn new() -> Self {
        InMemoryGcs {
            jobs: DashMap::new(),
            actors: DashMap::new(),
            tasks: DashMap::new(),
            task_leases: DashMap::new(),
            reconstruction_log: Mutex::new(HashMap::new()),
            objects: DashMap::new(),
            heartbeats: DashMap::new(),
            workers: DashMap::new(),
            actor_checkpoints: Mutex::new(HashMap::new()),
            profile_events: Mutex::new(Vec::new()),
            job_events: broadcast::channel(SUBSCRIPTION_BUFFER).0,
            actor_events: broadcast::channel(SUBSCRIPTION_BUFFER).0,
            task_events: broadcast::channel(SUBSCRIPTION_BUFFER).0,
            task_lease_events: broadcast::channel(SUBSCRIPTION_BUFFER).0,
            object_events: broadcast::channel(SUBSCRIPTION_BUFFER).0,
            heartbeat_events: broadcast::channel(SUBSCRIPTION_BUFFER).0,
        }
    }
}

impl Default for InMemoryGcs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobTable for InMemoryGcs {
    async fn put(&self, data: JobData) -> Result<()> {
        self.jobs.insert(data.job_id, data.clone());
        let _ = self.job_events.send(data);
        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<JobData>> {
        Ok(self.jobs.get(job_id).map(|entry| entry.clone()))
    }

    async fn delete_by_job_id(&self, job_id: &JobId) -> Result<()> {
        if let Some(mut entry) = self.jobs.get_mut(job_id) {
            entry.is_dead = true;
            let data = entry.clone();
            drop(entry);
            let _ = self.job_events.send(data);
        }
        // The job's task rows go with it.
        TaskTable::delete_by_job_id(self, job_id).await
    }

    fn subscribe(&self) -> broadcast::Receiver<JobData> {
        self.job_events.subscribe()
    }
}

#[async_trait]
impl ActorTable for InMemoryGcs {
    async fn register(&self, data: ActorData) -> Result<()> {
        if self.actors.contains_key(&data.actor_id) {
            return Err(MantaError::key_error(format!(
                "actor {} already registered",
                data.actor_id
            )));
        }
        self.actors.insert(data.actor_id, data.clone());
        let _ = self.actor_events.send(data);
        Ok(())
    }

    async fn update(&self, data: ActorData) -> Result<()> {
        self.actors.insert(data.actor_id, data.clone());
        let _ = self.actor_events.send(data);
        Ok(())
    }

    async fn get(&self, actor_id: &ActorId) -> Result<Option<ActorData>> {
        Ok(self.actors.get(actor_id).map(|entry| entry.clone()))
    }

    fn subscribe(&self) -> broadcast::Receiver<ActorData> {
        self.actor_events.subscribe()
    }
}

#[async_trait]
impl TaskTable for InMemoryGcs {
    async fn add(&self, task: Task) -> Result<()> {
        self.tasks.insert(task.spec.task_id, task.clone());
        let _ = self.task_events.send(task);
        Ok(())
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<Task>> {
        Ok(self.tasks.get(task_id).map(|entry| entry.clone()))
    }

    async fn delete(&self, task_id: &TaskId) -> Result<()> {
        self.tasks.remove(task_id);
        Ok(())
    }

    async fn delete_by_job_id(&self, job_id: &JobId) -> Result<()> {
        self.tasks.retain(|_, task| task.spec.job_id != *job_id);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Task> {
        self.task_events.subscribe()
    }
}

#[async_trait]
impl TaskLeaseTable for InMemoryGcs {
    async fn add_task_lease(&self, lease: TaskLeaseData) -> Result<()> {
        self.task_leases.insert(lease.task_id, lease.clone());
        let _ = self.task_lease_events.send(lease);
        Ok(())
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<TaskLeaseData>> {
        Ok(self.task_leases.get(task_id).map(|entry| entry.clone()))
    }

    fn subscribe(&self) -> broadcast::Receiver<TaskLeaseData> {
        self.task_lease_events.subscribe()
    }
}

#[async_trait]
impl TaskReconstructionLog for InMemoryGcs {
    async fn append_at(
        &self,
        task_id: &TaskId,
        index: u32,
        data: TaskReconstructionData,
    ) -> Result<bool> {
        let mut log = self.reconstruction_log.lock().unwrap();
        let entries = log.entry(*task_id).or_default();
        if entries.len() != index as usize {
            debug!(
                %task_id,
                index,
                current = entries.len(),
                "conditional append lost the race"
            );
            return Ok(false);
        }
        entries.push(data);
        Ok(true)
    }

    async fn entries(&self, task_id: &TaskId) -> Result<Vec<TaskReconstructionData>> {
        let log = self.reconstruction_log.lock().unwrap();
        Ok(log.get(task_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl ObjectTable for InMemoryGcs {
    async fn add_location(
        &self,
        object_id: &ObjectId,
        node_id: NodeId,
        size: Option<u64>,
    ) -> Result<()> {
        let mut entry = self.objects.entry(*object_id).or_insert_with(|| ObjectTableData {
            object_id: *object_id,
            locations: Vec::new(),
            spilled_url: None,
            size: None,
        });
        if !entry.locations.contains(&node_id) {
            entry.locations.push(node_id);
        }
        if size.is_some() {
            entry.size = size;
        }
        let data = entry.clone();
        drop(entry);
        let _ = self.object_events.send(data);
        Ok(())
    }

    async fn remove_location(&self, object_id: &ObjectId, node_id: NodeId) -> Result<()> {
        if let Some(mut entry) = self.objects.get_mut(object_id) {
            entry.locations.retain(|existing| *existing != node_id);
            let data = entry.clone();
            drop(entry);
            let _ = self.object_events.send(data);
        }
        Ok(())
    }

    async fn set_spilled_url(&self, object_id: &ObjectId, url: Option<String>) -> Result<()> {
        let mut entry = self.objects.entry(*object_id).or_insert_with(|| ObjectTableData {
            object_id: *object_id,
            locations: Vec::new(),
            spilled_url: None,
            size: None,
        });
        entry.spilled_url = url;
        let data = entry.clone();
        drop(entry);
        let _ = self.object_events.send(data);
        Ok(())
    }

    async fn get(&self, object_id: &ObjectId) -> Result<ObjectTableData> {
        Ok(self
            .objects
            .get(object_id)
            .map(|entry| entry.clone())
            .unwrap_or_else(|| ObjectTableData {
                object_id: *object_id,
                locations: Vec::new(),
                spilled_url: None,
                size: None,
            }))
    }

    fn subscribe(&self) -> broadcast::Receiver<ObjectTableData> {
        self.object_events.subscribe()
    }
}

#[async_trait]
impl HeartbeatTable for InMemoryGcs {
    async fn report(&self, heartbeat: HeartbeatData) -> Result<()> {
        self.heartbeats.insert(heartbeat.node_id, heartbeat.clone());
        let _ = self.heartbeat_events.send(heartbeat);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<HeartbeatData> {
        self.heartbeat_events.subscribe()
    }

    async fn latest_batch(&self) -> Result<Vec<HeartbeatData>> {
        Ok(self
            .heartbeats
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }
}

#[async_trait]
impl WorkerTable for InMemoryGcs {
    async fn add_worker_info(&self, data: WorkerData) -> Result<()> {
        self.workers.insert(data.worker_id, data);
        Ok(())
    }

    async fn get_worker_info(&self, worker_id: &WorkerId) -> Result<Option<WorkerData>> {
        Ok(self.workers.get(worker_id).map(|entry| entry.clone()))
    }

    async fn report_worker_failure(&self, worker_id: &WorkerId) -> Result<()> {
        if let Some(mut entry) = self.workers.get_mut(worker_id) {
            entry.is_alive = false;
        }
        Ok(())
    }
}

#[async_trait]
impl ActorCheckpointTable for InMemoryGcs {
    async fn add_checkpoint(&self, data: ActorCheckpointData) -> Result<()> {
        let mut checkpoints = self.actor_checkpoints.lock().unwrap();
        checkpoints.entry(data.actor_id).or_default().push(data);
        Ok(())
    }

    async fn checkpoints(&self, actor_id: &ActorId) -> Result<Vec<ActorCheckpointData>> {
        let checkpoints = self.actor_checkpoints.lock().unwrap();
        Ok(checkpoints.get(actor_id).cloned().unwrap_or_default())
    }

    async fn latest_checkpoint_id(&self, actor_id: &ActorId) -> Result<Option<u64>> {
        let checkpoints = self.actor_checkpoints.lock().unwrap();
        Ok(checkpoints
            .get(actor_id)
            .and_then(|list| list.last())
            .map(|checkpoint| checkpoint.checkpoint_id))
    }
}

#[async_trait]
impl ProfileTable for InMemoryGcs {
    async fn append_batch(&self, events: Vec<ProfileEvent>) -> Result<()> {
        self.profile_events.lock().unwrap().extend(events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use manta_common::model::WorkerId;

    fn task_id(i: u8) -> TaskId {
        TaskId::for_driver(JobId::from_bytes([i, 0, 0, 0]), &WorkerId::from_bytes([i; 16]))
    }

    #[test]
    async fn conditional_append_admits_exactly_one_writer_per_index() {
        let gcs = InMemoryGcs::new();
        let id = task_id(1);
        let a = TaskReconstructionData {
            node_id: NodeId::from_bytes([1u8; 16]),
            num_reconstructions: 0,
        };
        let b = TaskReconstructionData {
            node_id: NodeId::from_bytes([2u8; 16]),
            num_reconstructions: 0,
        };
        assert!(gcs.append_at(&id, 0, a.clone()).await.unwrap());
        assert!(!gcs.append_at(&id, 0, b.clone()).await.unwrap());
        // The next index is free again.
        assert!(gcs.append_at(&id, 1, b).await.unwrap());
        assert_eq!(gcs.entries(&id).await.unwrap().len(), 2);
    }

    #[test]
    async fn append_out_of_order_is_rejected() {
        let gcs = InMemoryGcs::new();
        let id = task_id(2);
        let data = TaskReconstructionData {
            node_id: NodeId::from_bytes([1u8; 16]),
            num_reconstructions: 5,
        };
        assert!(!gcs.append_at(&id, 3, data).await.unwrap());
    }

    #[test]
    async fn object_locations_accumulate_and_shrink() {
        let gcs = InMemoryGcs::new();
        let object_id = ObjectId::for_task_return(&task_id(3), 0);
        let n1 = NodeId::from_bytes([1u8; 16]);
        let n2 = NodeId::from_bytes([2u8; 16]);
        gcs.add_location(&object_id, n1, Some(100)).await.unwrap();
        gcs.add_location(&object_id, n2, None).await.unwrap();
        gcs.add_location(&object_id, n1, None).await.unwrap();
        let entry = ObjectTable::get(&gcs, &object_id).await.unwrap();
        assert_eq!(entry.locations, vec![n1, n2]);
        assert_eq!(entry.size, Some(100));
        gcs.remove_location(&object_id, n1).await.unwrap();
        let entry = ObjectTable::get(&gcs, &object_id).await.unwrap();
        assert_eq!(entry.locations, vec![n2]);
    }

    #[test]
    async fn job_deletion_cascades_to_tasks() {
        let gcs = InMemoryGcs::new();
        let job = JobId::from_bytes([9, 0, 0, 0]);
        let spec = manta_common::model::TaskSpecBuilder::new(
            job,
            task_id(4),
            0,
            task_id(4),
            manta_common::model::Language::Rust,
            manta_common::model::FunctionDescriptor::new(["f"]),
            vec![],
            1,
            ResourceSet::new(),
            ResourceSet::new(),
        )
        .build();
        let task = Task::new(spec.clone(), vec![]);
        TaskTable::add(&gcs, task).await.unwrap();
        JobTable::put(
            &gcs,
            JobData {
                job_id: job,
                driver_node_id: NodeId::from_bytes([1u8; 16]),
                is_dead: false,
            },
        )
        .await
        .unwrap();
        JobTable::delete_by_job_id(&gcs, &job).await.unwrap();
        assert!(TaskTable::get(&gcs, &spec.task_id).await.unwrap().is_none());
        assert!(JobTable::get(&gcs, &job).await.unwrap().unwrap().is_dead);
    }
}
