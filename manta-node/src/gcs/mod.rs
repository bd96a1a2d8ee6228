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

pub mod in_memory;

use async_trait::async_trait;
use manta_common::error::Result;
use manta_common::model::{
    ActorId, ActorState, JobId, NodeAddress, NodeId, ObjectId, ResourceSet, Task, TaskId, WorkerId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobData {
    pub job_id: JobId,
    pub driver_node_id: NodeId,
    pub is_dead: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorData {
    pub actor_id: ActorId,
    pub state: ActorState,
    pub node_id: NodeId,
    pub worker_id: WorkerId,
    pub job_id: JobId,
    pub num_restarts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLeaseData {
    pub task_id: TaskId,
    pub node_id: NodeId,
    pub timeout_ms: u64,
}

/// One record of the task reconstruction log: who re-executes the task at
/// this attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReconstructionData {
    pub node_id: NodeId,
    pub num_reconstructions: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatData {
    pub node_id: NodeId,
    pub address: NodeAddress,
    pub static_resources: ResourceSet,
    pub available_resources: ResourceSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerData {
    pub worker_id: WorkerId,
    pub node_id: NodeId,
    pub is_alive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorCheckpointData {
    pub checkpoint_id: u64,
    pub actor_id: ActorId,
    /// Where the counter sequence resumes after a restore.
    pub last_executed_counter: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectTableData {
    pub object_id: ObjectId,
    pub locations: Vec<NodeId>,
    pub spilled_url: Option<String>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileEvent {
    pub component: String,
    pub event_type: String,
    pub start_ms: u64,
    pub end_ms: u64,
}

#[async_trait]
pub trait JobTable: Send + Sync {
    async fn put(&self, data: JobData) -> Result<()>;
    async fn get(&self, job_id: &JobId) -> Result<Option<JobData>>;
    /// Cascades: callers react through the subscription and drop their
    /// per-job rows.
    async fn delete_by_job_id(&self, job_id: &JobId) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<JobData>;
}

#[async_trait]
pub trait ActorTable: Send + Sync {
    async fn register(&self, data: ActorData) -> Result<()>;
    async fn update(&self, data: ActorData) -> Result<()>;
    async fn get(&self, actor_id: &ActorId) -> Result<Option<ActorData>>;
    fn subscribe(&self) -> broadcast::Receiver<ActorData>;
}

#[async_trait]
pub trait TaskTable: Send + Sync {
    async fn add(&self, task: Task) -> Result<()>;
    async fn get(&self, task_id: &TaskId) -> Result<Option<Task>>;
    async fn delete(&self, task_id: &TaskId) -> Result<()>;
    async fn delete_by_job_id(&self, job_id: &JobId) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<Task>;
}

#[async_trait]
pub trait TaskLeaseTable: Send + Sync {
    async fn add_task_lease(&self, lease: TaskLeaseData) -> Result<()>;
    async fn get(&self, task_id: &TaskId) -> Result<Option<TaskLeaseData>>;
    fn subscribe(&self) -> broadcast::Receiver<TaskLeaseData>;
}

/// Write-once-per-index log deciding the unique re-executor of a task.
#[async_trait]
pub trait TaskReconstructionLog: Send + Sync {
    /// Appends at `index`; returns whether this writer won the slot.
    async fn append_at(
        &self,
        task_id: &TaskId,
        index: u32,
        data: TaskReconstructionData,
    ) -> Result<bool>;
    async fn entries(&self, task_id: &TaskId) -> Result<Vec<TaskReconstructionData>>;
}

#[async_trait]
pub trait ObjectTable: Send + Sync {
    async fn add_location(&self, object_id: &ObjectId, node_id: NodeId, size: Option<u64>)
        -> Result<()>;
    async fn remove_location(&self, object_id: &ObjectId, node_id: NodeId) -> Result<()>;
    async fn set_spilled_url(&self, object_id: &ObjectId, url: Option<String>) -> Result<()>;
    async fn get(&self, object_id: &ObjectId) -> Result<ObjectTableData>;
    fn subscribe(&self) -> broadcast::Receiver<ObjectTableData>;
}

#[async_trait]
pub trait HeartbeatTable: Send + Sync {
    async fn report(&self, heartbeat: HeartbeatData) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<HeartbeatData>;
    /// Batched view of the latest heartbeat per node.
    async fn latest_batch(&self) -> Result<Vec<HeartbeatData>>;
}

#[async_trait]
pub trait WorkerTable: Send + Sync {
    async fn add_worker_info(&self, data: WorkerData) -> Result<()>;
    async fn get_worker_info(&self, worker_id: &WorkerId) -> Result<Option<WorkerData>>;
    async fn report_worker_failure(&self, worker_id: &WorkerId) -> Result<()>;
}

#[async_trait]
pub trait ActorCheckpointTable: Send + Sync {
    async fn add_checkpoint(&self, data: ActorCheckpointData) -> Result<()>;
    async fn checkpoints(&self, actor_id: &ActorId) -> Result<Vec<ActorCheckpointData>>;
    async fn latest_checkpoint_id(&self, actor_id: &ActorId) -> Result<Option<u64>>;
}

#[async_trait]
pub trait ProfileTable: Send + Sync {
    async fn append_batch(&self, events: Vec<ProfileEvent>) -> Result<()>;
}

/// The bundle of table clients a node manager consumes. Implementations are
/// swappable per table so tests can intercept individual ones.
#[derive(Clone)]
pub struct Gcs {
    pub jobs: Arc<dyn JobTable>,
    pub actors: Arc<dyn ActorTable>,
    pub tasks: Arc<dyn TaskTable>,
    pub task_leases: Arc<dyn TaskLeaseTable>,
    pub task_reconstruction_log: Arc<dyn TaskReconstructionLog>,
    pub objects: Arc<dyn ObjectTable>,
    pub heartbeats: Arc<dyn HeartbeatTable>,
    pub workers: Arc<dyn WorkerTable>,
    pub actor_checkpoints: Arc<dyn ActorCheckpointTable>,
    pub profile: Arc<dyn ProfileTable>,
}

impl Gcs {
    /// A process-local backend shared by every node of an in-process
    /// cluster.
    pub fn in_memory() -> Gcs {
        let backend = Arc::new(in_memory::InMemoryGcs::new());
        Gcs {
            jobs: backend.clone(),
            actors: backend.clone(),
            tasks: backend.clone(),
            task_leases: backend.clone(),
            task_reconstruction_log: backend.clone(),
            objects: backend.clone(),
            heartbeats: backend.clone(),
            workers: backend.clone(),
            actor_checkpoints: backend.clone(),
            profile: backend,
        }
    }
}
