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
use futures::{SinkExt, StreamExt};
use manta_common::error::{MantaError, Result};
use manta_common::frame::FrameCodec;
use manta_common::model::{JobId, Language, ObjectId, ResourceSet, Task, TaskId, WorkerId};
use manta_node::protocol::{NodeReply, NodeRequest};
use manta_node::NodeManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// The worker's connection to its node manager.
#[async_trait]
pub trait RayletClient: Send + Sync {
    async fn register(
        &self,
        worker_id: WorkerId,
        language: Language,
        is_driver: bool,
        job_id: JobId,
    ) -> Result<ResourceSet>;

    async fn submit_task(&self, task: Task) -> Result<()>;

    async fn get_task(&self, worker_id: WorkerId) -> Result<Task>;

    async fn task_done(&self, worker_id: WorkerId, task_id: TaskId) -> Result<()>;

    async fn fetch_or_reconstruct(
        &self,
        object_ids: Vec<ObjectId>,
        fetch_only: bool,
        task_id: TaskId,
    ) -> Result<()>;

    async fn notify_unblocked(&self, task_id: TaskId) -> Result<()>;

    async fn wait(
        &self,
        object_ids: Vec<ObjectId>,
        num_ready: u64,
        timeout: Duration,
    ) -> Result<(Vec<ObjectId>, Vec<ObjectId>)>;

    async fn cancel_task(&self, task_id: TaskId) -> Result<bool>;

    async fn free_objects(&self, object_ids: Vec<ObjectId>, local_only: bool) -> Result<()>;
}

/// Direct in-process binding to a node manager, used when worker and node
/// manager share a process.
pub struct LocalRayletClient {
    node_manager: Arc<NodeManager>,
}

impl LocalRayletClient {
    pub fn new(node_manager: Arc<NodeManager>) -> Arc<Self> {
        Arc::new(LocalRayletClient { node_manager })
    }
}

#[async_trait]
impl RayletClient for LocalRayletClient {
    async fn register(
        &self,
        worker_id: WorkerId,
        language: Language,
        is_driver: bool,
        job_id: JobId,
    ) -> Result<ResourceSet> {
        self.node_manager
            .register_worker(worker_id, language, is_driver, job_id)
            .await
    }

    async fn submit_task(&self, task: Task) -> Result<()> {
        self.node_manager.submit_task(task).await
    }

    async fn get_task(&self, worker_id: WorkerId) -> Result<Task> {
        self.node_manager.get_task(worker_id).await
    }

    async fn task_done(&self, worker_id: WorkerId, task_id: TaskId) -> Result<()> {
        self.node_manager.task_done(worker_id, task_id).await
    }

    async fn fetch_or_reconstruct(
        &self,
        object_ids: Vec<ObjectId>,
        fetch_only: bool,
        task_id: TaskId,
    ) -> Result<()> {
        self.node_manager
            .fetch_or_reconstruct(object_ids, fetch_only, task_id)
            .await
    }

    async fn notify_unblocked(&self, task_id: TaskId) -> Result<()> {
        self.node_manager.notify_unblocked(task_id).await
    }

    async fn wait(
        &self,
        object_ids: Vec<ObjectId>,
        num_ready: u64,
        timeout: Duration,
    ) -> Result<(Vec<ObjectId>, Vec<ObjectId>)> {
        self.node_manager.wait(object_ids, num_ready, timeout).await
    }

    async fn cancel_task(&self, task_id: TaskId) -> Result<bool> {
        self.node_manager.cancel_task(task_id).await
    }

    async fn free_objects(&self, object_ids: Vec<ObjectId>, local_only: bool) -> Result<()> {
        self.node_manager.free_objects(object_ids, local_only).await
    }
}

/// Framed socket client to a node manager. Requests on one connection are
/// strictly sequential, mirroring the server's per-connection reply order;
/// processes that mix long polls with control calls open two clients.
pub struct SocketRayletClient {
    framed: tokio::sync::Mutex<Framed<TcpStream, FrameCodec>>,
}

impl SocketRayletClient {
    pub async fn connect(host: &str, port: u16) -> Result<Arc<Self>> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Arc::new(SocketRayletClient {
            framed: tokio::sync::Mutex::new(Framed::new(stream, FrameCodec)),
        }))
    }

    async fn request(&self, request: NodeRequest) -> Result<NodeReply> {
        let mut framed = self.framed.lock().await;
        framed.send(request.to_frame()?).await?;
        match framed.next().await {
            Some(Ok(frame)) => NodeReply::from_frame(&frame),
            Some(Err(error)) => Err(error.into()),
            None => Err(MantaError::io_error("node manager connection closed")),
        }
    }

    async fn expect_ack(&self, request: NodeRequest) -> Result<()> {
        match self.request(request).await? {
            NodeReply::Ack => Ok(()),
            NodeReply::Error { error } => Err(error),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(reply: &NodeReply) -> MantaError {
    MantaError::io_error(format!("unexpected node manager reply: {reply:?}"))
}

#[async_trait]
impl RayletClient for SocketRayletClient {
    async fn register(
        &self,
        worker_id: WorkerId,
        language: Language,
        is_driver: bool,
        job_id: JobId,
    ) -> Result<ResourceSet> {
        match self
            .request(NodeRequest::RegisterClient {
                worker_id,
                language,
                is_driver,
                job_id,
            })
            .await?
        {
            NodeReply::Registered { assigned_resources } => Ok(assigned_resources),
            NodeReply::Error { error } => Err(error),
            other => Err(unexpected(&other)),
        }
    }

    async fn submit_task(&self, task: Task) -> Result<()> {
        self.expect_ack(NodeRequest::SubmitTask { task }).await
    }

    async fn get_task(&self, worker_id: WorkerId) -> Result<Task> {
        match self.request(NodeRequest::GetTask { worker_id }).await? {
            NodeReply::ExecuteTask { task } => Ok(task),
            NodeReply::Error { error } => Err(error),
            other => Err(unexpected(&other)),
        }
    }

    async fn task_done(&self, worker_id: WorkerId, task_id: TaskId) -> Result<()> {
        self.expect_ack(NodeRequest::TaskDone { worker_id, task_id })
            .await
    }

    async fn fetch_or_reconstruct(
        &self,
        object_ids: Vec<ObjectId>,
        fetch_only: bool,
        task_id: TaskId,
    ) -> Result<()> {
        self.expect_ack(NodeRequest::FetchOrReconstruct {
            object_ids,
            fetch_only,
            task_id,
        })
        .await
    }

    async fn notify_unblocked(&self, task_id: TaskId) -> Result<()> {
        self.expect_ack(NodeRequest::NotifyUnblocked { task_id })
            .await
    }

    async fn wait(
        &self,
        object_ids: Vec<ObjectId>,
        num_ready: u64,
        timeout: Duration,
    ) -> Result<(Vec<ObjectId>, Vec<ObjectId>)> {
        match self
            .request(NodeRequest::Wait {
                object_ids,
                num_ready,
                timeout_ms: timeout.as_millis() as u64,
            })
            .await?
        {
            NodeReply::WaitReply { ready, remaining } => Ok((ready, remaining)),
            NodeReply::Error { error } => Err(error),
            other => Err(unexpected(&other)),
        }
    }

    async fn cancel_task(&self, task_id: TaskId) -> Result<bool> {
        match self.request(NodeRequest::CancelTask { task_id }).await? {
            NodeReply::CancelReply { canceled } => Ok(canceled),
            NodeReply::Error { error } => Err(error),
            other => Err(unexpected(&other)),
        }
    }

    async fn free_objects(&self, object_ids: Vec<ObjectId>, local_only: bool) -> Result<()> {
        self.expect_ack(NodeRequest::FreeObjects {
            object_ids,
            local_only,
        })
        .await
    }
}
