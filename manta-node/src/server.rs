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

use crate::node_manager::NodeManager;
use crate::protocol::{NodeReply, NodeRequest};
use crate::services::object_manager::PeerClientPool;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use manta_common::error::{MantaError, Result};
use manta_common::frame::FrameCodec;
use manta_common::model::{NodeAddress, NodeId, ObjectId, Task, WorkerId};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Serves the node-manager socket for local workers and peer node managers.
pub struct NodeServer {
    node_manager: Arc<NodeManager>,
}

impl NodeServer {
    pub fn new(node_manager: Arc<NodeManager>) -> Arc<Self> {
        Arc::new(NodeServer { node_manager })
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!("node manager listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "connection accepted");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(error) = server.handle_connection(stream).await {
                    debug!(%error, "node connection closed with error");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> std::io::Result<()> {
        let mut framed = Framed::new(stream, FrameCodec);
        // Set when a worker or driver registers on this connection so its
        // death is noticed when the socket drops.
        let mut registered_worker: Option<WorkerId> = None;
        let mut registered_driver_job: Option<manta_common::model::JobId> = None;

        while let Some(frame) = framed.next().await {
            let frame = frame?;
            let request = match NodeRequest::from_frame(&frame) {
                Ok(request) => request,
                Err(error) => {
                    warn!(%error, "undecodable node request");
                    let reply = NodeReply::Error { error };
                    framed.send(reply.to_frame().unwrap()).await?;
                    continue;
                }
            };

            if let NodeRequest::RegisterClient {
                worker_id,
                is_driver,
                job_id,
                ..
            } = &request
            {
                if *is_driver {
                    registered_driver_job = Some(*job_id);
                } else {
                    registered_worker = Some(*worker_id);
                }
            }

            let reply = self.handle_request(request).await;
            framed.send(reply.to_frame().unwrap()).await?;
        }

        if let Some(worker_id) = registered_worker {
            let _ = self
                .node_manager
                .handle_worker_failure(worker_id, false)
                .await;
        }
        if let Some(job_id) = registered_driver_job {
            let _ = self.node_manager.handle_driver_disconnect(job_id).await;
        }
        Ok(())
    }

    async fn handle_request(&self, request: NodeRequest) -> NodeReply {
        match request {
            NodeRequest::RegisterClient {
                worker_id,
                language,
                is_driver,
                job_id,
            } => match self
                .node_manager
                .register_worker(worker_id, language, is_driver, job_id)
                .await
            {
                Ok(assigned_resources) => NodeReply::Registered { assigned_resources },
                Err(error) => NodeReply::Error { error },
            },
            NodeRequest::SubmitTask { task } => {
                match self.node_manager.submit_task(task).await {
                    Ok(()) => NodeReply::Ack,
                    Err(error) => NodeReply::Error { error },
                }
            }
            NodeRequest::GetTask { worker_id } => {
                match self.node_manager.get_task(worker_id).await {
                    Ok(task) => NodeReply::ExecuteTask { task },
                    Err(error) => NodeReply::Error { error },
                }
            }
            NodeRequest::TaskDone { worker_id, task_id } => {
                match self.node_manager.task_done(worker_id, task_id).await {
                    Ok(()) => NodeReply::Ack,
                    Err(error) => NodeReply::Error { error },
                }
            }
            NodeRequest::FetchOrReconstruct {
                object_ids,
                fetch_only,
                task_id,
            } => {
                match self
                    .node_manager
                    .fetch_or_reconstruct(object_ids, fetch_only, task_id)
                    .await
                {
                    Ok(()) => NodeReply::Ack,
                    Err(error) => NodeReply::Error { error },
                }
            }
            NodeRequest::NotifyUnblocked { task_id } => {
                match self.node_manager.notify_unblocked(task_id).await {
                    Ok(()) => NodeReply::Ack,
                    Err(error) => NodeReply::Error { error },
                }
            }
            NodeRequest::Wait {
                object_ids,
                num_ready,
                timeout_ms,
            } => {
                match self
                    .node_manager
                    .wait(object_ids, num_ready, Duration::from_millis(timeout_ms))
                    .await
                {
                    Ok((ready, remaining)) => NodeReply::WaitReply { ready, remaining },
                    Err(error) => NodeReply::Error { error },
                }
            }
            NodeRequest::CancelTask { task_id } => {
                match self.node_manager.cancel_task(task_id).await {
                    Ok(canceled) => NodeReply::CancelReply { canceled },
                    Err(error) => NodeReply::Error { error },
                }
            }
            NodeRequest::FreeObjects {
                object_ids,
                local_only,
            } => match self.node_manager.free_objects(object_ids, local_only).await {
                Ok(()) => NodeReply::Ack,
                Err(error) => NodeReply::Error { error },
            },
            NodeRequest::ForwardTask { task } => {
                match self.node_manager.handle_forwarded_task(task).await {
                    Ok(()) => NodeReply::Ack,
                    Err(error) => NodeReply::Error { error },
                }
            }
            NodeRequest::Pull {
                object_id,
                requester,
            } => match self.node_manager.handle_pull_request(object_id, requester).await {
                Ok(()) => NodeReply::Ack,
                Err(error) => NodeReply::Error { error },
            },
            NodeRequest::Push {
                object_id,
                chunk_index,
                num_chunks,
                metadata_size,
                data,
            } => {
                self.node_manager
                    .handle_push(object_id, chunk_index, num_chunks, metadata_size, data);
                NodeReply::Ack
            }
            NodeRequest::AddObjectLocationOwner {
                object_id,
                node_id,
                size,
            } => {
                match self
                    .node_manager
                    .handle_owner_location_update(object_id, node_id, size, true)
                    .await
                {
                    Ok(()) => NodeReply::Ack,
                    Err(error) => NodeReply::Error { error },
                }
            }
            NodeRequest::RemoveObjectLocationOwner { object_id, node_id } => {
                match self
                    .node_manager
                    .handle_owner_location_update(object_id, node_id, None, false)
                    .await
                {
                    Ok(()) => NodeReply::Ack,
                    Err(error) => NodeReply::Error { error },
                }
            }
            NodeRequest::GetObjectLocationsOwner { object_id, .. } => NodeReply::Error {
                error: MantaError::not_implemented(format!(
                    "owner location polling for {object_id} is served by worker processes"
                )),
            },
        }
    }
}

/// Peer client pool speaking the node wire protocol over TCP. One pooled
/// connection per peer; requests on a connection are sequential.
pub struct SocketPeerPool {
    addresses: Arc<DashMap<NodeId, NodeAddress>>,
    connections: DashMap<NodeId, Arc<tokio::sync::Mutex<Option<Framed<TcpStream, FrameCodec>>>>>,
}

impl SocketPeerPool {
    pub fn new(addresses: Arc<DashMap<NodeId, NodeAddress>>) -> Arc<Self> {
        Arc::new(SocketPeerPool {
            addresses,
            connections: DashMap::new(),
        })
    }

    pub fn set_address(&self, node_id: NodeId, address: NodeAddress) {
        self.addresses.insert(node_id, address);
    }

    async fn request(&self, to: NodeId, request: NodeRequest) -> Result<NodeReply> {
        let slot = self
            .connections
            .entry(to)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
            .value()
            .clone();
        let mut slot = slot.lock().await;

        if slot.is_none() {
            let address = self
                .addresses
                .get(&to)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| {
                    MantaError::io_error(format!("no known address for node {to}"))
                })?;
            let stream = TcpStream::connect((address.host.as_str(), address.port)).await?;
            *slot = Some(Framed::new(stream, FrameCodec));
        }

        let framed = slot.as_mut().unwrap();
        let outcome = async {
            framed.send(request.to_frame()?).await?;
            match framed.next().await {
                Some(Ok(frame)) => NodeReply::from_frame(&frame),
                Some(Err(error)) => Err(error.into()),
                None => Err(MantaError::io_error("peer connection closed")),
            }
        }
        .await;

        if outcome.is_err() {
            // Drop the broken connection; the next request redials.
            *slot = None;
        }
        outcome
    }

    async fn expect_ack(&self, to: NodeId, request: NodeRequest) -> Result<()> {
        match self.request(to, request).await? {
            NodeReply::Ack => Ok(()),
            NodeReply::Error { error } => Err(error),
            other => Err(MantaError::io_error(format!(
                "unexpected peer reply: {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl PeerClientPool for SocketPeerPool {
    async fn send_pull_request(
        &self,
        to: NodeId,
        object_id: ObjectId,
        requester: NodeId,
    ) -> Result<()> {
        self.expect_ack(
            to,
            NodeRequest::Pull {
                object_id,
                requester,
            },
        )
        .await
    }

    async fn send_push(
        &self,
        to: NodeId,
        object_id: ObjectId,
        chunk_index: u64,
        num_chunks: u64,
        metadata_size: u64,
        data: Bytes,
    ) -> Result<()> {
        self.expect_ack(
            to,
            NodeRequest::Push {
                object_id,
                chunk_index,
                num_chunks,
                metadata_size,
                data,
            },
        )
        .await
    }

    async fn send_free_objects(&self, to: NodeId, object_ids: Vec<ObjectId>) -> Result<()> {
        self.expect_ack(
            to,
            NodeRequest::FreeObjects {
                object_ids,
                local_only: true,
            },
        )
        .await
    }

    async fn forward_task(&self, to: NodeId, task: Task) -> Result<()> {
        self.expect_ack(to, NodeRequest::ForwardTask { task }).await
    }
}
