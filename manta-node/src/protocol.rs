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

use bytes::Bytes;
use manta_common::error::MantaError;
use manta_common::frame::Frame;
use manta_common::model::{
    JobId, Language, NodeId, ObjectId, ObjectLocationUpdate, ResourceSet, Task, TaskId, WorkerId,
};
use manta_common::serialization::{deserialize, serialize};
use serde::{Deserialize, Serialize};

pub mod message_type {
    pub const REGISTER_CLIENT_REQUEST: u64 = 1;
    pub const SUBMIT_TASK: u64 = 2;
    pub const GET_TASK: u64 = 3;
    pub const TASK_DONE: u64 = 4;
    pub const FETCH_OR_RECONSTRUCT: u64 = 5;
    pub const NOTIFY_UNBLOCKED: u64 = 6;
    pub const WAIT: u64 = 7;
    pub const CANCEL_TASK: u64 = 8;
    pub const FREE_OBJECTS: u64 = 9;

    pub const FORWARD_TASK: u64 = 20;
    pub const PULL: u64 = 21;
    pub const PUSH: u64 = 22;

    pub const ADD_OBJECT_LOCATION_OWNER: u64 = 30;
    pub const REMOVE_OBJECT_LOCATION_OWNER: u64 = 31;
    pub const GET_OBJECT_LOCATIONS_OWNER: u64 = 32;

    pub const REPLY: u64 = 100;
    pub const EXECUTE_TASK: u64 = 101;
}

/// Messages accepted on the node-manager socket, from local workers and
/// peer node managers alike.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeRequest {
    RegisterClient {
        worker_id: WorkerId,
        language: Language,
        is_driver: bool,
        job_id: JobId,
    },
    SubmitTask {
        task: Task,
    },
    /// Long poll: the reply is the next `ExecuteTask` for this worker.
    GetTask {
        worker_id: WorkerId,
    },
    TaskDone {
        worker_id: WorkerId,
        task_id: TaskId,
    },
    FetchOrReconstruct {
        object_ids: Vec<ObjectId>,
        fetch_only: bool,
        task_id: TaskId,
    },
    NotifyUnblocked {
        task_id: TaskId,
    },
    Wait {
        object_ids: Vec<ObjectId>,
        num_ready: u64,
        timeout_ms: u64,
    },
    CancelTask {
        task_id: TaskId,
    },
    FreeObjects {
        object_ids: Vec<ObjectId>,
        local_only: bool,
    },
    ForwardTask {
        task: Task,
    },
    Pull {
        object_id: ObjectId,
        requester: NodeId,
    },
    Push {
        object_id: ObjectId,
        chunk_index: u64,
        num_chunks: u64,
        metadata_size: u64,
        data: Bytes,
    },
    AddObjectLocationOwner {
        object_id: ObjectId,
        node_id: NodeId,
        size: Option<u64>,
    },
    RemoveObjectLocationOwner {
        object_id: ObjectId,
        node_id: NodeId,
    },
    GetObjectLocationsOwner {
        object_id: ObjectId,
        last_version: u64,
    },
}

impl NodeRequest {
    pub fn message_type(&self) -> u64 {
        use message_type::*;
        match self {
            NodeRequest::RegisterClient { .. } => REGISTER_CLIENT_REQUEST,
            NodeRequest::SubmitTask { .. } => SUBMIT_TASK,
            NodeRequest::GetTask { .. } => GET_TASK,
            NodeRequest::TaskDone { .. } => TASK_DONE,
            NodeRequest::FetchOrReconstruct { .. } => FETCH_OR_RECONSTRUCT,
            NodeRequest::NotifyUnblocked { .. } => NOTIFY_UNBLOCKED,
            NodeRequest::Wait { .. } => WAIT,
            NodeRequest::CancelTask { .. } => CANCEL_TASK,
            NodeRequest::FreeObjects { .. } => FREE_OBJECTS,
            NodeRequest::ForwardTask { .. } => FORWARD_TASK,
            NodeRequest::Pull { .. } => PULL,
            NodeRequest::Push { .. } => PUSH,
            NodeRequest::AddObjectLocationOwner { .. } => ADD_OBJECT_LOCATION_OWNER,
            NodeRequest::RemoveObjectLocationOwner { .. } => REMOVE_OBJECT_LOCATION_OWNER,
            NodeRequest::GetObjectLocationsOwner { .. } => GET_OBJECT_LOCATIONS_OWNER,
        }
    }

    pub fn to_frame(&self) -> Result<Frame, MantaError> {
        Ok(Frame::new(self.message_type(), serialize(self)?))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, MantaError> {
        deserialize(&frame.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeReply {
    Registered {
        /// Initial resource assignment of the connecting worker.
        assigned_resources: ResourceSet,
    },
    ExecuteTask {
        task: Task,
    },
    WaitReply {
        ready: Vec<ObjectId>,
        remaining: Vec<ObjectId>,
    },
    CancelReply {
        canceled: bool,
    },
    LocationsOwner {
        version: u64,
        update: ObjectLocationUpdate,
    },
    Ack,
    Error {
        error: MantaError,
    },
}

impl NodeReply {
    pub fn message_type(&self) -> u64 {
        match self {
            NodeReply::ExecuteTask { .. } => message_type::EXECUTE_TASK,
            _ => message_type::REPLY,
        }
    }

    pub fn to_frame(&self) -> Result<Frame, MantaError> {
        Ok(Frame::new(self.message_type(), serialize(self)?))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, MantaError> {
        deserialize(&frame.payload)
    }
}
