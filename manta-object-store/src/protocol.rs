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

use crate::store::{PlasmaError, PlasmaObject};
use manta_common::error::MantaError;
use manta_common::frame::Frame;
use manta_common::model::{ObjectId, ObjectInfo, ObjectValue};
use manta_common::serialization::{deserialize, serialize};
use serde::{Deserialize, Serialize};

pub mod message_type {
    pub const CREATE_REQUEST: u64 = 1;
    pub const SEAL_REQUEST: u64 = 2;
    pub const GET_REQUEST: u64 = 3;
    pub const RELEASE_REQUEST: u64 = 4;
    pub const DELETE_REQUEST: u64 = 5;
    pub const EVICT_REQUEST: u64 = 6;
    pub const WAIT_REQUEST: u64 = 7;
    pub const SUBSCRIBE_REQUEST: u64 = 8;

    pub const REPLY: u64 = 100;
    pub const NOTIFICATION: u64 = 200;
}

/// Requests accepted on the store socket. Sealing carries the payload, which
/// stands in for the out-of-band shared-memory write of the descriptor
/// returned by create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlasmaRequest {
    Create {
        object_id: ObjectId,
        data_size: u64,
        metadata_size: u64,
    },
    Seal {
        object_id: ObjectId,
        value: ObjectValue,
    },
    Get {
        object_ids: Vec<ObjectId>,
        timeout_ms: u64,
    },
    Release {
        object_id: ObjectId,
    },
    Delete {
        object_ids: Vec<ObjectId>,
    },
    Evict {
        num_bytes: u64,
    },
    Wait {
        object_ids: Vec<ObjectId>,
        num_ready: u64,
        timeout_ms: u64,
    },
    Subscribe,
}

impl PlasmaRequest {
    pub fn message_type(&self) -> u64 {
        match self {
            PlasmaRequest::Create { .. } => message_type::CREATE_REQUEST,
            PlasmaRequest::Seal { .. } => message_type::SEAL_REQUEST,
            PlasmaRequest::Get { .. } => message_type::GET_REQUEST,
            PlasmaRequest::Release { .. } => message_type::RELEASE_REQUEST,
            PlasmaRequest::Delete { .. } => message_type::DELETE_REQUEST,
            PlasmaRequest::Evict { .. } => message_type::EVICT_REQUEST,
            PlasmaRequest::Wait { .. } => message_type::WAIT_REQUEST,
            PlasmaRequest::Subscribe => message_type::SUBSCRIBE_REQUEST,
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
pub enum PlasmaReply {
    Create {
        result: Result<PlasmaObject, PlasmaError>,
    },
    Seal {
        result: Result<ObjectInfo, PlasmaError>,
    },
    Get {
        results: Vec<Option<ObjectValue>>,
    },
    Release,
    Delete,
    Evict {
        bytes_freed: u64,
    },
    Wait {
        ready: Vec<ObjectId>,
        remaining: Vec<ObjectId>,
    },
    Subscribed,
    Error {
        error: MantaError,
    },
    Notification {
        info: ObjectInfo,
    },
}

impl PlasmaReply {
    pub fn message_type(&self) -> u64 {
        match self {
            PlasmaReply::Notification { .. } => message_type::NOTIFICATION,
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
