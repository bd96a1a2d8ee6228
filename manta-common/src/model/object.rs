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

use crate::model::ids::{NodeId, ObjectId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

const ERROR_METADATA_PREFIX: &[u8] = b"__error__:";

/// Marker written into the metadata of a return object when the producing
/// task cannot deliver a value, so that any waiter resolves instead of
/// hanging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorTag {
    TaskFailed,
    IntentionalSystemExit,
    UnexpectedSystemExit,
}

impl ErrorTag {
    fn as_str(&self) -> &'static str {
        match self {
            ErrorTag::TaskFailed => "TASK_FAILED",
            ErrorTag::IntentionalSystemExit => "INTENTIONAL_SYSTEM_EXIT",
            ErrorTag::UnexpectedSystemExit => "UNEXPECTED_SYSTEM_EXIT",
        }
    }

    fn from_str(s: &str) -> Option<ErrorTag> {
        match s {
            "TASK_FAILED" => Some(ErrorTag::TaskFailed),
            "INTENTIONAL_SYSTEM_EXIT" => Some(ErrorTag::IntentionalSystemExit),
            "UNEXPECTED_SYSTEM_EXIT" => Some(ErrorTag::UnexpectedSystemExit),
            _ => None,
        }
    }
}

impl Display for ErrorTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An object value as it travels between stores: user data plus opaque
/// metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectValue {
    pub data: Bytes,
    pub metadata: Bytes,
}

impl ObjectValue {
    pub fn new(data: impl Into<Bytes>, metadata: impl Into<Bytes>) -> Self {
        ObjectValue {
            data: data.into(),
            metadata: metadata.into(),
        }
    }

    pub fn from_data(data: impl Into<Bytes>) -> Self {
        ObjectValue {
            data: data.into(),
            metadata: Bytes::new(),
        }
    }

    pub fn error(tag: ErrorTag) -> Self {
        let mut metadata = Vec::with_capacity(ERROR_METADATA_PREFIX.len() + 32);
        metadata.extend_from_slice(ERROR_METADATA_PREFIX);
        metadata.extend_from_slice(tag.as_str().as_bytes());
        ObjectValue {
            data: Bytes::new(),
            metadata: metadata.into(),
        }
    }

    pub fn error_tag(&self) -> Option<ErrorTag> {
        let rest = self.metadata.strip_prefix(ERROR_METADATA_PREFIX)?;
        ErrorTag::from_str(std::str::from_utf8(rest).ok()?)
    }

    pub fn is_error(&self) -> bool {
        self.error_tag().is_some()
    }

    pub fn size(&self) -> usize {
        self.data.len() + self.metadata.len()
    }
}

/// Summary record pushed on the sealed-object notification channel and fed
/// to the object directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub object_id: ObjectId,
    pub data_size: u64,
    pub metadata_size: u64,
    pub content_hash: u64,
}

impl ObjectInfo {
    pub fn total_size(&self) -> u64 {
        self.data_size + self.metadata_size
    }
}

/// One entry of an object-location feed: which node gained or lost a copy,
/// and where the object went if it was spilled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectLocationUpdate {
    pub object_id: ObjectId,
    pub node_ids: Vec<NodeId>,
    pub spilled_url: Option<String>,
    pub size: Option<u64>,
}
