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

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use xxhash_rust::xxh64::xxh64;

/// Return-index objects and put-index objects share the trailing four bytes
/// of an object id; puts carry this marker bit so the two families never
/// collide.
const PUT_INDEX_MARKER: u32 = 0x8000_0000;

fn digest16(parts: &[&[u8]]) -> [u8; 16] {
    let mut buf = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
    for part in parts {
        buf.extend_from_slice(part);
    }
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&xxh64(&buf, 0).to_le_bytes());
    out[8..].copy_from_slice(&xxh64(&buf, 1).to_le_bytes());
    out
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::fill(&mut bytes[..]);
    bytes
}

macro_rules! fixed_width_id {
    ($name:ident, $width:expr) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub [u8; $width]);

        impl $name {
            pub const WIDTH: usize = $width;

            pub fn nil() -> Self {
                Self([0u8; $width])
            }

            pub fn is_nil(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            pub fn from_bytes(bytes: [u8; $width]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $width] {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s)
                    .map_err(|err| format!("invalid {}: {err}", stringify!($name)))?;
                let bytes: [u8; $width] = bytes.try_into().map_err(|_| {
                    format!("invalid {}: expected {} bytes", stringify!($name), $width)
                })?;
                Ok(Self(bytes))
            }
        }
    };
}

fixed_width_id!(JobId, 4);
fixed_width_id!(TaskId, 24);
fixed_width_id!(ObjectId, 28);
fixed_width_id!(ActorId, 16);
fixed_width_id!(ActorHandleId, 16);
fixed_width_id!(WorkerId, 16);
fixed_width_id!(NodeId, 16);

impl JobId {
    pub fn new_random() -> Self {
        Self(random_bytes())
    }
}

impl WorkerId {
    pub fn new_random() -> Self {
        Self(random_bytes())
    }
}

impl NodeId {
    pub fn new_random() -> Self {
        Self(random_bytes())
    }
}

impl TaskId {
    /// Derives the id of a submitted task. The layout is
    /// `job id (4) || submission index (4) || parent digest (16)`; the digest
    /// folds in the parent task id and, for actor tasks, the actor id, so
    /// re-executing the same parent reproduces the same child ids while
    /// different parents never collide.
    pub fn for_submitted_task(
        job_id: JobId,
        parent_task_id: &TaskId,
        submission_index: u32,
        actor_id: &ActorId,
    ) -> Self {
        let mut bytes = [0u8; 24];
        bytes[..4].copy_from_slice(job_id.as_bytes());
        bytes[4..8].copy_from_slice(&submission_index.to_le_bytes());
        bytes[8..].copy_from_slice(&digest16(&[
            parent_task_id.as_bytes(),
            actor_id.as_bytes(),
        ]));
        Self(bytes)
    }

    /// The implicit task every driver process holds while it is alive. It is
    /// the root of the submission-index namespace for that driver.
    pub fn for_driver(job_id: JobId, driver_nonce: &WorkerId) -> Self {
        let mut bytes = [0u8; 24];
        bytes[..4].copy_from_slice(job_id.as_bytes());
        bytes[8..].copy_from_slice(&digest16(&[driver_nonce.as_bytes()]));
        Self(bytes)
    }

    pub fn job_id(&self) -> JobId {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.0[..4]);
        JobId(bytes)
    }

    pub fn submission_index(&self) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.0[4..8]);
        u32::from_le_bytes(bytes)
    }
}

impl ObjectId {
    /// Id of the `i`-th return value of a task. Indexing starts at 1 so the
    /// trailing word of a return object is never zero.
    pub fn for_task_return(task_id: &TaskId, return_index: u32) -> Self {
        Self::compose(task_id, return_index.checked_add(1).expect("return index overflow"))
    }

    /// Id of the `put_index`-th object the task stored explicitly.
    pub fn for_put(task_id: &TaskId, put_index: u32) -> Self {
        Self::compose(task_id, PUT_INDEX_MARKER | (put_index + 1))
    }

    fn compose(task_id: &TaskId, index: u32) -> Self {
        let mut bytes = [0u8; 28];
        bytes[..24].copy_from_slice(task_id.as_bytes());
        bytes[24..].copy_from_slice(&index.to_le_bytes());
        Self(bytes)
    }

    /// The task that produces (or produced) this object; the anchor for
    /// reconstruction.
    pub fn task_id(&self) -> TaskId {
        let mut bytes = [0u8; 24];
        bytes.copy_from_slice(&self.0[..24]);
        TaskId(bytes)
    }

    pub fn is_put(&self) -> bool {
        self.index_word() & PUT_INDEX_MARKER != 0
    }

    pub fn is_return(&self) -> bool {
        !self.is_put()
    }

    fn index_word(&self) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.0[24..]);
        u32::from_le_bytes(bytes)
    }
}

impl ActorId {
    /// Actors are named by a digest of their creation task, which also serves
    /// as the namespace of their dummy return objects.
    pub fn from_creation_task(task_id: &TaskId) -> Self {
        Self(digest16(&[task_id.as_bytes()]))
    }
}

impl ActorHandleId {
    /// A forked handle's id is derived from the parent handle and the
    /// parent's fork ordinal, so both sides of a fork agree on it without
    /// communicating.
    pub fn for_fork(parent: &ActorHandleId, fork_index: u64) -> Self {
        Self(digest16(&[parent.as_bytes(), &fork_index.to_le_bytes()]))
    }
}
