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

pub mod ids;
pub mod object;
pub mod resources;
pub mod task;

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

pub use ids::*;
pub use object::*;
pub use resources::*;
pub use task::*;

/// Language of the user code behind a function descriptor. The runtime never
/// interprets function payloads itself, but workers only accept tasks of
/// their own language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    Rust,
    Python,
    Java,
}

impl Display for Language {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Language::Rust => write!(f, "rust"),
            Language::Python => write!(f, "python"),
            Language::Java => write!(f, "java"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    Normal,
    ActorCreation,
    Actor,
}

impl Display for TaskType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::Normal => write!(f, "normal"),
            TaskType::ActorCreation => write!(f, "actor-creation"),
            TaskType::Actor => write!(f, "actor"),
        }
    }
}

/// Liveness of an actor as published through the actor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorState {
    Alive,
    Reconstructing,
    Dead,
}

impl Display for ActorState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorState::Alive => write!(f, "alive"),
            ActorState::Reconstructing => write!(f, "reconstructing"),
            ActorState::Dead => write!(f, "dead"),
        }
    }
}

/// Network identity of a node manager, published in the heartbeat and node
/// tables so that peers can open connections to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl Display for NodeAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Network identity of a worker process, used by the ownership-based object
/// directory to reach an object's owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerAddress {
    pub worker_id: WorkerId,
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
}
