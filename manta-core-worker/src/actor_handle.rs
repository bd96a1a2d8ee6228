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

use manta_common::error::Result;
use manta_common::model::{
    ActorHandleId, ActorId, FunctionDescriptor, JobId, Language, ObjectId,
};
use manta_common::serialization::{deserialize, serialize};
use serde::{Deserialize, Serialize};

/// Transferable reference to an actor. The persistent part travels between
/// processes; the counters restart at zero on every fork so each handle has
/// its own strictly ordered call stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorHandle {
    actor_id: ActorId,
    handle_id: ActorHandleId,
    creation_job_id: JobId,
    language: Language,
    function_descriptor: FunctionDescriptor,
    /// The dummy object of the previous call on this handle; the execution
    /// dependency of the next one.
    actor_cursor: ObjectId,
    is_direct_call: bool,
    task_counter: u64,
    num_forks: u64,
    /// Handles forked since the last submission on this handle; shipped with
    /// the next task so the backend can track cursor objects per handle.
    #[serde(skip)]
    new_actor_handles: Vec<ActorHandleId>,
}

impl ActorHandle {
    pub fn new(
        actor_id: ActorId,
        creation_job_id: JobId,
        language: Language,
        function_descriptor: FunctionDescriptor,
        initial_cursor: ObjectId,
        is_direct_call: bool,
    ) -> Self {
        ActorHandle {
            actor_id,
            handle_id: ActorHandleId::nil(),
            creation_job_id,
            language,
            function_descriptor,
            actor_cursor: initial_cursor,
            is_direct_call,
            task_counter: 0,
            num_forks: 0,

            new_actor_handles: Vec::new(),
        }
    }

    pub fn actor_id(&self) -> ActorId {
        self.actor_id
    }

    pub fn handle_id(&self) -> ActorHandleId {
        self.handle_id
    }

    pub fn creation_job_id(&self) -> JobId {
        self.creation_job_id
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn function_descriptor(&self) -> &FunctionDescriptor {
        &self.function_descriptor
    }

    pub fn actor_cursor(&self) -> ObjectId {
        self.actor_cursor
    }

    pub fn is_direct_call(&self) -> bool {
        self.is_direct_call
    }

    pub fn task_counter(&self) -> u64 {
        self.task_counter
    }

    pub fn num_forks(&self) -> u64 {
        self.num_forks
    }

    pub fn set_actor_cursor(&mut self, cursor: ObjectId) {
        self.actor_cursor = cursor;
    }

    /// Returns the counter to use for the next submission and advances it.
    pub fn increase_task_counter(&mut self) -> u64 {
        let current = self.task_counter;
        self.task_counter += 1;
        current
    }

    /// Forks a child handle: the child gets a derived handle id and fresh
    /// counters; the parent remembers the child until its next submission.
    pub fn fork(&mut self) -> ActorHandle {
        self.num_forks += 1;
        let child_handle_id = ActorHandleId::for_fork(&self.handle_id, self.num_forks);
        self.new_actor_handles.push(child_handle_id);
        ActorHandle {
            actor_id: self.actor_id,
            handle_id: child_handle_id,
            creation_job_id: self.creation_job_id,
            language: self.language,
            function_descriptor: self.function_descriptor.clone(),
            actor_cursor: self.actor_cursor,
            is_direct_call: self.is_direct_call,
            task_counter: 0,
            num_forks: 0,
            new_actor_handles: Vec::new(),
        }
    }

    /// The forked handle ids to attach to the next task, clearing the list.
    pub fn take_new_actor_handles(&mut self) -> Vec<ActorHandleId> {
        std::mem::take(&mut self.new_actor_handles)
    }

    pub fn serialize_to_bytes(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn deserialize_from_bytes(data: &[u8]) -> Result<ActorHandle> {
        deserialize(data)
    }
}
