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

use crate::model::ids::{ActorHandleId, ActorId, JobId, ObjectId, TaskId};
use crate::model::resources::ResourceSet;
use crate::model::{Language, TaskType};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use xxhash_rust::xxh64::Xxh64;

/// Opaque identifier of a piece of user code. Workers resolve it through
/// their language-specific function registry; the scheduler only hashes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionDescriptor(pub Vec<String>);

impl FunctionDescriptor {
    pub fn new(parts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        FunctionDescriptor(parts.into_iter().map(|part| part.into()).collect())
    }
}

impl Display for FunctionDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// One task argument, either inlined at submission time or a reference into
/// the object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskArg {
    Value(Vec<u8>),
    Reference(ObjectId),
}

impl TaskArg {
    pub fn reference(&self) -> Option<&ObjectId> {
        match self {
            TaskArg::Reference(id) => Some(id),
            TaskArg::Value(_) => None,
        }
    }
}

/// Tasks are grouped into scheduling classes by what they run and what they
/// demand; fairness and queueing are per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchedulingClass(pub u64);

impl Display for SchedulingClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Immutable description of a single task invocation. Built once by the
/// submitting worker and never modified afterwards; everything the runtime
/// mutates while the task moves through the system lives in
/// [`TaskExecutionSpec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub parent_task_id: TaskId,
    pub caller_id: TaskId,
    pub language: Language,
    pub function_descriptor: FunctionDescriptor,
    pub arguments: Vec<TaskArg>,
    pub num_returns: u32,
    pub required_resources: ResourceSet,
    pub required_placement_resources: ResourceSet,
    pub task_type: TaskType,
    pub actor_id: ActorId,
    pub actor_handle_id: ActorHandleId,
    pub actor_counter: u64,
    pub new_actor_handles: Vec<ActorHandleId>,
}

impl TaskSpec {
    pub fn is_actor_task(&self) -> bool {
        self.task_type == TaskType::Actor
    }

    pub fn is_actor_creation_task(&self) -> bool {
        self.task_type == TaskType::ActorCreation
    }

    pub fn return_ids(&self) -> Vec<ObjectId> {
        (0..self.num_returns)
            .map(|i| ObjectId::for_task_return(&self.task_id, i))
            .collect()
    }

    /// Actor methods carry one extra dummy return used as the execution
    /// cursor of the next call on the same handle.
    pub fn actor_dummy_object_id(&self) -> Option<ObjectId> {
        if self.is_actor_task() || self.is_actor_creation_task() {
            Some(ObjectId::for_task_return(
                &self.task_id,
                self.num_returns - 1,
            ))
        } else {
            None
        }
    }

    /// By-reference arguments, deduplicated, in argument order.
    pub fn dependencies(&self) -> Vec<ObjectId> {
        let mut seen = std::collections::HashSet::new();
        self.arguments
            .iter()
            .filter_map(|arg| arg.reference())
            .filter(|id| seen.insert(**id))
            .copied()
            .collect()
    }

    /// Placement demand falls back to the runtime demand when the caller did
    /// not override it.
    pub fn placement_resources(&self) -> &ResourceSet {
        if self.required_placement_resources.is_empty() {
            &self.required_resources
        } else {
            &self.required_placement_resources
        }
    }

    pub fn scheduling_class(&self) -> SchedulingClass {
        let mut hasher = Xxh64::new(0);
        for part in &self.function_descriptor.0 {
            hasher.update(part.as_bytes());
            hasher.update(&[0]);
        }
        for (name, quantity) in self.required_resources.iter() {
            hasher.update(name.as_bytes());
            hasher.update(&quantity.raw().to_le_bytes());
        }
        SchedulingClass(hasher.digest())
    }
}

/// Mutable companion of a [`TaskSpec`] while the task is queued, forwarded
/// and dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskExecutionSpec {
    pub num_forwards: u32,
    pub execution_dependencies: Vec<ObjectId>,
}

/// A task as shipped between node managers: the immutable spec plus its
/// mutable execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub spec: TaskSpec,
    pub execution_spec: TaskExecutionSpec,
}

impl Task {
    pub fn new(spec: TaskSpec, execution_dependencies: Vec<ObjectId>) -> Self {
        Task {
            spec,
            execution_spec: TaskExecutionSpec {
                num_forwards: 0,
                execution_dependencies,
            },
        }
    }

    /// Everything that must be local before dispatch: argument references
    /// plus execution dependencies such as the previous actor cursor.
    pub fn all_dependencies(&self) -> Vec<ObjectId> {
        let mut deps = self.spec.dependencies();
        for dep in &self.execution_spec.execution_dependencies {
            if !deps.contains(dep) {
                deps.push(*dep);
            }
        }
        deps
    }
}

pub struct TaskSpecBuilder {
    spec: TaskSpec,
}

impl TaskSpecBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: JobId,
        parent_task_id: TaskId,
        submission_index: u32,
        caller_id: TaskId,
        language: Language,
        function_descriptor: FunctionDescriptor,
        arguments: Vec<TaskArg>,
        num_returns: u32,
        required_resources: ResourceSet,
        required_placement_resources: ResourceSet,
    ) -> Self {
        let task_id =
            TaskId::for_submitted_task(job_id, &parent_task_id, submission_index, &ActorId::nil());
        TaskSpecBuilder {
            spec: TaskSpec {
                task_id,
                job_id,
                parent_task_id,
                caller_id,
                language,
                function_descriptor,
                arguments,
                num_returns,
                required_resources,
                required_placement_resources,
                task_type: TaskType::Normal,
                actor_id: ActorId::nil(),
                actor_handle_id: ActorHandleId::nil(),
                actor_counter: 0,
                new_actor_handles: Vec::new(),
            },
        }
    }

    pub fn actor_creation(mut self, actor_id: ActorId) -> Self {
        self.spec.task_type = TaskType::ActorCreation;
        self.spec.actor_id = actor_id;
        self
    }

    pub fn actor_task(
        mut self,
        actor_id: ActorId,
        actor_handle_id: ActorHandleId,
        actor_counter: u64,
        new_actor_handles: Vec<ActorHandleId>,
    ) -> Self {
        self.spec.task_type = TaskType::Actor;
        self.spec.actor_id = actor_id;
        self.spec.actor_handle_id = actor_handle_id;
        self.spec.actor_counter = actor_counter;
        self.spec.new_actor_handles = new_actor_handles;
        // Rebind the task id to the actor's namespace so re-submissions of
        // the same call derive the same id.
        self.spec.task_id = TaskId::for_submitted_task(
            self.spec.job_id,
            &self.spec.parent_task_id,
            self.spec.task_id.submission_index(),
            &actor_id,
        );
        self
    }

    pub fn build(self) -> TaskSpec {
        self.spec
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::model::ids::WorkerId;

    fn driver_task() -> TaskId {
        TaskId::for_driver(JobId::from_bytes([1, 0, 0, 1]), &WorkerId::from_bytes([2u8; 16]))
    }

    fn spec(descriptor: &str, cpus: i64, index: u32) -> TaskSpec {
        TaskSpecBuilder::new(
            JobId::from_bytes([1, 0, 0, 1]),
            driver_task(),
            index,
            driver_task(),
            Language::Rust,
            FunctionDescriptor::new([descriptor]),
            vec![],
            1,
            ResourceSet::from_units(&[(crate::model::CPU_RESOURCE, cpus)]),
            ResourceSet::new(),
        )
        .build()
    }

    #[test]
    fn scheduling_class_groups_by_function_and_demand() {
        assert_eq!(
            spec("inc", 1, 0).scheduling_class(),
            spec("inc", 1, 1).scheduling_class()
        );
        assert_ne!(
            spec("inc", 1, 0).scheduling_class(),
            spec("inc", 2, 0).scheduling_class()
        );
        assert_ne!(
            spec("inc", 1, 0).scheduling_class(),
            spec("dec", 1, 0).scheduling_class()
        );
    }

    #[test]
    fn dependencies_deduplicate_references() {
        let o = ObjectId::for_task_return(&driver_task(), 0);
        let mut s = spec("f", 1, 0);
        s.arguments = vec![
            TaskArg::Reference(o),
            TaskArg::Value(vec![1]),
            TaskArg::Reference(o),
        ];
        assert_eq!(s.dependencies(), vec![o]);
    }

    #[test]
    fn placement_resources_fall_back_to_runtime_demand() {
        let s = spec("f", 2, 0);
        assert_eq!(s.placement_resources(), &s.required_resources);
    }

    #[test]
    fn actor_dummy_object_is_last_return() {
        let mut s = spec("m", 1, 0);
        let actor_id = ActorId::from_creation_task(&driver_task());
        s = TaskSpecBuilder { spec: s }
            .actor_task(actor_id, ActorHandleId::nil(), 0, vec![])
            .build();
        s.num_returns = 2;
        assert_eq!(
            s.actor_dummy_object_id(),
            Some(ObjectId::for_task_return(&s.task_id, 1))
        );
    }
}
