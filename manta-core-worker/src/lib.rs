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

#[cfg(test)]
test_r::enable!();

pub mod actor_handle;
pub mod actor_manager;
pub mod context;
pub mod fiber;
pub mod memory_store;
pub mod raylet_client;
pub mod reference_counter;

use crate::actor_handle::ActorHandle;
use crate::actor_manager::ActorManager;
use crate::context::WorkerContext;
use crate::fiber::FiberPool;
use crate::memory_store::MemoryStore;
use crate::raylet_client::RayletClient;
use crate::reference_counter::ReferenceCounter;
use async_trait::async_trait;
use manta_common::config::CoreWorkerConfig;
use manta_common::error::{MantaError, Result};
use manta_common::model::{
    ActorId, ErrorTag, FunctionDescriptor, JobId, Language, ObjectId, ObjectValue, ResourceSet,
    Task, TaskArg, TaskId, TaskSpec, TaskSpecBuilder, WorkerId,
};
use manta_object_store::store::{PlasmaError, PlasmaStore, LOCAL_CLIENT};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    Driver,
    Worker,
}

#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub num_returns: u32,
    pub resources: ResourceSet,
    pub placement_resources: ResourceSet,
}

impl TaskOptions {
    pub fn returning(num_returns: u32) -> Self {
        TaskOptions {
            num_returns,
            ..TaskOptions::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActorCreationOptions {
    pub resources: ResourceSet,
    pub max_concurrency: usize,
}

/// Language-specific execution of one task: resolves the function behind
/// the descriptor and runs it over the materialized arguments.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        spec: &TaskSpec,
        arguments: Vec<ObjectValue>,
    ) -> Result<Vec<ObjectValue>>;
}

/// Per-process facade over the runtime: task submission, object access with
/// ownership tracking, and (in worker mode) the execution loop.
pub struct CoreWorker {
    mode: WorkerMode,
    language: Language,
    context: WorkerContext,
    raylet: Arc<dyn RayletClient>,
    plasma: Arc<PlasmaStore>,
    memory_store: Arc<MemoryStore>,
    reference_counter: Arc<ReferenceCounter>,
    fiber_pool: Arc<FiberPool>,
    actor_manager: Mutex<Option<Arc<ActorManager>>>,
    config: CoreWorkerConfig,
}

impl CoreWorker {
    pub async fn connect(
        mode: WorkerMode,
        language: Language,
        job_id: JobId,
        raylet: Arc<dyn RayletClient>,
        plasma: Arc<PlasmaStore>,
        config: CoreWorkerConfig,
    ) -> Result<Arc<CoreWorker>> {
        let worker_id = WorkerId::new_random();
        raylet
            .register(worker_id, language, mode == WorkerMode::Driver, job_id)
            .await?;
        let fiber_pool = FiberPool::new(config.max_concurrency);
        Ok(Arc::new(CoreWorker {
            mode,
            language,
            context: WorkerContext::new(worker_id, job_id),
            raylet,
            plasma,
            memory_store: Arc::new(MemoryStore::new()),
            reference_counter: Arc::new(ReferenceCounter::new()),
            fiber_pool,
            actor_manager: Mutex::new(None),
            config,
        }))
    }

    /// Attaches the actor liveness view; submissions to dead actors then
    /// fail fast instead of queueing forever.
    pub fn set_actor_manager(&self, actor_manager: Arc<ActorManager>) {
        *self.actor_manager.lock().unwrap() = Some(actor_manager);
    }

    pub fn mode(&self) -> WorkerMode {
        self.mode
    }

    pub fn worker_id(&self) -> WorkerId {
        self.context.worker_id()
    }

    pub fn context(&self) -> &WorkerContext {
        &self.context
    }

    pub fn memory_store(&self) -> &Arc<MemoryStore> {
        &self.memory_store
    }

    pub fn reference_counter(&self) -> &Arc<ReferenceCounter> {
        &self.reference_counter
    }

    // ----------------------------------------------------------------
    // Object interface
    // ----------------------------------------------------------------

    /// Stores a value and returns its id. The id is derived from the
    /// current task and the per-task put index, so re-executions reproduce
    /// it.
    pub fn put(&self, value: ObjectValue) -> Result<ObjectId> {
        let object_id =
            ObjectId::for_put(&self.context.current_task_id(), self.context.next_put_index());
        self.put_with_id(object_id, value)?;
        Ok(object_id)
    }

    fn put_with_id(&self, object_id: ObjectId, value: ObjectValue) -> Result<()> {
        match self.plasma.create(
            LOCAL_CLIENT,
            object_id,
            value.data.len(),
            value.metadata.len(),
            true,
        ) {
            Ok(_) => {
                self.plasma
                    .write(LOCAL_CLIENT, object_id, &value.data, &value.metadata)
                    .map_err(MantaError::from)?;
                self.plasma.seal(LOCAL_CLIENT, object_id);
                self.reference_counter.add_owned_object(object_id);
                Ok(())
            }
            Err(PlasmaError::ObjectExists) => Err(MantaError::object_exists(format!(
                "object {object_id} already exists"
            ))),
            Err(error) => Err(error.into()),
        }
    }

    /// Caches a small value in the worker-local store only; `get` serves it
    /// without touching the shared store. Used for direct-call results that
    /// never need to be visible to other nodes.
    pub fn put_local(&self, object_id: ObjectId, value: ObjectValue) -> Result<()> {
        self.memory_store.put(object_id, value)
    }

    /// Fetches objects, pulling or reconstructing them as needed. Missing
    /// entries after the timeout come back as `None`; error markers written
    /// by failed producers come back as values with an error tag.
    pub async fn get(
        &self,
        object_ids: &[ObjectId],
        timeout: Duration,
    ) -> Result<Vec<Option<ObjectValue>>> {
        let mut results: Vec<Option<ObjectValue>> = vec![None; object_ids.len()];

        // The in-memory store holds small direct-call results.
        let local = self.memory_store.get(object_ids, Duration::ZERO).await;
        let mut missing = Vec::new();
        for (i, value) in local.into_iter().enumerate() {
            match value {
                Some(value) => results[i] = Some(value),
                None => missing.push(object_ids[i]),
            }
        }
        if missing.is_empty() {
            return Ok(results);
        }

        self.raylet
            .fetch_or_reconstruct(missing.clone(), false, self.context.current_task_id())
            .await?;
        let fetched = self
            .plasma
            .get_wait(LOCAL_CLIENT, &missing, timeout)
            .await;
        self.raylet
            .notify_unblocked(self.context.current_task_id())
            .await?;

        for (object_id, value) in missing.iter().zip(fetched) {
            if let Some(value) = value {
                // The store pinned the object for us; the copy is ours, so
                // the pin can go right back.
                self.plasma.release(LOCAL_CLIENT, *object_id);
                for (i, wanted) in object_ids.iter().enumerate() {
                    if wanted == object_id && results[i].is_none() {
                        results[i] = Some(value.clone());
                    }
                }
            }
        }
        Ok(results)
    }

    /// Waits for `num_ready` of the objects to exist somewhere reachable.
    pub async fn wait(
        &self,
        object_ids: &[ObjectId],
        num_ready: usize,
        timeout: Duration,
    ) -> Result<Vec<bool>> {
        if num_ready > object_ids.len() {
            return Err(MantaError::invalid(
                "num_ready exceeds the number of object ids",
            ));
        }
        let (ready, _) = self
            .raylet
            .wait(object_ids.to_vec(), num_ready as u64, timeout)
            .await?;
        Ok(object_ids
            .iter()
            .map(|object_id| ready.contains(object_id))
            .collect())
    }

    pub async fn free(&self, object_ids: Vec<ObjectId>, local_only: bool) -> Result<()> {
        self.raylet.free_objects(object_ids, local_only).await
    }

    // ----------------------------------------------------------------
    // Task submission
    // ----------------------------------------------------------------

    /// Submits a stateless task; returns the ids its results will appear
    /// under.
    pub async fn submit_task(
        &self,
        function_descriptor: FunctionDescriptor,
        arguments: Vec<TaskArg>,
        options: TaskOptions,
    ) -> Result<Vec<ObjectId>> {
        let num_returns = options.num_returns.max(1);
        let spec = TaskSpecBuilder::new(
            self.context.job_id(),
            self.context.current_task_id(),
            self.context.next_task_index(),
            self.context.current_task_id(),
            self.language,
            function_descriptor,
            arguments,
            num_returns,
            options.resources,
            options.placement_resources,
        )
        .build();
        let return_ids = spec.return_ids();
        for object_id in &return_ids {
            self.reference_counter.add_owned_object(*object_id);
        }
        debug!(task_id = %spec.task_id, "submitting task");
        self.raylet.submit_task(Task::new(spec, vec![])).await?;
        Ok(return_ids)
    }

    /// Creates an actor and returns the handle its methods are called
    /// through.
    pub async fn create_actor(
        &self,
        function_descriptor: FunctionDescriptor,
        arguments: Vec<TaskArg>,
        options: ActorCreationOptions,
    ) -> Result<ActorHandle> {
        let submission_index = self.context.next_task_index();
        let task_id = TaskId::for_submitted_task(
            self.context.job_id(),
            &self.context.current_task_id(),
            submission_index,
            &ActorId::nil(),
        );
        let actor_id = ActorId::from_creation_task(&task_id);
        let spec = TaskSpecBuilder::new(
            self.context.job_id(),
            self.context.current_task_id(),
            submission_index,
            self.context.current_task_id(),
            self.language,
            function_descriptor.clone(),
            arguments,
            1,
            options.resources.clone(),
            options.resources,
        )
        .actor_creation(actor_id)
        .build();

        let initial_cursor = ObjectId::for_task_return(&spec.task_id, 0);
        self.reference_counter.add_owned_object(initial_cursor);
        let handle = ActorHandle::new(
            actor_id,
            self.context.job_id(),
            self.language,
            function_descriptor,
            initial_cursor,
            true,
        );
        debug!(%actor_id, task_id = %spec.task_id, "creating actor");
        self.raylet.submit_task(Task::new(spec, vec![])).await?;
        Ok(handle)
    }

    /// Submits a method call on an actor handle; the previous call's cursor
    /// is wired in as an execution dependency so calls run in submission
    /// order.
    pub async fn submit_actor_task(
        &self,
        handle: &mut ActorHandle,
        function_descriptor: FunctionDescriptor,
        arguments: Vec<TaskArg>,
        options: TaskOptions,
    ) -> Result<Vec<ObjectId>> {
        let dead = self
            .actor_manager
            .lock()
            .unwrap()
            .as_ref()
            .map(|manager| manager.is_dead(&handle.actor_id()))
            .unwrap_or(false);
        if dead {
            return Err(MantaError::key_error(format!(
                "actor {} is dead",
                handle.actor_id()
            )));
        }

        // One extra return for the next cursor.
        let num_returns = options.num_returns.max(1) + 1;
        let counter = handle.increase_task_counter();
        let new_actor_handles = handle.take_new_actor_handles();
        let spec = TaskSpecBuilder::new(
            handle.creation_job_id(),
            self.context.current_task_id(),
            self.context.next_task_index(),
            self.context.current_task_id(),
            handle.language(),
            function_descriptor,
            arguments,
            num_returns,
            options.resources,
            ResourceSet::new(),
        )
        .actor_task(
            handle.actor_id(),
            handle.handle_id(),
            counter,
            new_actor_handles,
        )
        .build();

        let mut return_ids = spec.return_ids();
        let previous_cursor = handle.actor_cursor();
        let new_cursor = *return_ids.last().expect("at least the cursor return");
        handle.set_actor_cursor(new_cursor);

        for object_id in &return_ids {
            self.reference_counter.add_owned_object(*object_id);
        }
        debug!(
            task_id = %spec.task_id,
            actor_id = %handle.actor_id(),
            counter,
            "submitting actor task"
        );
        self.raylet
            .submit_task(Task::new(spec, vec![previous_cursor]))
            .await?;
        return_ids.pop();
        Ok(return_ids)
    }

    pub async fn cancel_task(&self, task_id: TaskId) -> Result<bool> {
        self.raylet.cancel_task(task_id).await
    }

    // ----------------------------------------------------------------
    // Execution loop (worker role)
    // ----------------------------------------------------------------

    /// The blocking receive loop of a worker process: takes assignments from
    /// the node manager until it shuts down.
    pub async fn run_task_loop(self: &Arc<Self>, executor: Arc<dyn TaskExecutor>) -> Result<()> {
        if self.mode != WorkerMode::Worker {
            return Err(MantaError::invalid("drivers do not run the task loop"));
        }
        loop {
            let task = match self.raylet.get_task(self.context.worker_id()).await {
                Ok(task) => task,
                Err(MantaError::Interrupted { .. }) => break,
                Err(error) => return Err(error),
            };
            self.execute_task(task, &executor).await;
        }
        self.fiber_pool.shut_down();
        Ok(())
    }

    async fn execute_task(self: &Arc<Self>, task: Task, executor: &Arc<dyn TaskExecutor>) {
        let spec = task.spec.clone();
        let task_id = spec.task_id;
        self.context.set_current_task(task_id);

        let arguments = match self.resolve_arguments(&spec).await {
            Ok(arguments) => arguments,
            Err(error) => {
                warn!(%task_id, %error, "argument resolution failed");
                self.fail_returns(&spec);
                let _ = self
                    .raylet
                    .task_done(self.context.worker_id(), task_id)
                    .await;
                return;
            }
        };

        let outcome = if spec.is_actor_task() {
            self.fiber_pool
                .run(executor.execute(&spec, arguments))
                .await
                .unwrap_or_else(|| Err(MantaError::interrupted("worker shutting down")))
        } else {
            executor.execute(&spec, arguments).await
        };

        match outcome {
            Ok(returns) => self.store_returns(&spec, returns),
            Err(error) => {
                warn!(%task_id, %error, "task execution failed");
                self.fail_returns(&spec);
            }
        }

        let _ = self
            .raylet
            .task_done(self.context.worker_id(), task_id)
            .await;
    }

    async fn resolve_arguments(&self, spec: &TaskSpec) -> Result<Vec<ObjectValue>> {
        let references = spec.dependencies();
        if !references.is_empty() {
            self.raylet
                .fetch_or_reconstruct(references.clone(), false, spec.task_id)
                .await?;
        }

        let mut arguments = Vec::with_capacity(spec.arguments.len());
        for argument in &spec.arguments {
            match argument {
                TaskArg::Value(data) => {
                    arguments.push(ObjectValue::from_data(data.clone()));
                }
                TaskArg::Reference(object_id) => {
                    let value = self
                        .plasma
                        .get_wait(LOCAL_CLIENT, &[*object_id], self.config.get_timeout)
                        .await
                        .pop()
                        .flatten()
                        .ok_or_else(|| {
                            MantaError::timed_out(format!("argument {object_id} did not arrive"))
                        })?;
                    self.plasma.release(LOCAL_CLIENT, *object_id);
                    if let Some(tag) = value.error_tag() {
                        // Failed dependencies propagate by default.
                        return Err(match tag {
                            ErrorTag::IntentionalSystemExit => MantaError::IntentionalSystemExit,
                            ErrorTag::UnexpectedSystemExit => MantaError::UnexpectedSystemExit,
                            ErrorTag::TaskFailed => MantaError::interrupted(format!(
                                "dependency {object_id} failed upstream"
                            )),
                        });
                    }
                    arguments.push(value);
                }
            }
        }

        if !references.is_empty() {
            self.raylet.notify_unblocked(spec.task_id).await?;
        }
        Ok(arguments)
    }

    /// Stores the execution results under the precomputed return ids. Actor
    /// tasks leave their trailing dummy return to the node manager.
    fn store_returns(&self, spec: &TaskSpec, returns: Vec<ObjectValue>) {
        let user_returns = if spec.is_actor_task() {
            spec.num_returns - 1
        } else {
            spec.num_returns
        } as usize;

        for index in 0..user_returns {
            let object_id = ObjectId::for_task_return(&spec.task_id, index as u32);
            let value = returns
                .get(index)
                .cloned()
                .unwrap_or_else(|| ObjectValue::from_data(Vec::new()));
            match self.put_with_id(object_id, value) {
                Ok(()) => {}
                // A re-executed task found its result already in place.
                Err(MantaError::ObjectExists { .. }) => {}
                Err(error) => {
                    warn!(%object_id, %error, "failed to store task return");
                }
            }
        }
    }

    fn fail_returns(&self, spec: &TaskSpec) {
        let user_returns = if spec.is_actor_task() {
            spec.num_returns - 1
        } else {
            spec.num_returns
        } as usize;
        for index in 0..user_returns {
            let object_id = ObjectId::for_task_return(&spec.task_id, index as u32);
            match self.put_with_id(object_id, ObjectValue::error(ErrorTag::TaskFailed)) {
                Ok(()) | Err(MantaError::ObjectExists { .. }) => {}
                Err(error) => warn!(%object_id, %error, "failed to store failure marker"),
            }
        }
    }
}
